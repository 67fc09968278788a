use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use trtinfer_core::{Dims, OptimizationProfile, PrecisionMode};
use trtinfer_trt::{CalibrationConfig, CalibratorKind, Session, SessionConfig};

#[derive(Parser)]
#[command(name = "trtinfer", about = "Build, inspect and benchmark TensorRT engines")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// GPU device ordinal.
    #[arg(long, global = true)]
    pub device: Option<usize>,

    /// Path to a session config file (JSON).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load the cached engine or build it from the model, then list bindings.
    Build {
        #[command(flatten)]
        session: SessionArgs,
        /// Print bindings as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Load a serialized engine and list its bindings.
    Inspect {
        /// Serialized engine file.
        #[arg(long, required = true)]
        engine: PathBuf,
        /// Print bindings as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Time copy-in, forward and copy-out with zero-filled inputs.
    Bench {
        #[command(flatten)]
        session: SessionArgs,
        /// Timed iterations.
        #[arg(long, default_value = "100")]
        iterations: u32,
        /// Untimed warm-up iterations.
        #[arg(long, default_value = "5")]
        warmup: u32,
    },
}

/// Session settings; each flag overrides the config file.
#[derive(Args, Debug, Default)]
pub struct SessionArgs {
    /// ONNX model used when the engine cache is missing.
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Serialized engine cache.
    #[arg(long)]
    pub engine: Option<PathBuf>,
    /// Tensor to mark as an engine output (repeatable).
    #[arg(long = "output")]
    pub outputs: Vec<String>,
    /// Maximum batch size.
    #[arg(long)]
    pub batch: Option<u32>,
    #[arg(long, value_enum)]
    pub precision: Option<Precision>,
    /// Builder workspace in bytes.
    #[arg(long)]
    pub workspace: Option<usize>,
    /// Optimization profile `name:MIN:OPT:MAX`, shapes like `1x3x256x256` (repeatable).
    #[arg(long = "profile", value_parser = parse_profile)]
    pub profiles: Vec<OptimizationProfile>,
    /// Directory of calibration images (INT8).
    #[arg(long)]
    pub calib_dir: Option<PathBuf>,
    /// Calibration input size `WxH`.
    #[arg(long, value_parser = parse_size)]
    pub calib_size: Option<(u32, u32)>,
    /// Int8EntropyCalibrator, Int8EntropyCalibrator2 or Int8MinMaxCalibrator.
    #[arg(long, default_value = "Int8EntropyCalibrator2")]
    pub calibrator: CalibratorKind,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Precision {
    Fp32,
    Fp16,
    Int8,
}

impl From<Precision> for PrecisionMode {
    fn from(p: Precision) -> Self {
        match p {
            Precision::Fp32 => PrecisionMode::Fp32,
            Precision::Fp16 => PrecisionMode::Fp16,
            Precision::Int8 => PrecisionMode::Int8,
        }
    }
}

impl SessionArgs {
    /// Layer these flags over `config`.
    pub fn apply(self, config: &mut SessionConfig) -> Result<(), String> {
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(engine) = self.engine {
            config.engine_cache = engine;
        }
        if !self.outputs.is_empty() {
            config.forced_outputs = self.outputs;
        }
        if let Some(batch) = self.batch {
            config.max_batch_size = batch;
        }
        if let Some(precision) = self.precision {
            config.precision = precision.into();
        }
        if let Some(workspace) = self.workspace {
            config.workspace_size = workspace;
        }
        if !self.profiles.is_empty() {
            config.profiles = self.profiles;
        }
        match (self.calib_dir, self.calib_size) {
            (Some(image_dir), Some((input_width, input_height))) => {
                config.calibration = Some(CalibrationConfig {
                    kind: self.calibrator,
                    image_dir,
                    input_width,
                    input_height,
                    table_path: None,
                });
            }
            (Some(_), None) => return Err("--calib-dir needs --calib-size".into()),
            (None, Some(_)) => return Err("--calib-size needs --calib-dir".into()),
            (None, None) => {}
        }
        Ok(())
    }
}

fn parse_dims(s: &str) -> Result<Dims, String> {
    s.split('x')
        .map(|d| d.trim().parse::<i64>().map_err(|e| format!("bad dimension '{d}' in '{s}': {e}")))
        .collect::<Result<Vec<_>, _>>()
        .map(Dims::new)
}

pub fn parse_profile(s: &str) -> Result<OptimizationProfile, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [name, min, opt, max] = parts.as_slice() else {
        return Err(format!("expected name:MIN:OPT:MAX, got '{s}'"));
    };
    OptimizationProfile::new(*name, parse_dims(min)?, parse_dims(opt)?, parse_dims(max)?)
        .map_err(|e| e.to_string())
}

pub fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WxH, got '{s}'"))?;
    let parse = |v: &str| v.trim().parse::<u32>().map_err(|e| format!("bad size '{s}': {e}"));
    Ok((parse(w)?, parse(h)?))
}

/// Print the binding table of a session.
pub fn print_bindings(session: &Session, json: bool) -> anyhow::Result<()> {
    if json {
        let output = serde_json::json!({
            "kind": session.engine_kind(),
            "batch_size": session.batch_size(),
            "bindings": session.bindings(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "{:?} engine, batch size {}, {} inputs, {} outputs",
        session.engine_kind(),
        session.batch_size(),
        session.nb_input_bindings(),
        session.nb_output_bindings()
    );
    println!(
        "{:>3}  {:<6}  {:<24}  {:<18}  {:<18}  {:<6}  {:>12}",
        "idx", "dir", "name", "dims", "resolved", "dtype", "bytes"
    );
    for b in session.bindings() {
        println!(
            "{:>3}  {:<6}  {:<24}  {:<18}  {:<18}  {:<6}  {:>12}",
            b.index,
            if b.is_input() { "input" } else { "output" },
            b.name,
            b.dims.to_string(),
            b.resolved_dims.to_string(),
            format!("{:?}", b.dtype).to_lowercase(),
            b.size_bytes
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_flag_parses() {
        let p = parse_profile("input:1x3x128x128:1x3x256x256:1x3x512x512").unwrap();
        assert_eq!(p.input, "input");
        assert_eq!(p.opt, Dims::from([1, 3, 256, 256]));
        assert!(parse_profile("input:1x3:1x3").is_err());
        assert!(parse_profile("input:1x3x9:1x3x4:1x3x8").is_err());
    }

    #[test]
    fn size_flag_parses() {
        assert_eq!(parse_size("512x384").unwrap(), (512, 384));
        assert!(parse_size("512").is_err());
    }

    #[test]
    fn flags_override_config() {
        let mut config = SessionConfig {
            model: "a.onnx".into(),
            max_batch_size: 2,
            ..Default::default()
        };
        let args = SessionArgs {
            engine: Some("a.engine".into()),
            precision: Some(Precision::Fp16),
            outputs: vec!["mask".into()],
            ..Default::default()
        };
        args.apply(&mut config).unwrap();
        assert_eq!(config.model, PathBuf::from("a.onnx"));
        assert_eq!(config.engine_cache, PathBuf::from("a.engine"));
        assert_eq!(config.max_batch_size, 2);
        assert_eq!(config.precision, PrecisionMode::Fp16);
        assert_eq!(config.forced_outputs, vec!["mask".to_string()]);

        let partial = SessionArgs {
            calib_dir: Some("calib".into()),
            ..Default::default()
        };
        assert!(partial.apply(&mut config).is_err());
    }
}
