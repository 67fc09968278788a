use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use trtinfer_core::{InferError, OptimizationProfile, PrecisionMode, Result};
use trtinfer_gpu::GpuContext;
use trtinfer_trt_sys::{BUILDER_FLAG_FP16, BUILDER_FLAG_INT8};

use crate::calib_data::ImageDirSource;
use crate::calibrator::{CalibrationBatchSource, CalibrationConfig, Int8Calibrator};
use crate::engine::{HostMemory, TrtEngine};
use crate::network::{check_profiles, mark_forced_outputs, NetworkGraph, OnnxParser, TrtNetwork};
use crate::store;

/// Default builder workspace: 10 MiB.
pub const DEFAULT_WORKSPACE_SIZE: usize = 10 << 20;

/// An ONNX model plus the tensors to expose as engine outputs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelSource {
    pub path: PathBuf,
    /// When non-empty, replaces the graph's declared outputs.
    #[serde(default)]
    pub forced_outputs: Vec<String>,
}

impl ModelSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            forced_outputs: Vec::new(),
        }
    }

    pub fn with_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forced_outputs = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Compilation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub max_batch_size: u32,
    pub precision: PrecisionMode,
    pub workspace_size: usize,
    pub profiles: Vec<OptimizationProfile>,
    /// Required for INT8.
    pub calibration: Option<CalibrationConfig>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 1,
            precision: PrecisionMode::Fp32,
            workspace_size: DEFAULT_WORKSPACE_SIZE,
            profiles: Vec::new(),
            calibration: None,
        }
    }
}

/// Compiles ONNX models into TensorRT engines.
pub struct EngineBuilder<'a> {
    gpu: &'a GpuContext,
    options: EngineOptions,
}

/// Owned `IBuilder`.
struct Builder(*mut c_void);

impl Drop for Builder {
    fn drop(&mut self) {
        unsafe { trtinfer_trt_sys::trt_destroy_builder(self.0) };
    }
}

/// Owned `IBuilderConfig`.
struct BuilderConfig(*mut c_void);

impl Drop for BuilderConfig {
    fn drop(&mut self) {
        unsafe { trtinfer_trt_sys::trt_destroy_config(self.0) };
    }
}

impl<'a> EngineBuilder<'a> {
    pub fn new(gpu: &'a GpuContext, options: EngineOptions) -> Self {
        Self { gpu, options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Compile `model`, write the plan to `cache_path`, and return the
    /// deserialized engine.
    ///
    /// Parser, network, config, builder and calibrator all live only for
    /// the duration of this call.
    pub fn build(&self, model: &ModelSource, cache_path: &Path) -> Result<TrtEngine> {
        let opts = &self.options;
        if opts.max_batch_size == 0 {
            return Err(InferError::InvalidInput("max batch size must be positive".into()));
        }
        for profile in &opts.profiles {
            profile.validate()?;
        }
        if !model.path.is_file() {
            return Err(InferError::Parse {
                path: model.path.display().to_string(),
                reason: "model file not found".into(),
            });
        }

        tracing::info!(
            model = %model.path.display(),
            engine = %cache_path.display(),
            precision = %opts.precision,
            max_batch = opts.max_batch_size,
            forced_outputs = model.forced_outputs.len(),
            "building TensorRT engine"
        );

        crate::logger::install();
        store::init_plugins()?;

        let builder = unsafe { trtinfer_trt_sys::trt_create_builder() };
        if builder.is_null() {
            return Err(InferError::TensorRt(
                crate::logger::last_error().unwrap_or_else(|| "failed to create builder".into()),
            ));
        }
        let builder = Builder(builder);

        let network = unsafe { trtinfer_trt_sys::trt_builder_create_network(builder.0, 1) };
        if network.is_null() {
            return Err(InferError::TensorRt("failed to create network definition".into()));
        }
        let mut network = unsafe { TrtNetwork::from_raw(network) };
        if network.has_implicit_batch() {
            return Err(InferError::TensorRt(
                "network definition was created in implicit-batch mode".into(),
            ));
        }

        let parser = OnnxParser::new(&network)?;
        parser.parse_file(&model.path)?;
        tracing::info!(
            inputs = network.nb_inputs(),
            outputs = network.nb_outputs(),
            layers = network.nb_layers(),
            "parsed ONNX model"
        );

        mark_forced_outputs(&mut network, &model.forced_outputs)?;
        if network.nb_outputs() == 0 {
            return Err(InferError::Compilation("network has no outputs".into()));
        }
        check_profiles(&network, &opts.profiles)?;

        let fast_fp16 = unsafe { trtinfer_trt_sys::trt_builder_platform_has_fast_fp16(builder.0) } != 0;
        let fast_int8 = unsafe { trtinfer_trt_sys::trt_builder_platform_has_fast_int8(builder.0) } != 0;
        let dla_cores = unsafe { trtinfer_trt_sys::trt_builder_nb_dla_cores(builder.0) };

        // Created before the config so the config is dropped first.
        let calibrator = match opts.precision {
            PrecisionMode::Int8 => Some(self.int8_calibrator(model)?),
            _ => None,
        };

        let config = unsafe { trtinfer_trt_sys::trt_builder_create_config(builder.0) };
        if config.is_null() {
            return Err(InferError::TensorRt("failed to create builder config".into()));
        }
        let config = BuilderConfig(config);

        unsafe {
            trtinfer_trt_sys::trt_builder_set_max_batch_size(builder.0, opts.max_batch_size as i32);
            trtinfer_trt_sys::trt_config_set_workspace(config.0, opts.workspace_size as u64);
        }

        match opts.precision {
            PrecisionMode::Fp32 => {}
            PrecisionMode::Fp16 => {
                if !fast_fp16 {
                    tracing::warn!("platform has no fast FP16 support; building FP16 anyway");
                }
                unsafe { trtinfer_trt_sys::trt_config_set_flag(config.0, BUILDER_FLAG_FP16) };
            }
            PrecisionMode::Int8 => {
                if !fast_int8 {
                    tracing::warn!("platform has no fast INT8 support; building INT8 anyway");
                }
                unsafe {
                    trtinfer_trt_sys::trt_config_set_flag(config.0, BUILDER_FLAG_INT8);
                    if let Some(calibrator) = &calibrator {
                        trtinfer_trt_sys::trt_config_set_int8_calibrator(config.0, calibrator.handle());
                    }
                }
            }
        }

        for profile in &opts.profiles {
            self.add_profile(&builder, &config, profile)?;
        }

        let workspace = unsafe { trtinfer_trt_sys::trt_config_get_workspace(config.0) };
        let dla_core = unsafe { trtinfer_trt_sys::trt_config_get_dla_core(config.0) };
        tracing::info!(
            fast_fp16,
            fast_int8,
            dla_cores,
            dla_core,
            max_batch = opts.max_batch_size,
            workspace_bytes = workspace,
            profiles = opts.profiles.len(),
            "platform capabilities"
        );

        let started = std::time::Instant::now();
        let plan = unsafe {
            let mem = trtinfer_trt_sys::trt_builder_build_serialized(builder.0, network.handle(), config.0);
            HostMemory::from_raw(mem)
        }
        .ok_or_else(|| {
            InferError::Compilation(
                crate::logger::last_error().unwrap_or_else(|| "builder returned no plan".into()),
            )
        })?;

        tracing::info!(
            bytes = plan.as_bytes().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine compiled"
        );
        if let Some(calibrator) = &calibrator {
            tracing::info!(
                kind = %calibrator.kind(),
                batches = calibrator.batches_served(),
                "INT8 calibration finished"
            );
        }

        if cache_path.as_os_str().is_empty() {
            tracing::warn!("no engine cache path configured; plan not saved");
        } else if let Err(e) = store::write_plan(plan.as_bytes(), cache_path) {
            tracing::error!(engine = %cache_path.display(), error = %e, "failed to write engine plan");
        }

        store::deserialize_plan(plan.as_bytes())
    }

    fn int8_calibrator(&self, model: &ModelSource) -> Result<Int8Calibrator> {
        let settings = self.options.calibration.as_ref().ok_or_else(|| {
            InferError::Calibration("INT8 precision requires calibration settings".into())
        })?;
        tracing::warn!("INT8 inference needs compute capability 6.1 or newer");

        let table_path = settings.table_path_for(&model.path);
        let batch_size = self.options.max_batch_size;
        let source = calibration_source(settings, &table_path, batch_size)?;
        Int8Calibrator::new(self.gpu, settings.kind, batch_size, source, table_path)
    }

    fn add_profile(
        &self,
        builder: &Builder,
        config: &BuilderConfig,
        profile: &OptimizationProfile,
    ) -> Result<()> {
        let input = CString::new(profile.input.as_str()).map_err(|_| InferError::InvalidProfile {
            input: profile.input.clone(),
            reason: "name contains a NUL byte".into(),
        })?;
        let index = unsafe {
            trtinfer_trt_sys::trt_builder_add_profile(
                builder.0,
                config.0,
                input.as_ptr(),
                profile.min.as_slice().as_ptr(),
                profile.opt.as_slice().as_ptr(),
                profile.max.as_slice().as_ptr(),
                profile.min.rank() as i32,
            )
        };
        if index < 0 {
            return Err(InferError::InvalidProfile {
                input: profile.input.clone(),
                reason: crate::logger::last_error()
                    .unwrap_or_else(|| "rejected by TensorRT".into()),
            });
        }
        tracing::info!(
            input = %profile.input,
            min = %profile.min,
            opt = %profile.opt,
            max = %profile.max,
            index,
            "registered optimization profile"
        );
        Ok(())
    }
}

/// Pick the calibration batch source. A non-empty table makes the images
/// unnecessary, so the image directory is not touched in that case.
fn calibration_source(
    settings: &CalibrationConfig,
    table_path: &Path,
    batch_size: u32,
) -> Result<Box<dyn CalibrationBatchSource>> {
    let has_table = std::fs::metadata(table_path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false);
    if has_table {
        tracing::debug!(table = %table_path.display(), "calibration table present, skipping images");
        return Ok(Box::new(EmptySource {
            batch_len: 3
                * settings.input_width as usize
                * settings.input_height as usize
                * batch_size as usize,
        }));
    }
    let source = ImageDirSource::open(
        &settings.image_dir,
        settings.input_width,
        settings.input_height,
        batch_size,
    )?;
    Ok(Box::new(source))
}

/// Batch source used when only the calibration table is available.
struct EmptySource {
    batch_len: usize,
}

impl CalibrationBatchSource for EmptySource {
    fn batch_len(&self) -> usize {
        self.batch_len
    }

    fn next_batch(&mut self) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_session_defaults() {
        let opts = EngineOptions::default();
        assert_eq!(opts.max_batch_size, 1);
        assert_eq!(opts.precision, PrecisionMode::Fp32);
        assert_eq!(opts.workspace_size, 10 * 1024 * 1024);
        assert!(opts.profiles.is_empty());
    }

    #[test]
    fn model_source_outputs() {
        let model = ModelSource::new("unet.onnx").with_outputs(["mask", "edges"]);
        assert_eq!(model.forced_outputs, vec!["mask".to_string(), "edges".to_string()]);
    }

    fn calibration(image_dir: PathBuf) -> CalibrationConfig {
        CalibrationConfig {
            kind: Default::default(),
            image_dir,
            input_width: 8,
            input_height: 4,
            table_path: None,
        }
    }

    #[test]
    fn existing_table_skips_the_image_dir() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("unet.table");
        std::fs::write(&table, b"TRT-8601-EntropyCalibration2\n").unwrap();

        let settings = calibration(dir.path().join("no-such-images"));
        let mut source = calibration_source(&settings, &table, 2).unwrap();
        assert_eq!(source.batch_len(), 3 * 8 * 4 * 2);
        assert!(source.next_batch().unwrap().is_none());
    }

    #[test]
    fn missing_table_reads_the_image_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = calibration(dir.path().join("no-such-images"));
        let err = calibration_source(&settings, &dir.path().join("unet.table"), 2)
            .err()
            .unwrap();
        assert!(matches!(err, InferError::Calibration(_)));

        // An empty table is no table.
        let empty = dir.path().join("empty.table");
        std::fs::write(&empty, b"").unwrap();
        assert!(calibration_source(&settings, &empty, 2).is_err());
    }

    #[test]
    #[ignore = "requires a CUDA device"]
    fn missing_model_is_a_parse_error() {
        let gpu = GpuContext::default_device().unwrap();
        let builder = EngineBuilder::new(&gpu, EngineOptions::default());
        let err = builder
            .build(&ModelSource::new("/nonexistent/model.onnx"), Path::new(""))
            .unwrap_err();
        assert!(matches!(err, InferError::Parse { .. }));
    }

    #[test]
    #[ignore = "requires a CUDA device"]
    fn int8_without_calibration_settings_fails() {
        let onnx = match std::env::var("TRTINFER_TEST_ONNX") {
            Ok(path) => PathBuf::from(path),
            Err(_) => return,
        };
        let gpu = GpuContext::default_device().unwrap();
        let options = EngineOptions {
            precision: PrecisionMode::Int8,
            ..Default::default()
        };
        let err = EngineBuilder::new(&gpu, options)
            .build(&ModelSource::new(onnx), Path::new(""))
            .unwrap_err();
        assert!(matches!(err, InferError::Calibration(_)));
    }
}
