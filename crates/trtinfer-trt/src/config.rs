use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use trtinfer_core::{InferError, OptimizationProfile, PrecisionMode, Result};
use trtinfer_gpu::GpuContextConfig;

use crate::builder::{EngineOptions, ModelSource, DEFAULT_WORKSPACE_SIZE};
use crate::calibrator::CalibrationConfig;
use crate::session::SessionOptions;

/// Session description as stored in a JSON file.
///
/// ```json
/// {
///   "model": "models/unet.onnx",
///   "engine_cache": "models/unet.engine",
///   "forced_outputs": ["mask"],
///   "precision": "fp16",
///   "profiles": [
///     { "input": "input", "min": [1,3,128,128], "opt": [1,3,256,256], "max": [1,3,512,512] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// ONNX model used when the engine cache is missing.
    pub model: PathBuf,
    /// Serialized engine location.
    pub engine_cache: PathBuf,
    /// Tensors to expose as outputs instead of the graph's own.
    pub forced_outputs: Vec<String>,
    pub max_batch_size: u32,
    pub precision: PrecisionMode,
    /// Builder workspace in bytes.
    pub workspace_size: usize,
    /// CUDA device ordinal.
    pub device: usize,
    pub profiles: Vec<OptimizationProfile>,
    pub calibration: Option<CalibrationConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            engine_cache: PathBuf::new(),
            forced_outputs: Vec::new(),
            max_batch_size: 1,
            precision: PrecisionMode::Fp32,
            workspace_size: DEFAULT_WORKSPACE_SIZE,
            device: 0,
            profiles: Vec::new(),
            calibration: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| InferError::InvalidInput(format!("invalid session config: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|e| match e {
            InferError::InvalidInput(msg) => {
                InferError::InvalidInput(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| InferError::InvalidInput(format!("cannot serialize config: {e}")))
    }

    pub fn gpu_config(&self) -> GpuContextConfig {
        GpuContextConfig {
            device_ordinal: self.device,
        }
    }

    /// Validate and convert into session options.
    pub fn session_options(&self) -> Result<SessionOptions> {
        if self.max_batch_size == 0 {
            return Err(InferError::InvalidInput("max_batch_size must be positive".into()));
        }
        if self.model.as_os_str().is_empty() && self.engine_cache.as_os_str().is_empty() {
            return Err(InferError::InvalidInput(
                "config needs a model path, an engine cache path, or both".into(),
            ));
        }
        for profile in &self.profiles {
            profile.validate()?;
        }
        if self.precision == PrecisionMode::Int8 && self.calibration.is_none() {
            return Err(InferError::Calibration(
                "INT8 precision requires a calibration section".into(),
            ));
        }

        Ok(SessionOptions {
            model: ModelSource {
                path: self.model.clone(),
                forced_outputs: self.forced_outputs.clone(),
            },
            engine_cache: self.engine_cache.clone(),
            engine: EngineOptions {
                max_batch_size: self.max_batch_size,
                precision: self.precision,
                workspace_size: self.workspace_size,
                profiles: self.profiles.clone(),
                calibration: self.calibration.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use trtinfer_core::Dims;

    use super::*;
    use crate::calibrator::CalibratorKind;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config = SessionConfig::from_json(r#"{ "model": "unet.onnx" }"#).unwrap();
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(config.precision, PrecisionMode::Fp32);
        assert_eq!(config.workspace_size, 10 << 20);
        assert_eq!(config.device, 0);
        assert!(config.profiles.is_empty());

        let options = config.session_options().unwrap();
        assert_eq!(options.model.path, PathBuf::from("unet.onnx"));
        assert!(options.engine_cache.as_os_str().is_empty());
    }

    #[test]
    fn full_config_converts_to_options() {
        let json = r#"{
            "model": "models/unet.onnx",
            "engine_cache": "models/unet.engine",
            "forced_outputs": ["mask"],
            "max_batch_size": 4,
            "precision": "int8",
            "device": 1,
            "profiles": [
                { "input": "input", "min": [4,3,128,128], "opt": [4,3,256,256], "max": [4,3,512,512] }
            ],
            "calibration": {
                "kind": "Int8MinMaxCalibrator",
                "image_dir": "calib",
                "input_width": 512,
                "input_height": 512
            }
        }"#;
        let config = SessionConfig::from_json(json).unwrap();
        assert_eq!(config.gpu_config().device_ordinal, 1);

        let options = config.session_options().unwrap();
        assert_eq!(options.model.forced_outputs, vec!["mask".to_string()]);
        assert_eq!(options.engine.max_batch_size, 4);
        assert_eq!(options.engine.precision, PrecisionMode::Int8);
        assert_eq!(options.engine.profiles[0].max, Dims::from([4, 3, 512, 512]));

        let calibration = options.engine.calibration.unwrap();
        assert_eq!(calibration.kind, CalibratorKind::MinMax);
        assert_eq!(
            calibration.table_path_for(&options.model.path),
            PathBuf::from("models/unet.table")
        );
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let bad_profile = r#"{
            "model": "m.onnx",
            "profiles": [{ "input": "x", "min": [1,3,64,64], "opt": [1,3,32,32], "max": [1,3,128,128] }]
        }"#;
        assert!(matches!(
            SessionConfig::from_json(bad_profile).unwrap().session_options(),
            Err(InferError::InvalidProfile { .. })
        ));

        let int8 = r#"{ "model": "m.onnx", "precision": "int8" }"#;
        assert!(matches!(
            SessionConfig::from_json(int8).unwrap().session_options(),
            Err(InferError::Calibration(_))
        ));

        assert!(SessionConfig::from_json(r#"{ "precision": "fp64" }"#).is_err());
        assert!(SessionConfig::default().session_options().is_err());
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let config = SessionConfig {
            model: "a.onnx".into(),
            precision: PrecisionMode::Fp16,
            ..Default::default()
        };
        std::fs::write(&path, config.to_json().unwrap()).unwrap();
        assert_eq!(SessionConfig::from_file(&path).unwrap(), config);
    }
}
