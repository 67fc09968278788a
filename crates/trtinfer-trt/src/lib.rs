//! TensorRT engine lifecycle: build or load a compiled engine, allocate one
//! device buffer per binding, and drive synchronous or stream-ordered
//! execution.

pub mod bindings;
pub mod builder;
pub mod calib_data;
pub mod calibrator;
pub mod config;
pub mod context;
pub mod engine;
pub mod logger;
pub mod network;
pub mod session;
pub mod store;

pub use bindings::{BindingManager, BindingSource};
pub use builder::{EngineBuilder, EngineOptions, ModelSource, DEFAULT_WORKSPACE_SIZE};
pub use calib_data::ImageDirSource;
pub use calibrator::{
    calibration_table_path, CalibrationBatchSource, CalibrationConfig, CalibrationFeed,
    CalibratorKind, Int8Calibrator,
};
pub use config::SessionConfig;
pub use context::ExecutionContext;
pub use engine::{HostMemory, TrtEngine};
pub use network::{NetworkGraph, TrtNetwork};
pub use session::{Session, SessionOptions};
pub use store::{EngineStore, LoadedEngine};
