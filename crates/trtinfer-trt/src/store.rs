use std::ffi::c_void;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use trtinfer_core::{InferError, Result};

use crate::engine::TrtEngine;

/// A TensorRT runtime, alive only for the load or build call that needs it.
pub(crate) struct TrtRuntime {
    handle: *mut c_void,
}

impl TrtRuntime {
    pub(crate) fn new() -> Result<Self> {
        crate::logger::install();
        let handle = unsafe { trtinfer_trt_sys::trt_create_runtime() };
        if handle.is_null() {
            return Err(InferError::TensorRt(
                crate::logger::last_error().unwrap_or_else(|| "failed to create TRT runtime".into()),
            ));
        }

        let (major, minor, patch) = crate::logger::version();
        tracing::debug!(version = %format!("{major}.{minor}.{patch}"), "TensorRT runtime created");

        Ok(Self { handle })
    }

    /// Deserialize a plan. Failures are classified from TensorRT's last error.
    pub(crate) fn deserialize(&self, plan: &[u8]) -> Result<TrtEngine> {
        crate::logger::clear_last_error();
        let handle = unsafe {
            trtinfer_trt_sys::trt_deserialize_engine(
                self.handle,
                plan.as_ptr() as *const c_void,
                plan.len() as u64,
            )
        };
        if handle.is_null() {
            let message = crate::logger::last_error()
                .unwrap_or_else(|| "deserializeCudaEngine returned null".into());
            return Err(classify_deserialize_failure(message));
        }
        unsafe { TrtEngine::from_raw(handle) }
    }
}

impl Drop for TrtRuntime {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { trtinfer_trt_sys::trt_destroy_runtime(self.handle) };
        }
    }
}

/// Map a deserialization error message to the error taxonomy.
pub(crate) fn classify_deserialize_failure(message: String) -> InferError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("plugin") || lower.contains("creator") {
        InferError::PluginMissing(message)
    } else {
        InferError::EngineIncompatible(message)
    }
}

/// Register TensorRT's bundled plugins. Runs once per process.
pub(crate) fn init_plugins() -> Result<()> {
    static PLUGINS: OnceLock<bool> = OnceLock::new();
    let ok = *PLUGINS.get_or_init(|| {
        crate::logger::install();
        let ok = unsafe { trtinfer_trt_sys::trt_init_plugins() } != 0;
        if ok {
            tracing::debug!("registered TensorRT plugins");
        }
        ok
    });
    if ok {
        Ok(())
    } else {
        Err(InferError::PluginMissing(
            crate::logger::last_error()
                .unwrap_or_else(|| "failed to initialize the TensorRT plugin library".into()),
        ))
    }
}

/// Deserialize a plan through a runtime scoped to this call.
pub(crate) fn deserialize_plan(plan: &[u8]) -> Result<TrtEngine> {
    init_plugins()?;
    let runtime = TrtRuntime::new()?;
    runtime.deserialize(plan)
}

/// An engine read back from the cache.
#[derive(Debug)]
pub struct LoadedEngine {
    pub engine: TrtEngine,
    pub path: PathBuf,
    pub plan_bytes: usize,
}

/// Reads and writes serialized engines.
pub struct EngineStore;

impl EngineStore {
    /// Load a cached engine.
    ///
    /// `Ok(None)` means the cache could not be read (missing file, empty
    /// path, permissions) and the caller should build instead. A file that
    /// exists but does not deserialize is an error.
    pub fn load(path: &Path) -> Result<Option<LoadedEngine>> {
        if path.as_os_str().is_empty() {
            tracing::debug!("no engine cache path configured");
            return Ok(None);
        }

        let plan = match std::fs::read(path) {
            Ok(plan) => plan,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(engine = %path.display(), "engine cache miss");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(engine = %path.display(), error = %e, "engine cache unreadable, rebuilding");
                return Ok(None);
            }
        };

        tracing::info!(engine = %path.display(), bytes = plan.len(), "loading TensorRT engine");

        let engine = deserialize_plan(&plan).map_err(|e| {
            tracing::error!(engine = %path.display(), error = %e, "engine deserialization failed");
            e
        })?;

        tracing::info!(
            engine = %path.display(),
            kind = ?engine.kind(),
            bindings = engine.nb_bindings(),
            max_batch = ?engine.intrinsic_batch_size(),
            "engine loaded"
        );

        Ok(Some(LoadedEngine {
            engine,
            path: path.to_path_buf(),
            plan_bytes: plan.len(),
        }))
    }

    /// Serialize a live engine to `path`.
    pub fn save(engine: &TrtEngine, path: &Path) -> Result<()> {
        let plan = engine.serialize()?;
        write_plan(plan.as_bytes(), path)
    }
}

/// Write plan bytes, creating the parent directory if needed.
pub(crate) fn write_plan(plan: &[u8], path: &Path) -> Result<()> {
    if plan.is_empty() {
        return Err(InferError::TensorRt("refusing to write an empty plan".into()));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, plan)?;
    tracing::info!(engine = %path.display(), bytes = plan.len(), "serialized engine written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_empty_cache_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EngineStore::load(&dir.path().join("absent.engine")).unwrap().is_none());
        assert!(EngineStore::load(Path::new("")).unwrap().is_none());
        // A directory cannot be read as a file.
        assert!(EngineStore::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn garbage_plan_is_an_error_not_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.engine");
        std::fs::write(&path, b"definitely not a TensorRT plan").unwrap();
        let err = EngineStore::load(&path).unwrap_err();
        assert!(
            matches!(
                err,
                InferError::EngineIncompatible(_)
                    | InferError::PluginMissing(_)
                    | InferError::TensorRt(_)
            ),
            "unexpected error {err:?}"
        );
    }

    #[test]
    fn deserialize_failures_are_classified_by_message() {
        assert!(matches!(
            classify_deserialize_failure(
                "getPluginCreator could not find plugin: ResizeNearest_TRT version: 1".into()
            ),
            InferError::PluginMissing(_)
        ));
        assert!(matches!(
            classify_deserialize_failure(
                "The engine plan file is not compatible with this version of TensorRT".into()
            ),
            InferError::EngineIncompatible(_)
        ));
    }

    #[test]
    fn plan_write_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache/model.engine");
        write_plan(&[1, 2, 3], &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert!(write_plan(&[], &path).is_err());
    }
}
