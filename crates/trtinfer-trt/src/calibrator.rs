//! INT8 calibration: table caching, batch feeding, and the calibrator
//! object handed to the TensorRT builder.

use std::ffi::c_void;
use std::fmt;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use trtinfer_core::{InferError, Result};
use trtinfer_gpu::{DeviceAllocator, DeviceBuffer, GpuContext, Stream};
use trtinfer_trt_sys::TrtCalibratorCallbacks;

/// INT8 calibration algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalibratorKind {
    #[serde(rename = "Int8EntropyCalibrator")]
    Entropy,
    #[default]
    #[serde(rename = "Int8EntropyCalibrator2")]
    Entropy2,
    #[serde(rename = "Int8MinMaxCalibrator")]
    MinMax,
}

impl CalibratorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entropy => "Int8EntropyCalibrator",
            Self::Entropy2 => "Int8EntropyCalibrator2",
            Self::MinMax => "Int8MinMaxCalibrator",
        }
    }

    /// Shim selector passed to `trt_create_calibrator`.
    fn code(self) -> i32 {
        match self {
            Self::Entropy => 0,
            Self::Entropy2 => 1,
            Self::MinMax => 2,
        }
    }
}

impl FromStr for CalibratorKind {
    type Err = InferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Int8EntropyCalibrator" => Ok(Self::Entropy),
            "Int8EntropyCalibrator2" => Ok(Self::Entropy2),
            "Int8MinMaxCalibrator" => Ok(Self::MinMax),
            other => Err(InferError::Calibration(format!(
                "unknown calibrator '{other}' (expected Int8EntropyCalibrator, \
                 Int8EntropyCalibrator2 or Int8MinMaxCalibrator)"
            ))),
        }
    }
}

impl fmt::Display for CalibratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for building an INT8 engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub kind: CalibratorKind,
    /// Directory of representative images.
    pub image_dir: PathBuf,
    /// Network input width in pixels.
    pub input_width: u32,
    /// Network input height in pixels.
    pub input_height: u32,
    /// Table location; defaults to [`calibration_table_path`] of the model.
    #[serde(default)]
    pub table_path: Option<PathBuf>,
}

impl CalibrationConfig {
    pub fn table_path_for(&self, model: &Path) -> PathBuf {
        self.table_path
            .clone()
            .unwrap_or_else(|| calibration_table_path(model))
    }
}

/// `<dir>/<stem>.table`, where the stem is the model file name up to its
/// first `.` (`models/unet.sim.onnx` gives `models/unet.table`).
pub fn calibration_table_path(model: &Path) -> PathBuf {
    let file_name = model
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_name.split('.').next().unwrap_or_default();
    model.with_file_name(format!("{stem}.table"))
}

/// Supplies host-side calibration batches.
pub trait CalibrationBatchSource {
    /// Number of `f32` elements in every batch.
    fn batch_len(&self) -> usize;
    /// Next batch, or `None` when the data set is exhausted.
    fn next_batch(&mut self) -> Result<Option<Vec<f32>>>;
}

impl<S: CalibrationBatchSource + ?Sized> CalibrationBatchSource for Box<S> {
    fn batch_len(&self) -> usize {
        (**self).batch_len()
    }

    fn next_batch(&mut self) -> Result<Option<Vec<f32>>> {
        (**self).next_batch()
    }
}

/// Table handling and batch pulling, independent of TensorRT.
///
/// When a non-empty table file exists its bytes are returned verbatim and
/// the batch source is never consulted. An empty table file counts as
/// missing.
pub struct CalibrationFeed<S> {
    source: S,
    table_path: PathBuf,
    table: Option<Vec<u8>>,
    table_checked: bool,
    batches: usize,
}

impl<S: CalibrationBatchSource> CalibrationFeed<S> {
    pub fn new(source: S, table_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            table_path: table_path.into(),
            table: None,
            table_checked: false,
            batches: 0,
        }
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn batch_len(&self) -> usize {
        self.source.batch_len()
    }

    /// Batches handed out so far.
    pub fn batches_served(&self) -> usize {
        self.batches
    }

    /// Existing table bytes, read once and kept for the feed's lifetime.
    pub fn read_cache(&mut self) -> Option<&[u8]> {
        if self.table.is_none() && !self.table_checked {
            self.table_checked = true;
            match std::fs::read(&self.table_path) {
                Ok(bytes) if !bytes.is_empty() => {
                    tracing::info!(
                        table = %self.table_path.display(),
                        bytes = bytes.len(),
                        "using existing calibration table"
                    );
                    self.table = Some(bytes);
                }
                Ok(_) => {
                    tracing::warn!(table = %self.table_path.display(), "calibration table is empty, recalibrating");
                }
                Err(_) => {
                    tracing::debug!(table = %self.table_path.display(), "no calibration table");
                }
            }
        }
        self.table.as_deref()
    }

    /// Next batch from the source; `None` without touching the source when
    /// a table is available.
    pub fn next_batch(&mut self) -> Result<Option<Vec<f32>>> {
        if self.read_cache().is_some() {
            return Ok(None);
        }
        let batch = self.source.next_batch()?;
        if let Some(batch) = &batch {
            let expected = self.source.batch_len();
            if batch.len() != expected {
                return Err(InferError::Calibration(format!(
                    "calibration batch has {} elements, expected {expected}",
                    batch.len()
                )));
            }
            self.batches += 1;
            tracing::debug!(batch = self.batches, "calibration batch");
        }
        Ok(batch)
    }

    /// Persist the table exactly as given.
    pub fn write_cache(&mut self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.table_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.table_path, data)?;
        tracing::info!(
            table = %self.table_path.display(),
            bytes = data.len(),
            batches = self.batches,
            "wrote calibration table"
        );
        self.table = Some(data.to_vec());
        Ok(())
    }
}

/// State reached from the TensorRT callbacks through the `user` pointer.
struct CalibratorState {
    feed: CalibrationFeed<Box<dyn CalibrationBatchSource>>,
    device: DeviceBuffer,
    stream: Stream,
}

/// An `IInt8Calibrator` backed by a [`CalibrationFeed`].
///
/// Each batch is uploaded to one device buffer whose pointer is handed to
/// TensorRT. Must outlive the builder config it is attached to.
pub struct Int8Calibrator {
    handle: *mut c_void,
    kind: CalibratorKind,
    // Boxed so the pointer given to TensorRT stays valid when `self` moves.
    state: Box<CalibratorState>,
}

impl Int8Calibrator {
    pub fn new(
        gpu: &GpuContext,
        kind: CalibratorKind,
        batch_size: u32,
        source: Box<dyn CalibrationBatchSource>,
        table_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let feed = CalibrationFeed::new(source, table_path);
        let bytes = feed.batch_len() * std::mem::size_of::<f32>();
        let device = gpu.alloc_bytes(bytes)?;

        let mut state = Box::new(CalibratorState {
            feed,
            device,
            stream: gpu.default_stream.clone(),
        });

        let callbacks = TrtCalibratorCallbacks {
            get_batch: get_batch_callback,
            read_cache: read_cache_callback,
            write_cache: write_cache_callback,
        };
        let user = &mut *state as *mut CalibratorState as *mut c_void;
        let handle = unsafe {
            trtinfer_trt_sys::trt_create_calibrator(kind.code(), batch_size as i32, callbacks, user)
        };
        if handle.is_null() {
            return Err(InferError::Calibration(format!(
                "failed to create {kind} calibrator"
            )));
        }

        tracing::info!(
            %kind,
            batch_size,
            table = %state.feed.table_path().display(),
            "created INT8 calibrator"
        );
        Ok(Self {
            handle,
            kind,
            state,
        })
    }

    pub(crate) fn handle(&self) -> *mut c_void {
        self.handle
    }

    pub fn kind(&self) -> CalibratorKind {
        self.kind
    }

    pub fn batches_served(&self) -> usize {
        self.state.feed.batches_served()
    }
}

impl Drop for Int8Calibrator {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { trtinfer_trt_sys::trt_destroy_calibrator(self.handle) };
        }
    }
}

unsafe extern "C" fn get_batch_callback(
    user: *mut c_void,
    bindings: *mut *mut c_void,
    _names: *const *const c_char,
    nb_bindings: i32,
) -> i32 {
    let state = &mut *(user as *mut CalibratorState);
    let result = catch_unwind(AssertUnwindSafe(|| -> Result<bool> {
        if nb_bindings != 1 {
            return Err(InferError::Calibration(format!(
                "calibration supports one input binding, network has {nb_bindings}"
            )));
        }
        let Some(batch) = state.feed.next_batch()? else {
            return Ok(false);
        };
        state.device.upload(&batch, &state.stream)?;
        state.stream.synchronize()?;
        *bindings = state.device.device_ptr() as *mut c_void;
        Ok(true)
    }));
    match result {
        Ok(Ok(more)) => more as i32,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "calibration batch failed");
            0
        }
        Err(_) => {
            tracing::error!("calibration batch source panicked");
            0
        }
    }
}

unsafe extern "C" fn read_cache_callback(user: *mut c_void, length: *mut u64) -> *const c_void {
    let state = &mut *(user as *mut CalibratorState);
    let table = catch_unwind(AssertUnwindSafe(|| {
        state
            .feed
            .read_cache()
            .map(|bytes| (bytes.as_ptr(), bytes.len()))
    }))
    .ok()
    .flatten();
    match table {
        Some((ptr, len)) => {
            *length = len as u64;
            ptr as *const c_void
        }
        None => {
            *length = 0;
            std::ptr::null()
        }
    }
}

unsafe extern "C" fn write_cache_callback(user: *mut c_void, data: *const c_void, length: u64) {
    let state = &mut *(user as *mut CalibratorState);
    if data.is_null() || length == 0 {
        return;
    }
    let bytes = std::slice::from_raw_parts(data as *const u8, length as usize);
    let result = catch_unwind(AssertUnwindSafe(|| state.feed.write_cache(bytes)));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "failed to write calibration table"),
        Err(_) => tracing::error!("calibration table writer panicked"),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    struct CountingSource {
        calls: Rc<Cell<usize>>,
        remaining: usize,
    }

    impl CalibrationBatchSource for CountingSource {
        fn batch_len(&self) -> usize {
            4
        }
        fn next_batch(&mut self) -> Result<Option<Vec<f32>>> {
            self.calls.set(self.calls.get() + 1);
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(vec![0.5; 4]))
        }
    }

    fn source(remaining: usize) -> (CountingSource, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        (
            CountingSource {
                calls: calls.clone(),
                remaining,
            },
            calls,
        )
    }

    #[test]
    fn existing_table_skips_the_batch_source() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("unet.table");
        std::fs::write(&table, b"TRT-8601-EntropyCalibration2\ninput: 3c010a14\n").unwrap();

        let (src, calls) = source(3);
        let mut feed = CalibrationFeed::new(src, &table);
        assert_eq!(
            feed.read_cache(),
            Some(&b"TRT-8601-EntropyCalibration2\ninput: 3c010a14\n"[..])
        );
        assert!(feed.next_batch().unwrap().is_none());
        assert!(feed.next_batch().unwrap().is_none());
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn missing_table_pulls_until_exhausted_then_persists() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("nested/unet.table");

        let (src, calls) = source(2);
        let mut feed = CalibrationFeed::new(src, &table);
        assert!(feed.read_cache().is_none());
        assert!(feed.next_batch().unwrap().is_some());
        assert!(feed.next_batch().unwrap().is_some());
        assert!(feed.next_batch().unwrap().is_none());
        assert_eq!(calls.get(), 3);
        assert_eq!(feed.batches_served(), 2);

        let bytes = [0u8, 1, 2, 255, 10, 13];
        feed.write_cache(&bytes).unwrap();
        assert_eq!(std::fs::read(&table).unwrap(), bytes);
        assert_eq!(feed.read_cache(), Some(&bytes[..]));
    }

    #[test]
    fn empty_table_recalibrates() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("m.table");
        std::fs::write(&table, b"").unwrap();

        let (src, calls) = source(1);
        let mut feed = CalibrationFeed::new(src, &table);
        assert!(feed.read_cache().is_none());
        assert!(feed.next_batch().unwrap().is_some());
        assert!(feed.next_batch().unwrap().is_none());
        assert_eq!(calls.get(), 2);
        assert_eq!(feed.batches_served(), 1);
    }

    #[test]
    fn wrong_batch_length_is_rejected() {
        struct Short;
        impl CalibrationBatchSource for Short {
            fn batch_len(&self) -> usize {
                8
            }
            fn next_batch(&mut self) -> Result<Option<Vec<f32>>> {
                Ok(Some(vec![0.0; 3]))
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let mut feed = CalibrationFeed::new(Short, dir.path().join("x.table"));
        assert!(matches!(feed.next_batch(), Err(InferError::Calibration(_))));
    }

    #[test]
    fn table_path_uses_name_up_to_first_dot() {
        assert_eq!(
            calibration_table_path(Path::new("models/unet.sim.onnx")),
            PathBuf::from("models/unet.table")
        );
        assert_eq!(
            calibration_table_path(Path::new("/data/v1.2/net.onnx")),
            PathBuf::from("/data/v1.2/net.table")
        );
        assert_eq!(calibration_table_path(Path::new("plain")), PathBuf::from("plain.table"));
    }

    #[test]
    fn calibrator_kind_names() {
        for kind in [CalibratorKind::Entropy, CalibratorKind::Entropy2, CalibratorKind::MinMax] {
            assert_eq!(kind.as_str().parse::<CalibratorKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("Int8LegacyCalibrator".parse::<CalibratorKind>().is_err());
    }
}
