//! Bridge from TensorRT's `ILogger` into `tracing`.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Once;

static INSTALL: Once = Once::new();

/// `nvinfer1::ILogger::Severity` values.
const SEVERITY_INTERNAL_ERROR: i32 = 0;
const SEVERITY_ERROR: i32 = 1;
const SEVERITY_WARNING: i32 = 2;
const SEVERITY_INFO: i32 = 3;

/// Route TensorRT log messages through `tracing`. Idempotent.
///
/// Messages up to `info` severity are forwarded; the subscriber's filter
/// decides what is shown.
pub fn install() {
    INSTALL.call_once(|| unsafe {
        trtinfer_trt_sys::trt_set_log_callback(Some(forward));
        trtinfer_trt_sys::trt_set_log_severity(SEVERITY_INFO);
    });
}

unsafe extern "C" fn forward(severity: i32, msg: *const c_char) {
    if msg.is_null() {
        return;
    }
    let msg = CStr::from_ptr(msg).to_string_lossy();
    match severity {
        SEVERITY_INTERNAL_ERROR | SEVERITY_ERROR => tracing::error!(target: "tensorrt", "{msg}"),
        SEVERITY_WARNING => tracing::warn!(target: "tensorrt", "{msg}"),
        SEVERITY_INFO => tracing::debug!(target: "tensorrt", "{msg}"),
        _ => tracing::trace!(target: "tensorrt", "{msg}"),
    }
}

/// Most recent error-severity message TensorRT logged, if any.
pub fn last_error() -> Option<String> {
    let msg = trtinfer_trt_sys::last_error_message();
    (!msg.is_empty()).then_some(msg)
}

pub fn clear_last_error() {
    unsafe { trtinfer_trt_sys::trt_clear_last_error() };
}

/// Version of the linked TensorRT library, `0.0.0` when built without it.
pub fn version() -> (i32, i32, i32) {
    unsafe {
        (
            trtinfer_trt_sys::trt_get_version_major(),
            trtinfer_trt_sys::trt_get_version_minor(),
            trtinfer_trt_sys::trt_get_version_patch(),
        )
    }
}
