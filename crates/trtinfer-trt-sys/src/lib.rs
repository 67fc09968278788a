//! Raw FFI bindings to the TensorRT C shim (`trt_shim.cpp`).
//!
//! The C++ shim wraps the TensorRT 8.x C++ API as `extern "C"` functions,
//! compiled by the `cc` crate at build time and linked against `nvinfer`,
//! `nvinfer_plugin` and `nvonnxparser`.
//!
//! When the build script cannot find TensorRT 8.x and CUDA headers it sets
//! `cfg(trt_stub)`. The same functions then exist as Rust stubs that create
//! nothing and report TensorRT as unavailable through `trt_last_error`, so
//! dependent crates still build, link and run their host-side logic.
//!
//! # Safety
//! All functions in this module are unsafe FFI calls. Use `trtinfer-trt`
//! for safe Rust wrappers.

#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::c_void;
use std::os::raw::c_char;

/// Log sink installed with `trt_set_log_callback`. Severity follows
/// `nvinfer1::ILogger::Severity` (0 = internal error .. 4 = verbose).
pub type trt_log_callback = Option<unsafe extern "C" fn(severity: i32, msg: *const c_char)>;

/// Callbacks backing an INT8 calibrator created by `trt_create_calibrator`.
///
/// `get_batch` fills `bindings[i]` with a device pointer for input `names[i]`
/// and returns non-zero while batches remain. `read_cache` returns a pointer
/// to the cached table (length 0 for none); the memory must stay valid until
/// the next call. `write_cache` receives the freshly computed table.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrtCalibratorCallbacks {
    pub get_batch: unsafe extern "C" fn(
        user: *mut c_void,
        bindings: *mut *mut c_void,
        names: *const *const c_char,
        nb_bindings: i32,
    ) -> i32,
    pub read_cache: unsafe extern "C" fn(user: *mut c_void, length: *mut u64) -> *const c_void,
    pub write_cache: unsafe extern "C" fn(user: *mut c_void, data: *const c_void, length: u64),
}

/// `nvinfer1::BuilderFlag` values used by the builder.
pub const BUILDER_FLAG_FP16: i32 = 0;
pub const BUILDER_FLAG_INT8: i32 = 1;

/// `nvinfer1::OptProfileSelector` values.
pub const PROFILE_MIN: i32 = 0;
pub const PROFILE_OPT: i32 = 1;
pub const PROFILE_MAX: i32 = 2;

/// `nvinfer1::Dims::MAX_DIMS`.
pub const MAX_DIMS: usize = 8;

/// True when the crate was built without TensorRT.
pub const STUB: bool = cfg!(trt_stub);

#[cfg(not(trt_stub))]
pub mod ffi {
    use super::{trt_log_callback, TrtCalibratorCallbacks};
    use std::ffi::c_void;
    use std::os::raw::c_char;

    extern "C" {
        // Logging and library setup
        pub fn trt_set_log_callback(cb: trt_log_callback);
        pub fn trt_set_log_severity(severity: i32);
        pub fn trt_last_error(buf: *mut c_char, len: u64) -> i32;
        pub fn trt_clear_last_error();
        pub fn trt_init_plugins() -> i32;
        pub fn trt_get_version_major() -> i32;
        pub fn trt_get_version_minor() -> i32;
        pub fn trt_get_version_patch() -> i32;

        // Builder
        pub fn trt_create_builder() -> *mut c_void;
        pub fn trt_destroy_builder(builder: *mut c_void);
        pub fn trt_builder_platform_has_fast_fp16(builder: *mut c_void) -> i32;
        pub fn trt_builder_platform_has_fast_int8(builder: *mut c_void) -> i32;
        pub fn trt_builder_nb_dla_cores(builder: *mut c_void) -> i32;
        pub fn trt_builder_set_max_batch_size(builder: *mut c_void, batch_size: i32);
        pub fn trt_builder_create_network(builder: *mut c_void, explicit_batch: i32) -> *mut c_void;
        pub fn trt_builder_create_config(builder: *mut c_void) -> *mut c_void;
        pub fn trt_builder_add_profile(
            builder: *mut c_void,
            config: *mut c_void,
            input: *const c_char,
            min_dims: *const i64,
            opt_dims: *const i64,
            max_dims: *const i64,
            nb_dims: i32,
        ) -> i32;
        pub fn trt_builder_build_serialized(
            builder: *mut c_void,
            network: *mut c_void,
            config: *mut c_void,
        ) -> *mut c_void;

        // Builder config
        pub fn trt_destroy_config(config: *mut c_void);
        pub fn trt_config_set_workspace(config: *mut c_void, bytes: u64);
        pub fn trt_config_get_workspace(config: *mut c_void) -> u64;
        pub fn trt_config_set_flag(config: *mut c_void, flag: i32);
        pub fn trt_config_set_int8_calibrator(config: *mut c_void, calibrator: *mut c_void);
        pub fn trt_config_get_dla_core(config: *mut c_void) -> i32;

        // INT8 calibrator
        pub fn trt_create_calibrator(
            kind: i32,
            batch_size: i32,
            callbacks: TrtCalibratorCallbacks,
            user: *mut c_void,
        ) -> *mut c_void;
        pub fn trt_destroy_calibrator(calibrator: *mut c_void);

        // Network definition
        pub fn trt_destroy_network(network: *mut c_void);
        pub fn trt_network_has_implicit_batch(network: *mut c_void) -> i32;
        pub fn trt_network_nb_inputs(network: *mut c_void) -> i32;
        pub fn trt_network_input_name(network: *mut c_void, index: i32) -> *const c_char;
        pub fn trt_network_input_dims(
            network: *mut c_void,
            index: i32,
            out: *mut i64,
            max_dims: i32,
        ) -> i32;
        pub fn trt_network_nb_outputs(network: *mut c_void) -> i32;
        pub fn trt_network_unmark_all_outputs(network: *mut c_void);
        pub fn trt_network_nb_layers(network: *mut c_void) -> i32;
        pub fn trt_layer_nb_outputs(network: *mut c_void, layer: i32) -> i32;
        pub fn trt_layer_output_name(network: *mut c_void, layer: i32, index: i32) -> *const c_char;
        pub fn trt_network_mark_layer_output(network: *mut c_void, layer: i32, index: i32) -> i32;

        // ONNX parser
        pub fn trt_create_onnx_parser(network: *mut c_void) -> *mut c_void;
        pub fn trt_destroy_parser(parser: *mut c_void);
        pub fn trt_parser_parse_from_file(parser: *mut c_void, path: *const c_char) -> i32;
        pub fn trt_parser_nb_errors(parser: *mut c_void) -> i32;
        pub fn trt_parser_error_desc(parser: *mut c_void, index: i32) -> *const c_char;

        // Host memory
        pub fn trt_host_memory_data(mem: *mut c_void) -> *const c_void;
        pub fn trt_host_memory_size(mem: *mut c_void) -> u64;
        pub fn trt_destroy_host_memory(mem: *mut c_void);

        // Runtime and engine
        pub fn trt_create_runtime() -> *mut c_void;
        pub fn trt_destroy_runtime(runtime: *mut c_void);
        pub fn trt_deserialize_engine(
            runtime: *mut c_void,
            data: *const c_void,
            size: u64,
        ) -> *mut c_void;
        pub fn trt_destroy_engine(engine: *mut c_void);
        pub fn trt_engine_serialize(engine: *mut c_void) -> *mut c_void;
        pub fn trt_engine_has_implicit_batch(engine: *mut c_void) -> i32;
        pub fn trt_engine_max_batch_size(engine: *mut c_void) -> i32;
        pub fn trt_engine_nb_bindings(engine: *mut c_void) -> i32;
        pub fn trt_engine_binding_name(engine: *mut c_void, index: i32) -> *const c_char;
        pub fn trt_engine_binding_is_input(engine: *mut c_void, index: i32) -> i32;
        pub fn trt_engine_binding_dims(
            engine: *mut c_void,
            index: i32,
            out: *mut i64,
            max_dims: i32,
        ) -> i32;
        pub fn trt_engine_binding_dtype(engine: *mut c_void, index: i32) -> i32;
        pub fn trt_engine_nb_profiles(engine: *mut c_void) -> i32;
        pub fn trt_engine_profile_dims(
            engine: *mut c_void,
            index: i32,
            profile: i32,
            selector: i32,
            out: *mut i64,
            max_dims: i32,
        ) -> i32;

        // Execution context
        pub fn trt_create_execution_context(engine: *mut c_void) -> *mut c_void;
        pub fn trt_destroy_context(context: *mut c_void);
        pub fn trt_context_set_binding_dims(
            context: *mut c_void,
            index: i32,
            dims: *const i64,
            nb_dims: i32,
        ) -> i32;
        pub fn trt_context_binding_dims(
            context: *mut c_void,
            index: i32,
            out: *mut i64,
            max_dims: i32,
        ) -> i32;
        pub fn trt_context_all_dims_specified(context: *mut c_void) -> i32;
        pub fn trt_context_execute(
            context: *mut c_void,
            batch_size: i32,
            bindings: *mut *mut c_void,
        ) -> i32;
        pub fn trt_context_execute_v2(context: *mut c_void, bindings: *mut *mut c_void) -> i32;
        pub fn trt_context_enqueue(
            context: *mut c_void,
            batch_size: i32,
            bindings: *mut *mut c_void,
            stream: u64,
        ) -> i32;
        pub fn trt_context_enqueue_v2(
            context: *mut c_void,
            bindings: *mut *mut c_void,
            stream: u64,
        ) -> i32;
    }
}

#[cfg(trt_stub)]
pub mod ffi {
    //! Stand-ins used when TensorRT is not available at build time.
    //! Constructors return null; everything else reports failure.

    use super::{trt_log_callback, TrtCalibratorCallbacks};
    use std::ffi::c_void;
    use std::os::raw::c_char;
    use std::ptr;

    const UNAVAILABLE: &[u8] = b"TensorRT support was not compiled into trtinfer-trt-sys";

    pub unsafe fn trt_set_log_callback(_cb: trt_log_callback) {}
    pub unsafe fn trt_set_log_severity(_severity: i32) {}

    pub unsafe fn trt_last_error(buf: *mut c_char, len: u64) -> i32 {
        if !buf.is_null() && len > 0 {
            let n = UNAVAILABLE.len().min(len as usize - 1);
            ptr::copy_nonoverlapping(UNAVAILABLE.as_ptr() as *const c_char, buf, n);
            *buf.add(n) = 0;
        }
        UNAVAILABLE.len() as i32
    }

    pub unsafe fn trt_clear_last_error() {}
    pub unsafe fn trt_init_plugins() -> i32 {
        0
    }
    pub unsafe fn trt_get_version_major() -> i32 {
        0
    }
    pub unsafe fn trt_get_version_minor() -> i32 {
        0
    }
    pub unsafe fn trt_get_version_patch() -> i32 {
        0
    }

    pub unsafe fn trt_create_builder() -> *mut c_void {
        ptr::null_mut()
    }
    pub unsafe fn trt_destroy_builder(_builder: *mut c_void) {}
    pub unsafe fn trt_builder_platform_has_fast_fp16(_builder: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_builder_platform_has_fast_int8(_builder: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_builder_nb_dla_cores(_builder: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_builder_set_max_batch_size(_builder: *mut c_void, _batch_size: i32) {}
    pub unsafe fn trt_builder_create_network(_builder: *mut c_void, _explicit_batch: i32) -> *mut c_void {
        ptr::null_mut()
    }
    pub unsafe fn trt_builder_create_config(_builder: *mut c_void) -> *mut c_void {
        ptr::null_mut()
    }
    pub unsafe fn trt_builder_add_profile(
        _builder: *mut c_void,
        _config: *mut c_void,
        _input: *const c_char,
        _min_dims: *const i64,
        _opt_dims: *const i64,
        _max_dims: *const i64,
        _nb_dims: i32,
    ) -> i32 {
        -1
    }
    pub unsafe fn trt_builder_build_serialized(
        _builder: *mut c_void,
        _network: *mut c_void,
        _config: *mut c_void,
    ) -> *mut c_void {
        ptr::null_mut()
    }

    pub unsafe fn trt_destroy_config(_config: *mut c_void) {}
    pub unsafe fn trt_config_set_workspace(_config: *mut c_void, _bytes: u64) {}
    pub unsafe fn trt_config_get_workspace(_config: *mut c_void) -> u64 {
        0
    }
    pub unsafe fn trt_config_set_flag(_config: *mut c_void, _flag: i32) {}
    pub unsafe fn trt_config_set_int8_calibrator(_config: *mut c_void, _calibrator: *mut c_void) {}
    pub unsafe fn trt_config_get_dla_core(_config: *mut c_void) -> i32 {
        -1
    }

    pub unsafe fn trt_create_calibrator(
        _kind: i32,
        _batch_size: i32,
        _callbacks: TrtCalibratorCallbacks,
        _user: *mut c_void,
    ) -> *mut c_void {
        ptr::null_mut()
    }
    pub unsafe fn trt_destroy_calibrator(_calibrator: *mut c_void) {}

    pub unsafe fn trt_destroy_network(_network: *mut c_void) {}
    pub unsafe fn trt_network_has_implicit_batch(_network: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_network_nb_inputs(_network: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_network_input_name(_network: *mut c_void, _index: i32) -> *const c_char {
        ptr::null()
    }
    pub unsafe fn trt_network_input_dims(
        _network: *mut c_void,
        _index: i32,
        _out: *mut i64,
        _max_dims: i32,
    ) -> i32 {
        -1
    }
    pub unsafe fn trt_network_nb_outputs(_network: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_network_unmark_all_outputs(_network: *mut c_void) {}
    pub unsafe fn trt_network_nb_layers(_network: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_layer_nb_outputs(_network: *mut c_void, _layer: i32) -> i32 {
        0
    }
    pub unsafe fn trt_layer_output_name(_network: *mut c_void, _layer: i32, _index: i32) -> *const c_char {
        ptr::null()
    }
    pub unsafe fn trt_network_mark_layer_output(_network: *mut c_void, _layer: i32, _index: i32) -> i32 {
        0
    }

    pub unsafe fn trt_create_onnx_parser(_network: *mut c_void) -> *mut c_void {
        ptr::null_mut()
    }
    pub unsafe fn trt_destroy_parser(_parser: *mut c_void) {}
    pub unsafe fn trt_parser_parse_from_file(_parser: *mut c_void, _path: *const c_char) -> i32 {
        0
    }
    pub unsafe fn trt_parser_nb_errors(_parser: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_parser_error_desc(_parser: *mut c_void, _index: i32) -> *const c_char {
        ptr::null()
    }

    pub unsafe fn trt_host_memory_data(_mem: *mut c_void) -> *const c_void {
        ptr::null()
    }
    pub unsafe fn trt_host_memory_size(_mem: *mut c_void) -> u64 {
        0
    }
    pub unsafe fn trt_destroy_host_memory(_mem: *mut c_void) {}

    pub unsafe fn trt_create_runtime() -> *mut c_void {
        ptr::null_mut()
    }
    pub unsafe fn trt_destroy_runtime(_runtime: *mut c_void) {}
    pub unsafe fn trt_deserialize_engine(
        _runtime: *mut c_void,
        _data: *const c_void,
        _size: u64,
    ) -> *mut c_void {
        ptr::null_mut()
    }
    pub unsafe fn trt_destroy_engine(_engine: *mut c_void) {}
    pub unsafe fn trt_engine_serialize(_engine: *mut c_void) -> *mut c_void {
        ptr::null_mut()
    }
    pub unsafe fn trt_engine_has_implicit_batch(_engine: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_engine_max_batch_size(_engine: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_engine_nb_bindings(_engine: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_engine_binding_name(_engine: *mut c_void, _index: i32) -> *const c_char {
        ptr::null()
    }
    pub unsafe fn trt_engine_binding_is_input(_engine: *mut c_void, _index: i32) -> i32 {
        0
    }
    pub unsafe fn trt_engine_binding_dims(
        _engine: *mut c_void,
        _index: i32,
        _out: *mut i64,
        _max_dims: i32,
    ) -> i32 {
        -1
    }
    pub unsafe fn trt_engine_binding_dtype(_engine: *mut c_void, _index: i32) -> i32 {
        -1
    }
    pub unsafe fn trt_engine_nb_profiles(_engine: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_engine_profile_dims(
        _engine: *mut c_void,
        _index: i32,
        _profile: i32,
        _selector: i32,
        _out: *mut i64,
        _max_dims: i32,
    ) -> i32 {
        -1
    }

    pub unsafe fn trt_create_execution_context(_engine: *mut c_void) -> *mut c_void {
        ptr::null_mut()
    }
    pub unsafe fn trt_destroy_context(_context: *mut c_void) {}
    pub unsafe fn trt_context_set_binding_dims(
        _context: *mut c_void,
        _index: i32,
        _dims: *const i64,
        _nb_dims: i32,
    ) -> i32 {
        0
    }
    pub unsafe fn trt_context_binding_dims(
        _context: *mut c_void,
        _index: i32,
        _out: *mut i64,
        _max_dims: i32,
    ) -> i32 {
        -1
    }
    pub unsafe fn trt_context_all_dims_specified(_context: *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_context_execute(
        _context: *mut c_void,
        _batch_size: i32,
        _bindings: *mut *mut c_void,
    ) -> i32 {
        0
    }
    pub unsafe fn trt_context_execute_v2(_context: *mut c_void, _bindings: *mut *mut c_void) -> i32 {
        0
    }
    pub unsafe fn trt_context_enqueue(
        _context: *mut c_void,
        _batch_size: i32,
        _bindings: *mut *mut c_void,
        _stream: u64,
    ) -> i32 {
        0
    }
    pub unsafe fn trt_context_enqueue_v2(
        _context: *mut c_void,
        _bindings: *mut *mut c_void,
        _stream: u64,
    ) -> i32 {
        0
    }
}

pub use ffi::*;

/// Fetch the most recent error message recorded by the TensorRT logger.
pub fn last_error_message() -> String {
    let mut buf = vec![0 as c_char; 1024];
    let len = unsafe { ffi::trt_last_error(buf.as_mut_ptr(), buf.len() as u64) };
    if len <= 0 {
        return String::new();
    }
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(trt_stub)]
    fn stub_reports_unavailable() {
        assert!(STUB);
        let handle = unsafe { trt_create_runtime() };
        assert!(handle.is_null());
        assert!(last_error_message().contains("not compiled"));
    }

    #[test]
    fn calibrator_callbacks_are_c_layout() {
        assert_eq!(
            std::mem::size_of::<TrtCalibratorCallbacks>(),
            3 * std::mem::size_of::<usize>()
        );
    }
}
