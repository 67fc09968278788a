use std::ffi::{c_void, CStr};
use std::os::raw::c_char;

use trtinfer_core::{DataType, Dims, EngineKind, InferError, Result, ShapeBounds};
use trtinfer_trt_sys::{MAX_DIMS, PROFILE_MAX, PROFILE_MIN, PROFILE_OPT};

use crate::context::ExecutionContext;

/// Copy a NUL-terminated string owned by TensorRT.
///
/// # Safety
/// `ptr` must be null or point to a valid C string.
pub(crate) unsafe fn c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

/// Run a shim dims query into a stack buffer. Negative counts mean the
/// query failed.
pub(crate) fn read_dims(query: impl FnOnce(*mut i64, i32) -> i32) -> Option<Dims> {
    let mut buf = [0i64; MAX_DIMS];
    let nb = query(buf.as_mut_ptr(), MAX_DIMS as i32);
    if nb < 0 {
        return None;
    }
    let nb = (nb as usize).min(MAX_DIMS);
    Some(Dims::new(buf[..nb].to_vec()))
}

/// Serialized plan bytes owned by TensorRT (`IHostMemory`).
pub struct HostMemory {
    handle: *mut c_void,
}

impl HostMemory {
    /// # Safety
    /// `handle` must be a live `IHostMemory` not owned elsewhere.
    pub(crate) unsafe fn from_raw(handle: *mut c_void) -> Option<Self> {
        (!handle.is_null()).then_some(Self { handle })
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            let data = trtinfer_trt_sys::trt_host_memory_data(self.handle) as *const u8;
            let size = trtinfer_trt_sys::trt_host_memory_size(self.handle) as usize;
            if data.is_null() || size == 0 {
                return &[];
            }
            std::slice::from_raw_parts(data, size)
        }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe { trtinfer_trt_sys::trt_destroy_host_memory(self.handle) };
    }
}

/// A deserialized TensorRT engine.
///
/// Exclusively owned; moved into its [`ExecutionContext`] when one is
/// created so the context is always destroyed before the engine.
pub struct TrtEngine {
    handle: *mut c_void,
    kind: EngineKind,
    max_batch_size: u32,
}

// The engine is only touched through `&self`/`&mut self` from one thread at a time.
unsafe impl Send for TrtEngine {}

impl TrtEngine {
    /// # Safety
    /// `handle` must be a live `ICudaEngine` not owned elsewhere.
    pub(crate) unsafe fn from_raw(handle: *mut c_void) -> Result<Self> {
        if handle.is_null() {
            return Err(InferError::TensorRt("null engine handle".into()));
        }
        let kind = if trtinfer_trt_sys::trt_engine_has_implicit_batch(handle) != 0 {
            EngineKind::ImplicitBatch
        } else {
            EngineKind::ExplicitBatch
        };
        let max_batch_size = trtinfer_trt_sys::trt_engine_max_batch_size(handle).max(1) as u32;
        Ok(Self {
            handle,
            kind,
            max_batch_size,
        })
    }

    pub(crate) fn handle(&self) -> *mut c_void {
        self.handle
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Batch size baked into an implicit-batch engine. Explicit-batch
    /// engines carry the batch in their binding shapes and return `None`.
    pub fn intrinsic_batch_size(&self) -> Option<u32> {
        match self.kind {
            EngineKind::ImplicitBatch => Some(self.max_batch_size),
            EngineKind::ExplicitBatch => None,
        }
    }

    pub fn nb_bindings(&self) -> usize {
        unsafe { trtinfer_trt_sys::trt_engine_nb_bindings(self.handle) }.max(0) as usize
    }

    pub fn binding_name(&self, index: usize) -> Result<String> {
        unsafe { c_string(trtinfer_trt_sys::trt_engine_binding_name(self.handle, index as i32)) }
            .ok_or_else(|| InferError::InvalidBinding(format!("binding {index} has no name")))
    }

    pub fn binding_is_input(&self, index: usize) -> bool {
        unsafe { trtinfer_trt_sys::trt_engine_binding_is_input(self.handle, index as i32) != 0 }
    }

    /// Shape as compiled; unbound dimensions are `-1`.
    pub fn binding_dims(&self, index: usize) -> Result<Dims> {
        read_dims(|out, max| unsafe {
            trtinfer_trt_sys::trt_engine_binding_dims(self.handle, index as i32, out, max)
        })
        .ok_or_else(|| InferError::InvalidBinding(format!("binding {index} has no dimensions")))
    }

    pub fn binding_dtype(&self, index: usize) -> Result<DataType> {
        let code = unsafe { trtinfer_trt_sys::trt_engine_binding_dtype(self.handle, index as i32) };
        DataType::from_trt(code).ok_or_else(|| {
            InferError::InvalidBinding(format!("binding {index} has unknown data type {code}"))
        })
    }

    pub fn nb_profiles(&self) -> usize {
        unsafe { trtinfer_trt_sys::trt_engine_nb_profiles(self.handle) }.max(0) as usize
    }

    /// Profile-0 bounds of a dynamic input binding.
    pub fn profile_bounds(&self, index: usize) -> Option<ShapeBounds> {
        if !self.binding_is_input(index) || self.nb_profiles() == 0 {
            return None;
        }
        let declared = self.binding_dims(index).ok()?;
        if !declared.is_dynamic() {
            return None;
        }
        let query = |selector: i32| {
            read_dims(|out, max| unsafe {
                trtinfer_trt_sys::trt_engine_profile_dims(
                    self.handle,
                    index as i32,
                    0,
                    selector,
                    out,
                    max,
                )
            })
            .filter(|d| d.rank() == declared.rank() && !d.is_dynamic())
        };
        Some(ShapeBounds {
            min: query(PROFILE_MIN)?,
            opt: query(PROFILE_OPT)?,
            max: query(PROFILE_MAX)?,
        })
    }

    /// Serialize the engine into a plan.
    pub fn serialize(&self) -> Result<HostMemory> {
        let mem = unsafe { trtinfer_trt_sys::trt_engine_serialize(self.handle) };
        unsafe { HostMemory::from_raw(mem) }
            .ok_or_else(|| InferError::TensorRt("engine serialization failed".into()))
    }

    /// Create the execution context. The context takes ownership of the engine.
    pub fn create_context(self) -> Result<ExecutionContext> {
        ExecutionContext::new(self)
    }
}

impl Drop for TrtEngine {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { trtinfer_trt_sys::trt_destroy_engine(self.handle) };
        }
    }
}

impl std::fmt::Debug for TrtEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrtEngine")
            .field("kind", &self.kind)
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_dims_truncates_and_rejects_failures() {
        let dims = read_dims(|out, _| unsafe {
            for (i, v) in [2i64, 3, 4].iter().enumerate() {
                *out.add(i) = *v;
            }
            3
        });
        assert_eq!(dims, Some(Dims::from([2, 3, 4])));
        assert_eq!(read_dims(|_, _| -1), None);
        assert_eq!(read_dims(|_, _| 0), Some(Dims::default()));
    }

    #[test]
    fn c_string_handles_null() {
        assert_eq!(unsafe { c_string(std::ptr::null()) }, None);
        let s = std::ffi::CString::new("input").unwrap();
        assert_eq!(unsafe { c_string(s.as_ptr()) }, Some("input".to_string()));
    }
}
