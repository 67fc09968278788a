use cudarc::driver::{CudaSlice, DevicePtr};

use trtinfer_core::{InferError, Result};

use crate::memory::DeviceAllocation;
use crate::stream::Stream;

/// A fixed-size block of device memory backed by `cudarc`.
///
/// The raw pointer is cached at creation and never changes. Dropping the
/// buffer frees the allocation exactly once (cudarc's `CudaSlice` drop).
pub struct DeviceBuffer {
    slice: CudaSlice<u8>,
    /// Cached raw device pointer (set at creation, never changes).
    raw_ptr: u64,
}

impl DeviceBuffer {
    /// Wrap an owned `CudaSlice`.
    /// The stream is needed to extract the device pointer at creation time.
    pub fn from_cuda_slice(slice: CudaSlice<u8>, stream: &Stream) -> Self {
        let raw_ptr = {
            let (dev_ptr, _sync) = DevicePtr::device_ptr(&slice, stream.cudarc());
            dev_ptr as u64
        };
        Self { slice, raw_ptr }
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.slice.len()
    }

    /// Raw device pointer as u64.
    pub fn device_ptr(&self) -> u64 {
        self.raw_ptr
    }

    /// Queue a host-to-device copy of `src` into the start of the buffer.
    pub fn copy_from_host(&mut self, src: &[u8], stream: &Stream) -> Result<()> {
        self.check_len(src.len())?;
        if src.is_empty() {
            return Ok(());
        }
        let mut dst = self.slice.slice_mut(0..src.len());
        stream
            .cudarc()
            .memcpy_htod(src, &mut dst)
            .map_err(|e| InferError::Cuda(format!("host-to-device copy failed: {e}")))
    }

    /// Queue a device-to-host copy of the first `dst.len()` bytes.
    pub fn copy_to_host(&self, dst: &mut [u8], stream: &Stream) -> Result<()> {
        self.check_len(dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }
        let src = self.slice.slice(0..dst.len());
        stream
            .cudarc()
            .memcpy_dtoh(&src, dst)
            .map_err(|e| InferError::Cuda(format!("device-to-host copy failed: {e}")))
    }

    /// Typed upload of a `Pod` slice.
    pub fn upload<T: bytemuck::Pod>(&mut self, src: &[T], stream: &Stream) -> Result<()> {
        self.copy_from_host(bytemuck::cast_slice(src), stream)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.size_bytes() {
            return Err(InferError::InvalidInput(format!(
                "copy of {len} bytes exceeds device buffer of {} bytes",
                self.size_bytes()
            )));
        }
        Ok(())
    }
}

impl DeviceAllocation for DeviceBuffer {
    fn device_ptr(&self) -> u64 {
        self.raw_ptr
    }

    fn size_bytes(&self) -> usize {
        self.slice.len()
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("size_bytes", &self.size_bytes())
            .field("device_ptr", &format_args!("0x{:x}", self.raw_ptr))
            .finish()
    }
}
