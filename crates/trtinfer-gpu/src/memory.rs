use cudarc::driver::sys::CUresult;
use cudarc::driver::DriverError;

use trtinfer_core::{InferError, Result};

use crate::buffer::DeviceBuffer;
use crate::context::GpuContext;

/// A device allocation the binding manager can hand to TensorRT.
pub trait DeviceAllocation {
    /// Raw device pointer.
    fn device_ptr(&self) -> u64;
    /// Allocation size in bytes.
    fn size_bytes(&self) -> usize;
}

/// Source of device memory.
///
/// Implemented by [`GpuContext`] for real CUDA memory; tests substitute a
/// host-side fake.
pub trait DeviceAllocator {
    type Allocation: DeviceAllocation;

    /// Allocate `size` bytes. Zero-byte requests are rejected.
    fn alloc_bytes(&self, size: usize) -> Result<Self::Allocation>;
}

impl DeviceAllocator for GpuContext {
    type Allocation = DeviceBuffer;

    fn alloc_bytes(&self, size: usize) -> Result<DeviceBuffer> {
        if size == 0 {
            return Err(InferError::InvalidInput(
                "zero-byte device allocation requested".into(),
            ));
        }

        let slice = self
            .default_stream
            .cudarc()
            .alloc_zeros::<u8>(size)
            .map_err(|e| alloc_error(size, e))?;

        let buffer = DeviceBuffer::from_cuda_slice(slice, &self.default_stream);
        tracing::trace!(bytes = size, ptr = %format_args!("0x{:x}", buffer.device_ptr()), "allocated device buffer");
        Ok(buffer)
    }
}

/// Map a failed allocation to the error taxonomy.
pub(crate) fn alloc_error(requested: usize, err: DriverError) -> InferError {
    if err.0 == CUresult::CUDA_ERROR_OUT_OF_MEMORY {
        tracing::error!(bytes = requested, "device out of memory");
        InferError::OutOfDeviceMemory { requested }
    } else {
        InferError::Cuda(format!("allocation of {requested} bytes failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_maps_to_out_of_device_memory() {
        let err = alloc_error(1 << 40, DriverError(CUresult::CUDA_ERROR_OUT_OF_MEMORY));
        assert!(matches!(
            err,
            InferError::OutOfDeviceMemory { requested } if requested == 1 << 40
        ));
    }

    #[test]
    #[ignore = "requires a CUDA device"]
    fn alloc_and_copy_round_trip() {
        let gpu = GpuContext::default_device().unwrap();
        assert!(matches!(gpu.alloc_bytes(0), Err(InferError::InvalidInput(_))));

        let mut buf = gpu.alloc_bytes(64).unwrap();
        assert_eq!(buf.size_bytes(), 64);
        assert_ne!(buf.device_ptr(), 0);

        let src: Vec<u8> = (0..48).collect();
        buf.copy_from_host(&src, &gpu.default_stream).unwrap();
        let mut dst = vec![0u8; 64];
        buf.copy_to_host(&mut dst, &gpu.default_stream).unwrap();
        gpu.default_stream.synchronize().unwrap();

        assert_eq!(&dst[..48], &src[..]);
        assert!(dst[48..].iter().all(|&b| b == 0));
        assert!(buf.copy_from_host(&[0u8; 65], &gpu.default_stream).is_err());
    }
}
