use std::sync::Arc;

use cudarc::driver::CudaStream;

use trtinfer_core::{InferError, Result};

/// A CUDA stream handle.
///
/// Cloning shares the underlying stream. Work submitted through the async
/// session APIs is ordered on the stream it was given; nothing here
/// synchronizes implicitly.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<CudaStream>,
}

impl Stream {
    pub fn from_cudarc(inner: Arc<CudaStream>) -> Self {
        Self { inner }
    }

    pub fn cudarc(&self) -> &Arc<CudaStream> {
        &self.inner
    }

    /// Raw `CUstream` handle, as expected by TensorRT's enqueue.
    pub fn raw(&self) -> u64 {
        self.inner.cu_stream() as u64
    }

    /// Block until all work queued on this stream has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.inner
            .synchronize()
            .map_err(|e| InferError::Cuda(format!("stream sync failed: {e}")))
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("handle", &format_args!("0x{:x}", self.raw()))
            .finish()
    }
}
