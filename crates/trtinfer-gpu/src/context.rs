use std::sync::Arc;

use cudarc::driver::CudaContext;

use trtinfer_core::{InferError, Result};

use crate::stream::Stream;

/// CUDA device handle plus its default stream.
///
/// Created once at startup and shared by every session on the device.
pub struct GpuContext {
    pub device: Arc<CudaContext>,
    pub default_stream: Stream,
    device_ordinal: usize,
}

/// Configuration for GPU context initialization.
#[derive(Debug, Clone, Default)]
pub struct GpuContextConfig {
    /// GPU device ordinal (default 0).
    pub device_ordinal: usize,
}

impl GpuContext {
    /// Bind the configured device.
    pub fn new(config: GpuContextConfig) -> Result<Self> {
        tracing::info!(device = config.device_ordinal, "initializing GPU context");

        let device = CudaContext::new(config.device_ordinal)
            .map_err(|e| InferError::Cuda(format!("device init failed: {e}")))?;
        device
            .bind_to_thread()
            .map_err(|e| InferError::Cuda(format!("bind to thread failed: {e}")))?;

        // Plans are compiled for one GPU architecture.
        tracing::warn!(
            device = config.device_ordinal,
            "serialized engines are tied to this device; rebuild them when switching GPUs"
        );

        let default_stream = Stream::from_cudarc(device.default_stream());

        Ok(Self {
            device,
            default_stream,
            device_ordinal: config.device_ordinal,
        })
    }

    /// Initialize with default settings on GPU 0.
    pub fn default_device() -> Result<Self> {
        Self::new(GpuContextConfig::default())
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    /// Create an additional stream for asynchronous copies and enqueues.
    pub fn new_stream(&self) -> Result<Stream> {
        let stream = self
            .device
            .new_stream()
            .map_err(|e| InferError::Cuda(format!("stream creation failed: {e}")))?;
        Ok(Stream::from_cudarc(stream))
    }

    /// Synchronize the device (wait for all GPU work to complete).
    pub fn synchronize(&self) -> Result<()> {
        self.device
            .synchronize()
            .map_err(|e| InferError::Cuda(format!("device sync failed: {e}")))
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("device_ordinal", &self.device_ordinal)
            .finish()
    }
}
