use std::path::{Path, PathBuf};

use bytemuck::Pod;
use half::f16;

use trtinfer_core::{BindingDescriptor, DataType, Dims, EngineKind, InferError, Result};
use trtinfer_gpu::{GpuContext, Stream};

use crate::bindings::BindingManager;
use crate::builder::{EngineBuilder, EngineOptions, ModelSource};
use crate::context::ExecutionContext;
use crate::engine::TrtEngine;
use crate::store::EngineStore;

/// Everything needed to create a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub model: ModelSource,
    /// Serialized engine cache. Loaded when present, written after a build.
    pub engine_cache: PathBuf,
    pub engine: EngineOptions,
}

/// One engine, its execution context and its binding buffers.
///
/// Single-threaded: every call that touches the context takes `&mut self`.
/// Blocking copies run on the GPU context's default stream; async variants
/// use the stream they are given and never synchronize.
pub struct Session {
    // Field order is drop order: context (and its engine) before buffers.
    context: ExecutionContext,
    bindings: BindingManager,
    stream: Stream,
    batch_size: u32,
}

impl Session {
    /// Load the cached engine, or build it from the model on a cache miss,
    /// then allocate one device buffer per binding.
    ///
    /// `options.engine.max_batch_size` sets the batch only when building.
    /// The session batch always comes from the engine: the compiled max batch
    /// for implicit-batch engines, the leading dimension of binding 0 for
    /// explicit-batch engines. A disagreeing request only logs a warning.
    pub fn create(gpu: &GpuContext, options: SessionOptions) -> Result<Self> {
        let SessionOptions {
            model,
            engine_cache,
            engine: engine_options,
        } = options;

        let engine = match EngineStore::load(&engine_cache)? {
            Some(loaded) => loaded.engine,
            None => {
                tracing::info!(
                    model = %model.path.display(),
                    engine = %engine_cache.display(),
                    "no cached engine, building from model"
                );
                EngineBuilder::new(gpu, engine_options.clone()).build(&model, &engine_cache)?
            }
        };

        Self::from_engine(gpu, engine, engine_options.max_batch_size)
    }

    /// Create a session around an already deserialized engine.
    ///
    /// Implicit-batch engines run at their compiled maximum batch size.
    /// Explicit-batch engines take the batch from the leading dimension of
    /// binding 0; `requested_batch` only matters when it disagrees.
    pub fn from_engine(gpu: &GpuContext, engine: TrtEngine, requested_batch: u32) -> Result<Self> {
        let kind = engine.kind();
        let intrinsic = engine.intrinsic_batch_size();
        let context = engine.create_context()?;

        let batch_size = match intrinsic {
            Some(batch) => {
                if batch != requested_batch {
                    tracing::info!(requested = requested_batch, engine = batch, "using engine max batch size");
                }
                batch
            }
            None => {
                let leading = crate::bindings::BindingSource::resolved_dims(&context, 0)?
                    .as_slice()
                    .first()
                    .copied()
                    .unwrap_or(1);
                let batch = u32::try_from(leading).ok().filter(|&b| b > 0).ok_or_else(|| {
                    InferError::InvalidBinding(format!("binding 0 has invalid batch dimension {leading}"))
                })?;
                if batch != requested_batch {
                    tracing::warn!(
                        requested = requested_batch,
                        engine = batch,
                        "explicit-batch engine fixes the batch in its input shape"
                    );
                }
                batch
            }
        };

        let bindings = BindingManager::initialize(&context, batch_size, gpu)?;

        tracing::info!(
            kind = ?kind,
            batch_size,
            inputs = bindings.nb_inputs(),
            outputs = bindings.nb_outputs(),
            "session ready"
        );

        Ok(Self {
            context,
            bindings,
            stream: gpu.default_stream.clone(),
            batch_size,
        })
    }

    /// Run one blocking forward pass over the current device buffers.
    pub fn forward(&mut self) -> Result<()> {
        let mut ptrs = self.bindings.device_ptrs();
        self.context.execute(self.batch_size, &mut ptrs)
    }

    /// Enqueue a forward pass on `stream` and return immediately.
    pub fn forward_async(&mut self, stream: &Stream) -> Result<()> {
        let mut ptrs = self.bindings.device_ptrs();
        self.context.enqueue(self.batch_size, &mut ptrs, stream)
    }

    /// Set the run-time shape of a dynamic input.
    pub fn set_binding_dimensions(&mut self, index: usize, dims: impl Into<Dims>) -> Result<()> {
        let dims = dims.into();
        self.bindings.check_dimensions(index, &dims)?;
        self.context.set_binding_dimensions(index, &dims)
    }

    /// Copy host data into binding `index` and wait for the copy.
    pub fn copy_in<T: Pod>(&mut self, index: usize, data: &[T]) -> Result<()> {
        let stream = self.stream.clone();
        self.copy_in_async(index, data, &stream)?;
        stream.synchronize()
    }

    /// Queue a copy of host data into binding `index` on `stream`.
    pub fn copy_in_async<T: Pod>(&mut self, index: usize, data: &[T], stream: &Stream) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.bindings.check_copy(index, bytes.len())?;
        self.bindings.buffer_mut(index)?.copy_from_host(bytes, stream)
    }

    /// Copy binding `index` into `out`, resized to the whole binding, and
    /// wait for the copy.
    pub fn copy_out<T: Pod>(&self, index: usize, out: &mut Vec<T>) -> Result<()> {
        self.copy_out_async(index, out, &self.stream)?;
        self.stream.synchronize()
    }

    /// Queue a copy of binding `index` into `out` on `stream`. `out` must not
    /// be read before the stream is synchronized.
    pub fn copy_out_async<T: Pod>(&self, index: usize, out: &mut Vec<T>, stream: &Stream) -> Result<()> {
        let size = self.bindings.descriptor(index)?.size_bytes;
        let len = size / std::mem::size_of::<T>();
        out.resize(len, T::zeroed());
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out.as_mut_slice());
        self.bindings.check_copy(index, bytes.len())?;
        self.bindings.buffer(index)?.copy_to_host(bytes, stream)
    }

    /// Copy a `Float` or `Half` binding out as `f32`.
    pub fn copy_out_f32(&self, index: usize) -> Result<Vec<f32>> {
        match self.binding_dtype(index)? {
            DataType::Float => {
                let mut out = Vec::new();
                self.copy_out::<f32>(index, &mut out)?;
                Ok(out)
            }
            DataType::Half => {
                let mut raw = Vec::new();
                self.copy_out::<f16>(index, &mut raw)?;
                Ok(raw.into_iter().map(f16::to_f32).collect())
            }
            other => Err(InferError::InvalidBinding(format!(
                "binding {index} has data type {other:?}, expected float or half"
            ))),
        }
    }

    /// Serialize the live engine to `path`.
    pub fn save_engine(&self, path: &Path) -> Result<()> {
        EngineStore::save(self.context.engine(), path)
    }

    pub fn bindings(&self) -> &[BindingDescriptor] {
        self.bindings.descriptors()
    }

    pub fn binding(&self, index: usize) -> Result<&BindingDescriptor> {
        self.bindings.descriptor(index)
    }

    pub fn binding_index(&self, name: &str) -> Option<usize> {
        self.bindings.index_of(name)
    }

    pub fn nb_bindings(&self) -> usize {
        self.bindings.len()
    }

    pub fn nb_input_bindings(&self) -> usize {
        self.bindings.nb_inputs()
    }

    pub fn nb_output_bindings(&self) -> usize {
        self.bindings.nb_outputs()
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.context.kind()
    }

    pub fn binding_ptr(&self, index: usize) -> Result<u64> {
        Ok(self.bindings.buffer(index)?.device_ptr())
    }

    pub fn binding_size(&self, index: usize) -> Result<usize> {
        Ok(self.bindings.descriptor(index)?.size_bytes)
    }

    /// Declared dimensions; `-1` marks an unbound dimension.
    pub fn binding_dims(&self, index: usize) -> Result<&Dims> {
        Ok(&self.bindings.descriptor(index)?.dims)
    }

    /// Current run-time dimensions as seen by the execution context.
    pub fn current_binding_dims(&self, index: usize) -> Result<Dims> {
        self.bindings.descriptor(index)?;
        self.context.binding_dims(index)
    }

    pub fn binding_dtype(&self, index: usize) -> Result<DataType> {
        Ok(self.bindings.descriptor(index)?.dtype)
    }

    pub fn binding_name(&self, index: usize) -> Result<&str> {
        Ok(&self.bindings.descriptor(index)?.name)
    }

    pub fn default_stream(&self) -> &Stream {
        &self.stream
    }
}
