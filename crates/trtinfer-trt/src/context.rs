use std::ffi::c_void;

use trtinfer_core::{DataType, Dims, EngineKind, InferError, Result, ShapeBounds};
use trtinfer_gpu::Stream;

use crate::bindings::BindingSource;
use crate::engine::{read_dims, TrtEngine};

/// An execution context bound to the engine it owns.
///
/// Dynamic inputs start at their profile-0 maximum shape so that every
/// binding has concrete dimensions for buffer sizing.
pub struct ExecutionContext {
    context_handle: *mut c_void,
    engine: TrtEngine,
    bounds: Vec<Option<ShapeBounds>>,
}

unsafe impl Send for ExecutionContext {}

impl ExecutionContext {
    pub(crate) fn new(engine: TrtEngine) -> Result<Self> {
        let context_handle = unsafe { trtinfer_trt_sys::trt_create_execution_context(engine.handle()) };
        if context_handle.is_null() {
            return Err(InferError::TensorRt(
                crate::logger::last_error()
                    .unwrap_or_else(|| "failed to create execution context".into()),
            ));
        }

        let bounds = (0..engine.nb_bindings())
            .map(|i| engine.profile_bounds(i))
            .collect();
        let mut context = Self {
            context_handle,
            engine,
            bounds,
        };

        for index in 0..context.bounds.len() {
            let Some(max) = context.bounds[index].as_ref().map(|b| b.max.clone()) else {
                continue;
            };
            context.set_binding_dimensions(index, &max)?;
        }

        tracing::debug!(
            kind = ?context.engine.kind(),
            bindings = context.bounds.len(),
            "created TensorRT execution context"
        );
        Ok(context)
    }

    pub fn engine(&self) -> &TrtEngine {
        &self.engine
    }

    pub fn kind(&self) -> EngineKind {
        self.engine.kind()
    }

    /// Profile bounds of a dynamic input, `None` for static bindings.
    pub fn bounds(&self, index: usize) -> Option<&ShapeBounds> {
        self.bounds.get(index).and_then(Option::as_ref)
    }

    /// Current shape of a binding as seen by this context.
    pub fn binding_dims(&self, index: usize) -> Result<Dims> {
        read_dims(|out, max| unsafe {
            trtinfer_trt_sys::trt_context_binding_dims(self.context_handle, index as i32, out, max)
        })
        .ok_or_else(|| InferError::InvalidBinding(format!("binding {index} has no dimensions")))
    }

    /// Set the run-time shape of an input binding. Rejection by TensorRT is
    /// reported as `DimensionMismatch`.
    pub fn set_binding_dimensions(&mut self, index: usize, dims: &Dims) -> Result<()> {
        let ok = unsafe {
            trtinfer_trt_sys::trt_context_set_binding_dims(
                self.context_handle,
                index as i32,
                dims.as_slice().as_ptr(),
                dims.rank() as i32,
            )
        };
        if ok == 0 {
            let (min, max) = self
                .bounds(index)
                .map(|b| (b.min.as_slice().to_vec(), b.max.as_slice().to_vec()))
                .unwrap_or_default();
            return Err(InferError::DimensionMismatch {
                binding: self.engine.binding_name(index).unwrap_or_else(|_| index.to_string()),
                dims: dims.as_slice().to_vec(),
                min,
                max,
            });
        }
        tracing::trace!(index, dims = %dims, "set binding dimensions");
        Ok(())
    }

    /// Run inference synchronously.
    pub fn execute(&mut self, batch_size: u32, bindings: &mut [*mut c_void]) -> Result<()> {
        self.check_ready(bindings)?;
        let ok = unsafe {
            match self.kind() {
                EngineKind::ImplicitBatch => trtinfer_trt_sys::trt_context_execute(
                    self.context_handle,
                    batch_size as i32,
                    bindings.as_mut_ptr(),
                ),
                EngineKind::ExplicitBatch => {
                    trtinfer_trt_sys::trt_context_execute_v2(self.context_handle, bindings.as_mut_ptr())
                }
            }
        };
        if ok == 0 {
            return Err(self.execution_error("execute"));
        }
        Ok(())
    }

    /// Enqueue inference on `stream` and return without waiting.
    pub fn enqueue(
        &mut self,
        batch_size: u32,
        bindings: &mut [*mut c_void],
        stream: &Stream,
    ) -> Result<()> {
        self.check_ready(bindings)?;
        let ok = unsafe {
            match self.kind() {
                EngineKind::ImplicitBatch => trtinfer_trt_sys::trt_context_enqueue(
                    self.context_handle,
                    batch_size as i32,
                    bindings.as_mut_ptr(),
                    stream.raw(),
                ),
                EngineKind::ExplicitBatch => trtinfer_trt_sys::trt_context_enqueue_v2(
                    self.context_handle,
                    bindings.as_mut_ptr(),
                    stream.raw(),
                ),
            }
        };
        if ok == 0 {
            return Err(self.execution_error("enqueue"));
        }
        tracing::trace!(stream = stream.raw(), "enqueued TensorRT inference");
        Ok(())
    }

    fn check_ready(&self, bindings: &[*mut c_void]) -> Result<()> {
        if bindings.len() != self.bounds.len() {
            return Err(InferError::InvalidBinding(format!(
                "expected {} binding pointers, got {}",
                self.bounds.len(),
                bindings.len()
            )));
        }
        if self.kind() == EngineKind::ExplicitBatch
            && unsafe { trtinfer_trt_sys::trt_context_all_dims_specified(self.context_handle) } == 0
        {
            return Err(InferError::InvalidBinding(
                "not all input dimensions are specified".into(),
            ));
        }
        Ok(())
    }

    fn execution_error(&self, op: &str) -> InferError {
        let detail = crate::logger::last_error().unwrap_or_else(|| "no details".into());
        tracing::error!(op, "{detail}");
        InferError::TensorRt(format!("{op} failed: {detail}"))
    }
}

impl BindingSource for ExecutionContext {
    fn nb_bindings(&self) -> usize {
        self.bounds.len()
    }

    fn binding_name(&self, index: usize) -> Result<String> {
        self.engine.binding_name(index)
    }

    fn binding_is_input(&self, index: usize) -> bool {
        self.engine.binding_is_input(index)
    }

    fn binding_dims(&self, index: usize) -> Result<Dims> {
        self.engine.binding_dims(index)
    }

    /// Implicit-batch engines report shapes without the batch axis, so the
    /// max batch is prepended here. Binding sizes then divide by the batch
    /// rather than by the first per-sample dimension.
    fn resolved_dims(&self, index: usize) -> Result<Dims> {
        match self.kind() {
            EngineKind::ImplicitBatch => {
                let dims = self.engine.binding_dims(index)?;
                let mut full = Vec::with_capacity(dims.rank() + 1);
                full.push(self.engine.intrinsic_batch_size().unwrap_or(1) as i64);
                full.extend_from_slice(dims.as_slice());
                Ok(Dims::new(full))
            }
            EngineKind::ExplicitBatch => ExecutionContext::binding_dims(self, index),
        }
    }

    fn binding_dtype(&self, index: usize) -> Result<DataType> {
        self.engine.binding_dtype(index)
    }

    fn shape_bounds(&self, index: usize) -> Option<ShapeBounds> {
        self.bounds(index).cloned()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if !self.context_handle.is_null() {
            unsafe { trtinfer_trt_sys::trt_destroy_context(self.context_handle) };
        }
    }
}
