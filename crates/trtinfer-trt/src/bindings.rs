use std::ffi::c_void;

use trtinfer_core::{
    binding_size_bytes, BindingDescriptor, BindingDirection, DataType, Dims, InferError, Result,
    ShapeBounds,
};
use trtinfer_gpu::{DeviceAllocation, DeviceAllocator, DeviceBuffer};

/// Per-binding metadata the binding manager reads from a compiled engine.
///
/// Implemented by [`ExecutionContext`](crate::ExecutionContext); tests use
/// an in-memory engine description.
pub trait BindingSource {
    fn nb_bindings(&self) -> usize;
    fn binding_name(&self, index: usize) -> Result<String>;
    fn binding_is_input(&self, index: usize) -> bool;
    /// Shape as compiled, possibly with `-1` entries.
    fn binding_dims(&self, index: usize) -> Result<Dims>;
    /// Concrete shape used for sizing, batch axis first.
    fn resolved_dims(&self, index: usize) -> Result<Dims>;
    fn binding_dtype(&self, index: usize) -> Result<DataType>;
    fn shape_bounds(&self, index: usize) -> Option<ShapeBounds>;
}

/// One device buffer per engine binding, in engine binding order.
///
/// Sizes are fixed at initialization. Buffers are released when the
/// manager is dropped, including when initialization fails part-way.
pub struct BindingManager<A: DeviceAllocation = DeviceBuffer> {
    descriptors: Vec<BindingDescriptor>,
    buffers: Vec<A>,
    nb_inputs: usize,
    nb_outputs: usize,
}

impl<A: DeviceAllocation> BindingManager<A> {
    /// Describe every binding of `source` and allocate its buffer.
    pub fn initialize<S, D>(source: &S, batch_size: u32, allocator: &D) -> Result<Self>
    where
        S: BindingSource + ?Sized,
        D: DeviceAllocator<Allocation = A> + ?Sized,
    {
        if batch_size == 0 {
            return Err(InferError::InvalidInput("batch size must be positive".into()));
        }
        let count = source.nb_bindings();
        if count == 0 {
            return Err(InferError::InvalidBinding("engine has no bindings".into()));
        }

        let mut descriptors = Vec::with_capacity(count);
        let mut buffers = Vec::with_capacity(count);

        for index in 0..count {
            let name = source.binding_name(index)?;
            let dims = source.binding_dims(index)?;
            let resolved_dims = source.resolved_dims(index)?;
            let dtype = source.binding_dtype(index)?;
            let direction = if source.binding_is_input(index) {
                BindingDirection::Input
            } else {
                BindingDirection::Output
            };
            let size_bytes = binding_size_bytes(&resolved_dims, batch_size, dtype)
                .map_err(|e| InferError::InvalidBinding(format!("binding '{name}': {e}")))?;

            // Earlier buffers drop with `buffers` if this fails.
            let buffer = allocator.alloc_bytes(size_bytes)?;

            tracing::debug!(
                index,
                binding = %name,
                ?direction,
                dims = %dims,
                resolved = %resolved_dims,
                ?dtype,
                bytes = size_bytes,
                "allocated binding buffer"
            );

            descriptors.push(BindingDescriptor {
                index,
                name,
                dims,
                resolved_dims,
                dtype,
                direction,
                size_bytes,
                bounds: source.shape_bounds(index),
            });
            buffers.push(buffer);
        }

        let nb_inputs = descriptors.iter().filter(|d| d.is_input()).count();
        let nb_outputs = descriptors.len() - nb_inputs;
        let total: usize = descriptors.iter().map(|d| d.size_bytes).sum();
        tracing::info!(
            bindings = descriptors.len(),
            inputs = nb_inputs,
            outputs = nb_outputs,
            bytes = total,
            "binding buffers ready"
        );

        Ok(Self {
            descriptors,
            buffers,
            nb_inputs,
            nb_outputs,
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[BindingDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, index: usize) -> Result<&BindingDescriptor> {
        self.descriptors
            .get(index)
            .ok_or_else(|| self.out_of_range(index))
    }

    pub fn buffer(&self, index: usize) -> Result<&A> {
        self.buffers.get(index).ok_or_else(|| self.out_of_range(index))
    }

    pub fn buffer_mut(&mut self, index: usize) -> Result<&mut A> {
        let len = self.buffers.len();
        self.buffers.get_mut(index).ok_or_else(|| {
            InferError::InvalidBinding(format!("binding index {index} out of range ({len} bindings)"))
        })
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.descriptors.iter().position(|d| d.name == name)
    }

    pub fn nb_inputs(&self) -> usize {
        self.nb_inputs
    }

    pub fn nb_outputs(&self) -> usize {
        self.nb_outputs
    }

    /// Device pointers in binding order, as TensorRT expects them.
    pub fn device_ptrs(&self) -> Vec<*mut c_void> {
        self.buffers
            .iter()
            .map(|b| b.device_ptr() as *mut c_void)
            .collect()
    }

    /// Reject a host copy of `bytes` that does not fit binding `index`.
    pub fn check_copy(&self, index: usize, bytes: usize) -> Result<&BindingDescriptor> {
        let desc = self.descriptor(index)?;
        if bytes > desc.size_bytes {
            return Err(InferError::CopySizeMismatch {
                index,
                actual: bytes,
                capacity: desc.size_bytes,
            });
        }
        Ok(desc)
    }

    /// Validate a run-time shape for input `index` against its declaration
    /// and profile bounds.
    pub fn check_dimensions(&self, index: usize, dims: &Dims) -> Result<&BindingDescriptor> {
        let desc = self.descriptor(index)?;
        if !desc.is_input() {
            return Err(InferError::InvalidBinding(format!(
                "binding '{}' is an output; only input shapes can be set",
                desc.name
            )));
        }
        let mismatch = |min: &Dims, max: &Dims| InferError::DimensionMismatch {
            binding: desc.name.clone(),
            dims: dims.as_slice().to_vec(),
            min: min.as_slice().to_vec(),
            max: max.as_slice().to_vec(),
        };
        match &desc.bounds {
            Some(bounds) => bounds.check(&desc.name, dims)?,
            None if dims.rank() != desc.dims.rank() => {
                return Err(mismatch(&desc.dims, &desc.dims));
            }
            None => {
                // Static inputs only accept their compiled shape.
                let fits = desc
                    .dims
                    .as_slice()
                    .iter()
                    .zip(dims.as_slice())
                    .all(|(&declared, &d)| declared < 0 || declared == d);
                if !fits {
                    return Err(mismatch(&desc.dims, &desc.dims));
                }
            }
        }
        Ok(desc)
    }

    fn out_of_range(&self, index: usize) -> InferError {
        InferError::InvalidBinding(format!(
            "binding index {index} out of range ({} bindings)",
            self.descriptors.len()
        ))
    }
}
