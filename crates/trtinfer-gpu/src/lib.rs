pub mod buffer;
pub mod context;
pub mod memory;
pub mod stream;

pub use buffer::DeviceBuffer;
pub use context::{GpuContext, GpuContextConfig};
pub use memory::{DeviceAllocation, DeviceAllocator};
pub use stream::Stream;
