pub mod error;
pub mod types;

pub use error::{InferError, Result};
pub use types::*;
