//! CUDA dispatch for user-defined kernels (behind the `cuda` feature).

pub mod context;
pub mod launch;

pub use context::{CudaContext, CudaError};
pub use launch::{get_or_load_func, launch_config};
