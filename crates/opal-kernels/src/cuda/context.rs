//! CUDA device context management.

use std::sync::Arc;

use cudarc::driver::CudaDevice;

/// Errors from the CUDA dispatch layer.
#[derive(Debug, thiserror::Error)]
pub enum CudaError {
    #[error("CUDA device init failed: {0}")]
    Init(String),

    #[error("kernel compilation failed for module '{module}': {msg}")]
    Compile { module: String, msg: String },

    #[error("failed to load module '{module}': {msg}")]
    ModuleLoad { module: String, msg: String },

    #[error("function '{func}' not found in module '{module}'")]
    FuncNotFound { module: String, func: String },

    #[error("CUDA kernel launch failed: {0}")]
    Launch(String),

    #[error("CUDA memory error: {0}")]
    Memory(String),
}

/// A handle to one CUDA device.
pub struct CudaContext {
    device: Arc<CudaDevice>,
    index: usize,
}

impl CudaContext {
    /// Open (or create) a context on the given device index.
    pub fn new(index: usize) -> Result<Self, CudaError> {
        let device = CudaDevice::new(index).map_err(|e| CudaError::Init(e.to_string()))?;
        Ok(Self { device, index })
    }

    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    pub fn index(&self) -> usize {
        self.index
    }
}
