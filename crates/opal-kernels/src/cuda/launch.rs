//! Kernel launcher with NVRTC compilation and module caching.
//!
//! Compiles kernel source at runtime, caches compiled modules per
//! (device, module name), and builds launch configurations from the
//! caller's 3-D grid and threadgroup descriptions.

use std::collections::HashSet;
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaFunction, LaunchConfig};
use parking_lot::Mutex;

use super::context::CudaError;

/// Registry of compiled modules per device.
/// Key: (device_idx, module_name)
static LOADED: std::sync::OnceLock<Mutex<HashSet<(usize, String)>>> = std::sync::OnceLock::new();

fn loaded_set() -> &'static Mutex<HashSet<(usize, String)>> {
    LOADED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Ensure a module is compiled and loaded on the given device.
/// No-op if already loaded.
pub fn ensure_module(
    device: &Arc<CudaDevice>,
    device_idx: usize,
    module_name: &str,
    source: &str,
) -> Result<(), CudaError> {
    let key = (device_idx, module_name.to_string());
    {
        let set = loaded_set().lock();
        if set.contains(&key) {
            return Ok(());
        }
    }

    log::debug!("compiling kernel module '{module_name}' for device {device_idx}");
    let ptx = cudarc::nvrtc::compile_ptx(source).map_err(|e| CudaError::Compile {
        module: module_name.to_string(),
        msg: e.to_string(),
    })?;

    device
        .load_ptx(ptx, module_name, &[])
        .map_err(|e| CudaError::ModuleLoad {
            module: module_name.to_string(),
            msg: e.to_string(),
        })?;

    loaded_set().lock().insert(key);
    Ok(())
}

/// Get a kernel function handle, compiling and loading the module if
/// needed.
pub fn get_or_load_func(
    device: &Arc<CudaDevice>,
    device_idx: usize,
    module_name: &str,
    func_name: &str,
    source: &str,
) -> Result<CudaFunction, CudaError> {
    ensure_module(device, device_idx, module_name, source)?;
    device
        .get_func(module_name, func_name)
        .ok_or_else(|| CudaError::FuncNotFound {
            module: module_name.to_string(),
            func: func_name.to_string(),
        })
}

/// Build a launch configuration from the caller's execution grid and
/// group size.
pub fn launch_config(grid: (u32, u32, u32), threadgroup: (u32, u32, u32)) -> LaunchConfig {
    LaunchConfig {
        grid_dim: grid,
        block_dim: threadgroup,
        shared_mem_bytes: 0,
    }
}
