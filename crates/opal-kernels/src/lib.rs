//! # opal-kernels
//!
//! Device kernel plumbing for Opal.
//!
//! Provides:
//! - CPU bit-pack/unpack kernels for the affine quantization codec
//! - CUDA dispatch for user-defined kernels (behind the `cuda` feature):
//!   NVRTC compilation, a per-device module cache, and launch helpers

pub mod pack;

#[cfg(feature = "cuda")]
pub mod cuda;
