//! # opal-core
//!
//! Core tensor engine for the Opal array framework.
//!
//! Provides the foundational `Tensor` type with:
//! - Floating dtypes (F16, BF16, F32) plus U32 for packed quantized weights
//! - CPU execution with an explicit device/stream execution target
//! - Zero-copy views (reshape, swapaxes, strided slice)
//! - Deferred tensors backed by an accelerated-path graph node, with
//!   memoized realization through the node's decomposition fallback
//! - Gradient recording for the closure-level transform engine

pub mod autograd;
pub mod device;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod shape;
pub mod storage;
pub mod stream;
pub mod tensor;

pub use device::Device;
pub use dtype::DType;
pub use error::OpalError;
pub use shape::Shape;
pub use storage::{LazySource, Storage};
pub use stream::{default_stream, set_default_device, to_stream, Stream};
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, OpalError>;
