//! # opal-fast
//!
//! Fused differentiable tensor operators: normalization, rotary position
//! encoding, scaled dot-product attention, affine quantization, and
//! user-supplied compute kernels.
//!
//! Every operator here has two interchangeable implementations:
//! an accelerated device path selected by an explicit eligibility policy,
//! and an exact decomposition built from opal-core's primitive ops. The
//! decomposition is the semantic ground truth — it is what evaluates when
//! the accelerated path is unavailable, and it is what the transform
//! engine differentiates and batches, so every fused operator is
//! automatically `vjp`/`jvp`/`vmap`-capable.

pub mod attention;
pub mod custom;
pub mod norm;
pub mod policy;
pub mod primitive;
pub mod quantize;
pub mod rope;

pub use attention::{
    scaled_dot_product_attention, scaled_dot_product_attention_with_policy, SdpaPolicy,
};
pub use custom::{KernelArgValue, KernelSpec, TemplateArg};
pub use norm::{layer_norm, rms_norm};
pub use primitive::{build_fused, Decomposition, FusedPrimitive, OutputSpec};
pub use quantize::{affine_dequantize, affine_quantize, affine_quantize_with};
pub use rope::rope;
