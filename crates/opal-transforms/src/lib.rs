//! # opal-transforms
//!
//! The generic transform engine surface fused operators call into:
//! reverse-mode (`vjp`), forward-mode (`jvp`), and batching (`vmap`)
//! transforms over plain `&[Tensor] -> Vec<Tensor>` closures.
//!
//! A transform never looks inside an operator: it traces the closure it
//! is handed through the gradient-recording eager ops in opal-core and
//! walks the recorded graph. That is what makes a fused operator's
//! decomposition the single source of truth for its derivatives.

mod batch;
mod forward;
mod reverse;

pub use batch::vmap;
pub use forward::jvp;
pub use reverse::vjp;
