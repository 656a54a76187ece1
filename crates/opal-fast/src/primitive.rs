//! The fused-operator primitive: a graph-node kind that wraps a
//! decomposition closure and answers every differentiation/batching
//! query by re-invoking the generic transform engine over that closure —
//! never over its accelerated kernel.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

use opal_core::storage::LazySource;
use opal_core::{DType, OpalError, Result, Stream, Tensor};

/// A decomposition: the reference sequence of primitive ops defining an
/// operator's exact semantics.
///
/// Implementations must be pure with respect to captured state — a
/// decomposition may be invoked any number of times by independent
/// transform passes (forward, reverse, batched).
pub trait Decomposition: Send + Sync {
    fn evaluate(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>>;
}

impl<F> Decomposition for F
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync,
{
    fn evaluate(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self(inputs)
    }
}

/// Declared shape and dtype of one fused-node output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl OutputSpec {
    pub fn new(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
        }
    }
}

/// One fused-operator kind.
///
/// Concrete kinds hold only their scalar parameters and stream; the
/// decomposition closure is derived from those on demand. The default
/// transform answers route through the generic engine over the
/// decomposition; operators with cheaper analytic rules (the norms, RoPE)
/// override `vjp`.
pub trait FusedPrimitive: Send + Sync + 'static {
    /// Operator name used in diagnostics.
    fn name(&self) -> &'static str;

    /// The stream this node is bound to evaluate on.
    fn stream(&self) -> Stream;

    /// The decomposition closure this node was built from.
    fn decomposition(&self) -> Arc<dyn Decomposition>;

    /// Downcast support for per-kind equivalence comparison.
    fn as_any(&self) -> &dyn Any;

    /// Reverse-mode rule: gradients of the decomposition with respect to
    /// the primals at `argnums` (ascending index order), given upstream
    /// cotangents.
    fn vjp(
        &self,
        primals: &[Tensor],
        cotangents: &[Tensor],
        argnums: &[usize],
        outputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        let _ = outputs;
        let f = self.decomposition();
        let (_, grads) = opal_transforms::vjp(|ins| f.evaluate(ins), primals, cotangents)?;
        let mut order = argnums.to_vec();
        order.sort_unstable();
        order
            .iter()
            .map(|&i| {
                grads.get(i).cloned().ok_or_else(|| {
                    OpalError::invalid(
                        "vjp",
                        format!("argnum {i} out of range for {} primals", primals.len()),
                    )
                })
            })
            .collect()
    }

    /// Forward-mode rule: tangents of every output. Inputs not named in
    /// `argnums` get a zero tangent of matching shape before the generic
    /// forward transform runs over the decomposition.
    fn jvp(&self, primals: &[Tensor], tangents: &[Tensor], argnums: &[usize]) -> Result<Vec<Tensor>> {
        let mut all_tangents = Vec::with_capacity(primals.len());
        let mut j = 0;
        for (i, p) in primals.iter().enumerate() {
            if j < argnums.len() && i == argnums[j] {
                all_tangents.push(tangents[j].clone());
                j += 1;
            } else {
                all_tangents.push(Tensor::zeros_like(p));
            }
        }
        let f = self.decomposition();
        let (_, jvps) = opal_transforms::jvp(|ins| f.evaluate(ins), primals, &all_tangents)?;
        Ok(jvps)
    }

    /// Batching rule: the generic batching transform over the
    /// decomposition, with every output reported as batched along axis 0.
    fn vmap(
        &self,
        inputs: &[Tensor],
        axes: &[Option<usize>],
    ) -> Result<(Vec<Tensor>, Vec<usize>)> {
        let f = self.decomposition();
        let outputs = opal_transforms::vmap(|ins| f.evaluate(ins), inputs, axes)?;
        let out_axes = vec![0; outputs.len()];
        Ok((outputs, out_axes))
    }

    /// Whether two nodes of the same kind may share cached execution:
    /// scalar-parameter equality, compared per kind. Tensor inputs are
    /// the enclosing graph-equality mechanism's job, not this one's.
    fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool;
}

/// An accelerated-path graph node: a fused primitive plus the inputs it
/// was built from and its declared outputs. Immutable once constructed.
///
/// Realization runs the accelerated backend when one is registered for
/// the node's stream; with none in scope it evaluates the stored
/// decomposition — the fallback contract that keeps the two paths
/// interchangeable.
pub struct FusedNode {
    primitive: Arc<dyn FusedPrimitive>,
    inputs: Vec<Tensor>,
    outputs: Vec<OutputSpec>,
    evaluated: RwLock<Option<Vec<Tensor>>>,
}

impl FusedNode {
    pub fn primitive(&self) -> &Arc<dyn FusedPrimitive> {
        &self.primitive
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    fn evaluate_all(&self) -> Result<Vec<Tensor>> {
        if let Some(outs) = self.evaluated.read().as_ref() {
            return Ok(outs.clone());
        }
        let mut slot = self.evaluated.write();
        if let Some(outs) = slot.as_ref() {
            return Ok(outs.clone());
        }
        log::debug!(
            "no accelerated backend for {}; evaluating decomposition on {}",
            self.primitive.name(),
            self.primitive.stream()
        );
        let outs = self.primitive.decomposition().evaluate(&self.inputs)?;
        if outs.len() != self.outputs.len() {
            return Err(OpalError::StorageError(format!(
                "{} decomposition produced {} outputs, node declared {}",
                self.primitive.name(),
                outs.len(),
                self.outputs.len()
            )));
        }
        *slot = Some(outs.clone());
        Ok(outs)
    }
}

impl LazySource for FusedNode {
    fn realize_output(&self, index: usize) -> Result<Tensor> {
        let outs = self.evaluate_all()?;
        outs.get(index).cloned().ok_or_else(|| {
            OpalError::StorageError(format!(
                "{} has no output {index}",
                self.primitive.name()
            ))
        })
    }

    fn name(&self) -> &'static str {
        self.primitive.name()
    }
}

/// Construct an accelerated-path node and return one deferred tensor per
/// declared output, bound to the primitive's stream.
pub fn build_fused(
    primitive: Arc<dyn FusedPrimitive>,
    inputs: Vec<Tensor>,
    outputs: Vec<OutputSpec>,
) -> Vec<Tensor> {
    let stream = primitive.stream();
    let node = Arc::new(FusedNode {
        primitive,
        inputs,
        outputs: outputs.clone(),
        evaluated: RwLock::new(None),
    });
    outputs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            Tensor::deferred(
                node.clone() as Arc<dyn LazySource>,
                i,
                &spec.shape,
                spec.dtype,
                stream.device,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::Device;

    struct Doubler {
        factor: f32,
        stream: Stream,
    }

    impl FusedPrimitive for Doubler {
        fn name(&self) -> &'static str {
            "doubler"
        }
        fn stream(&self) -> Stream {
            self.stream
        }
        fn decomposition(&self) -> Arc<dyn Decomposition> {
            let factor = self.factor;
            Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>> { Ok(vec![inputs[0].mul_scalar(factor)?]) })
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool {
            other
                .as_any()
                .downcast_ref::<Doubler>()
                .is_some_and(|o| o.factor == self.factor)
        }
    }

    fn doubler() -> Arc<Doubler> {
        Arc::new(Doubler {
            factor: 2.0,
            stream: Stream::new(Device::Gpu(0)),
        })
    }

    #[test]
    fn test_deferred_node_realizes_through_decomposition() {
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        let outs = build_fused(
            doubler(),
            vec![x],
            vec![OutputSpec::new(&[3], DType::F32)],
        );
        assert_eq!(outs.len(), 1);
        assert!(outs[0].is_deferred());
        assert_eq!(outs[0].device(), Device::Gpu(0));

        let concrete = outs[0].contiguous().unwrap();
        assert_eq!(concrete.as_f32_slice().unwrap(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_default_vjp_selects_requested_argnums() {
        let p = doubler();
        let x = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let cot = Tensor::ones(&[2]);
        let grads = p.vjp(&[x], &[cot], &[0], &[]).unwrap();
        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].as_f32_slice().unwrap(), &[2.0, 2.0]);
    }

    #[test]
    fn test_default_jvp_zero_fills_untracked() {
        struct AddTwo {
            stream: Stream,
        }
        impl FusedPrimitive for AddTwo {
            fn name(&self) -> &'static str {
                "add_two"
            }
            fn stream(&self) -> Stream {
                self.stream
            }
            fn decomposition(&self) -> Arc<dyn Decomposition> {
                Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>> { Ok(vec![inputs[0].add(&inputs[1])?]) })
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool {
                other.as_any().downcast_ref::<AddTwo>().is_some()
            }
        }

        let p = AddTwo {
            stream: Stream::new(Device::Cpu),
        };
        let a = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let b = Tensor::from_f32(&[10.0, 20.0], &[2]);
        // Only input 1 is tangent-tracked; input 0 gets a zero tangent.
        let t = Tensor::from_f32(&[1.0, 1.0], &[2]);
        let jvps = p.jvp(&[a, b], &[t], &[1]).unwrap();
        assert_eq!(jvps[0].as_f32_slice().unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn test_default_vmap_reports_axis_zero() {
        let p = doubler();
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let (outs, axes) = p.vmap(&[x], &[Some(0)]).unwrap();
        assert_eq!(axes, vec![0]);
        assert_eq!(outs[0].shape().dims(), &[2, 2]);
        assert_eq!(outs[0].as_f32_slice().unwrap(), &[2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_equivalence_is_per_kind_scalar_equality() {
        let a = Doubler {
            factor: 2.0,
            stream: Stream::new(Device::Cpu),
        };
        let b = Doubler {
            factor: 2.0,
            stream: Stream::new(Device::Gpu(0)),
        };
        let c = Doubler {
            factor: 3.0,
            stream: Stream::new(Device::Cpu),
        };
        assert!(a.is_equivalent(&b));
        assert!(!a.is_equivalent(&c));
    }
}
