//! Forward-mode transform over closures.
//!
//! Traces the closure the same way the reverse transform does, then
//! pushes tangents through the recorded graph leaf-to-root using each
//! node's forward rule.

use std::collections::HashMap;

use opal_core::autograd::{reachable, EnableGradGuard, NoGradGuard};
use opal_core::{OpalError, Result, Tensor};

/// Compute the Jacobian-vector product of `f` at `primals` along
/// `tangents`.
///
/// Returns `(outputs, output_tangents)` with one tangent per output
/// (zeros for outputs the inputs don't influence).
pub fn jvp(
    f: impl Fn(&[Tensor]) -> Result<Vec<Tensor>>,
    primals: &[Tensor],
    tangents: &[Tensor],
) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
    if tangents.len() != primals.len() {
        return Err(OpalError::invalid(
            "jvp",
            format!(
                "{} primals but {} tangents were given",
                primals.len(),
                tangents.len()
            ),
        ));
    }
    for (p, t) in primals.iter().zip(tangents.iter()) {
        if p.shape() != t.shape() {
            return Err(OpalError::invalid(
                "jvp",
                format!(
                    "tangent shape {} does not match primal shape {}",
                    t.shape(),
                    p.shape()
                ),
            ));
        }
    }

    let (outputs, leaf_ids) = {
        let _guard = EnableGradGuard::new();
        let mut wrapped = Vec::with_capacity(primals.len());
        let mut leaf_ids = Vec::with_capacity(primals.len());
        for p in primals {
            let mut w = p.detach();
            w.set_requires_grad(true);
            leaf_ids.push(
                w.grad_node()
                    .map(|n| n.id)
                    .expect("requires_grad leaf must have a node"),
            );
            wrapped.push(w);
        }
        (f(&wrapped)?, leaf_ids)
    };

    // Seed leaf tangents, then propagate in ascending node-id order —
    // creation order, so every node comes after its inputs.
    let _guard = NoGradGuard::new();
    let mut tangent_map: HashMap<usize, Tensor> = HashMap::new();
    for (id, t) in leaf_ids.iter().zip(tangents.iter()) {
        tangent_map.insert(*id, t.clone());
    }

    let roots: Vec<_> = outputs.iter().filter_map(|o| o.grad_node()).collect();
    let mut nodes = reachable(roots.into_iter());
    nodes.reverse(); // ascending ids: leaves first

    for node in &nodes {
        let Some(grad_fn) = node.grad_fn.as_ref() else {
            continue;
        };
        let input_tangents: Vec<Option<Tensor>> = node
            .inputs
            .iter()
            .map(|n| tangent_map.get(&n.id).cloned())
            .collect();
        if let Some(t) = grad_fn.tangent(&input_tangents) {
            tangent_map.insert(node.id, t);
        }
    }

    let output_tangents = outputs
        .iter()
        .map(|o| {
            o.grad_node()
                .and_then(|n| tangent_map.get(&n.id).cloned())
                .unwrap_or_else(|| Tensor::zeros_like(o))
        })
        .collect();

    Ok((outputs, output_tangents))
}
