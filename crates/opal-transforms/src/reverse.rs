//! Reverse-mode transform over closures.

use opal_core::autograd::{backward_multi, EnableGradGuard};
use opal_core::{OpalError, Result, Tensor};

/// Compute the vector-Jacobian product of `f` at `primals`.
///
/// Traces `f` with gradient recording forced on, seeds each output's
/// cotangent, runs the backward walk, and collects one gradient per
/// primal (zeros where no gradient flowed).
///
/// Returns `(outputs, grads)` with `grads.len() == primals.len()`.
pub fn vjp(
    f: impl Fn(&[Tensor]) -> Result<Vec<Tensor>>,
    primals: &[Tensor],
    cotangents: &[Tensor],
) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
    let (outputs, leaves) = {
        let _guard = EnableGradGuard::new();
        let mut wrapped = Vec::with_capacity(primals.len());
        let mut leaves = Vec::with_capacity(primals.len());
        for p in primals {
            let mut w = p.detach();
            w.set_requires_grad(true);
            leaves.push(
                w.grad_node()
                    .cloned()
                    .expect("requires_grad leaf must have a node"),
            );
            wrapped.push(w);
        }
        (f(&wrapped)?, leaves)
    };

    if cotangents.len() != outputs.len() {
        return Err(OpalError::invalid(
            "vjp",
            format!(
                "closure returned {} outputs but {} cotangents were given",
                outputs.len(),
                cotangents.len()
            ),
        ));
    }
    for (o, c) in outputs.iter().zip(cotangents.iter()) {
        if o.shape() != c.shape() {
            return Err(OpalError::invalid(
                "vjp",
                format!(
                    "cotangent shape {} does not match output shape {}",
                    c.shape(),
                    o.shape()
                ),
            ));
        }
    }

    let roots: Vec<_> = outputs
        .iter()
        .zip(cotangents.iter())
        .filter_map(|(o, c)| o.grad_node().map(|n| (n.clone(), c.clone())))
        .collect();
    backward_multi(&roots);

    let grads = leaves
        .iter()
        .zip(primals.iter())
        .map(|(leaf, p)| leaf.get_grad().unwrap_or_else(|| Tensor::zeros_like(p)))
        .collect();

    Ok((outputs, grads))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vjp_product() {
        // f(x, y) = x * y; df/dx = y, df/dy = x
        let x = Tensor::from_f32(&[2.0, 3.0], &[2]);
        let y = Tensor::from_f32(&[5.0, 7.0], &[2]);
        let cot = Tensor::ones(&[2]);

        let (outs, grads) = vjp(
            |inputs| Ok(vec![inputs[0].mul(&inputs[1])?]),
            &[x, y],
            &[cot],
        )
        .unwrap();

        assert_eq!(outs[0].as_f32_slice().unwrap(), &[10.0, 21.0]);
        assert_eq!(grads[0].as_f32_slice().unwrap(), &[5.0, 7.0]);
        assert_eq!(grads[1].as_f32_slice().unwrap(), &[2.0, 3.0]);
    }

    #[test]
    fn test_vjp_chained_ops() {
        // f(x) = sum(x^2) over the last axis; df/dx = 2x
        let x = Tensor::from_f32(&[1.0, -2.0, 3.0], &[3]);
        let cot = Tensor::from_f32(&[1.0], &[1]);

        let (_, grads) = vjp(
            |inputs| {
                let sq = inputs[0].square()?;
                Ok(vec![sq.sum_axis(0, true)?])
            },
            &[x],
            &[cot],
        )
        .unwrap();

        assert_eq!(grads[0].as_f32_slice().unwrap(), &[2.0, -4.0, 6.0]);
    }

    #[test]
    fn test_vjp_unused_input_gets_zeros() {
        let x = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let y = Tensor::from_f32(&[3.0, 4.0], &[2]);
        let cot = Tensor::ones(&[2]);

        let (_, grads) = vjp(|inputs| Ok(vec![inputs[0].clone()]), &[x, y], &[cot]).unwrap();

        assert_eq!(grads[0].as_f32_slice().unwrap(), &[1.0, 1.0]);
        assert_eq!(grads[1].as_f32_slice().unwrap(), &[0.0, 0.0]);
    }

    #[test]
    fn test_vjp_multiple_outputs() {
        // f(x) = (x * 2, x * 3) seeded with (1, 1): grad = 5
        let x = Tensor::from_f32(&[1.0], &[1]);
        let c1 = Tensor::ones(&[1]);
        let c2 = Tensor::ones(&[1]);

        let (_, grads) = vjp(
            |inputs| Ok(vec![inputs[0].mul_scalar(2.0)?, inputs[0].mul_scalar(3.0)?]),
            &[x],
            &[c1, c2],
        )
        .unwrap();

        assert_eq!(grads[0].as_f32_slice().unwrap(), &[5.0]);
    }

    #[test]
    fn test_vjp_cotangent_count_mismatch() {
        let x = Tensor::from_f32(&[1.0], &[1]);
        let err = vjp(|inputs| Ok(vec![inputs[0].clone()]), &[x], &[]);
        assert!(err.is_err());
    }

    #[test]
    fn test_vjp_through_intermediate_drop() {
        // The intermediate tensor from mul is dropped inside the closure;
        // the recorded graph must survive it.
        let x = Tensor::from_f32(&[2.0], &[1]);
        let cot = Tensor::ones(&[1]);
        let (_, grads) = vjp(
            |inputs| {
                let tmp = inputs[0].mul(&inputs[0])?;
                Ok(vec![tmp.add_scalar(1.0)?])
            },
            &[x],
            &[cot],
        )
        .unwrap();
        assert_eq!(grads[0].as_f32_slice().unwrap(), &[4.0]);
    }
}
