//! Batched matrix multiplication with broadcast leading dimensions.
//!
//! Attention decompositions multiply stacks like
//! `[B, H, R, L, D] @ [B, H, 1, D, S]`, so leading axes broadcast the way
//! elementwise ops do; only the trailing two axes contract.

use crate::autograd::{reduce_broadcast, GradFn};
use crate::error::OpalError;
use crate::ops::record;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Matrix multiplication over the trailing two axes, broadcasting
    /// any leading axes: `[..., m, k] @ [..., k, n] -> [..., m, n]`.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if !self.dtype().is_float() {
            return Err(OpalError::UnsupportedDType(self.dtype()));
        }
        if !other.dtype().is_float() {
            return Err(OpalError::UnsupportedDType(other.dtype()));
        }
        if self.ndim() < 2 || other.ndim() < 2 {
            return Err(OpalError::ShapeMismatch {
                expected: self.shape().dims().to_vec(),
                got: other.shape().dims().to_vec(),
            });
        }

        let a = self.contiguous()?;
        let b = other.contiguous()?;
        let a_dims = a.shape().dims();
        let b_dims = b.shape().dims();

        let m = a_dims[a_dims.len() - 2];
        let k1 = a_dims[a_dims.len() - 1];
        let k2 = b_dims[b_dims.len() - 2];
        let n = b_dims[b_dims.len() - 1];
        if k1 != k2 {
            return Err(OpalError::MatmulDimMismatch { m, k1, k2, n });
        }

        let a_lead = Shape::new(&a_dims[..a_dims.len() - 2]);
        let b_lead = Shape::new(&b_dims[..b_dims.len() - 2]);
        let out_lead = a_lead
            .broadcast_with(&b_lead)
            .ok_or_else(|| OpalError::BroadcastError {
                a: a_dims.to_vec(),
                b: b_dims.to_vec(),
            })?;

        let mut out_dims = out_lead.dims().to_vec();
        out_dims.push(m);
        out_dims.push(n);

        let batch = out_lead.numel();
        let a_data = a
            .as_f32_slice()
            .ok_or_else(|| OpalError::StorageError("matmul: missing f32 buffer".into()))?;
        let b_data = b
            .as_f32_slice()
            .ok_or_else(|| OpalError::StorageError("matmul: missing f32 buffer".into()))?;

        let mut out = vec![0.0f32; batch * m * n];
        for bi in 0..batch {
            let a_off = lead_offset(bi, &out_lead, &a_lead) * m * k1;
            let b_off = lead_offset(bi, &out_lead, &b_lead) * k1 * n;
            let o_off = bi * m * n;
            for i in 0..m {
                for j in 0..n {
                    let mut acc = 0.0f32;
                    for p in 0..k1 {
                        acc += a_data[a_off + i * k1 + p] * b_data[b_off + p * n + j];
                    }
                    out[o_off + i * n + j] = acc;
                }
            }
        }

        let out_dtype = a.dtype().promote(b.dtype());
        let result = Tensor::from_f32_with_dtype(out, &out_dims, out_dtype);
        Ok(record(
            result,
            &[self, other],
            Box::new(MatmulBackward {
                lhs: self.clone(),
                rhs: other.clone(),
            }),
        ))
    }
}

/// Map a flat index over the broadcast leading shape to a flat index over
/// one operand's leading shape.
fn lead_offset(flat_idx: usize, out_lead: &Shape, src_lead: &Shape) -> usize {
    if src_lead.ndim() == 0 {
        return 0;
    }
    let out_dims = out_lead.dims();
    let src_dims = src_lead.dims();
    let out_strides = out_lead.contiguous_strides();
    let src_strides = src_lead.contiguous_strides();

    let mut remaining = flat_idx;
    let mut src_idx = 0;
    for i in 0..out_dims.len() {
        let coord = remaining / out_strides[i];
        remaining %= out_strides[i];
        let src_dim_idx = i as isize - (out_dims.len() as isize - src_dims.len() as isize);
        if src_dim_idx >= 0 {
            let si = src_dim_idx as usize;
            if src_dims[si] > 1 {
                src_idx += coord * src_strides[si];
            }
        }
    }
    src_idx
}

/// Backward for batched matmul:
/// `C = A @ B -> dA = dC @ B^T, dB = A^T @ dC`, with broadcast leading
/// axes summed back out.
struct MatmulBackward {
    lhs: Tensor,
    rhs: Tensor,
}

impl GradFn for MatmulBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let rhs_t = self.rhs.swapaxes(-1, -2).expect("MatmulBackward rhs transpose failed");
        let lhs_t = self.lhs.swapaxes(-1, -2).expect("MatmulBackward lhs transpose failed");
        let ga = grad_output.matmul(&rhs_t).expect("MatmulBackward grad_a failed");
        let gb = lhs_t.matmul(grad_output).expect("MatmulBackward grad_b failed");
        vec![
            Some(reduce_broadcast(&ga, self.lhs.shape().dims())),
            Some(reduce_broadcast(&gb, self.rhs.shape().dims())),
        ]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        let mut acc: Option<Tensor> = None;
        if let Some(ta) = &tangents[0] {
            acc = Some(ta.matmul(&self.rhs).expect("MatmulBackward tangent failed"));
        }
        if let Some(tb) = &tangents[1] {
            let term = self.lhs.matmul(tb).expect("MatmulBackward tangent failed");
            acc = Some(match acc {
                Some(a) => a.add(&term).expect("MatmulBackward tangent sum failed"),
                None => term,
            });
        }
        acc
    }

    fn name(&self) -> &str {
        "MatmulBackward"
    }
}
