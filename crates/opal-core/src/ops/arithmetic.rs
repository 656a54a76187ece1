//! Element-wise arithmetic operations on tensors.

use rayon::prelude::*;

use crate::autograd::{self, GradFn, GradNode};
use crate::dtype::DType;
use crate::error::OpalError;
use crate::shape::Shape;
use crate::tensor::{round_to_dtype, Tensor};
use crate::Result;

const PAR_THRESHOLD: usize = 8192;

/// Attach a gradient node to `result` when recording is on and any
/// operand tracks gradients. Non-tracking operands get a fresh leaf so
/// node inputs stay positionally aligned with the op's operands.
pub(crate) fn record(result: Tensor, operands: &[&Tensor], grad_fn: Box<dyn GradFn>) -> Tensor {
    if !autograd::is_grad_enabled() || !operands.iter().any(|t| t.tracks_grad()) {
        return result;
    }
    let nodes = operands
        .iter()
        .map(|t| t.grad_node().cloned().unwrap_or_else(GradNode::leaf))
        .collect();
    result.with_grad_node(GradNode::with_grad_fn(grad_fn, nodes))
}

impl Tensor {
    /// Element-wise addition with broadcasting: self + other.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a + b)?;
        Ok(record(
            out,
            &[self, other],
            Box::new(autograd::AddBackward {
                a_dims: self.shape().dims().to_vec(),
                b_dims: other.shape().dims().to_vec(),
                out_dims: broadcast_dims(self, other)?,
            }),
        ))
    }

    /// Element-wise subtraction with broadcasting: self - other.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a - b)?;
        Ok(record(
            out,
            &[self, other],
            Box::new(autograd::SubBackward {
                a_dims: self.shape().dims().to_vec(),
                b_dims: other.shape().dims().to_vec(),
                out_dims: broadcast_dims(self, other)?,
            }),
        ))
    }

    /// Element-wise multiplication with broadcasting: self * other.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a * b)?;
        Ok(record(
            out,
            &[self, other],
            Box::new(autograd::MulBackward {
                lhs: self.clone(),
                rhs: other.clone(),
            }),
        ))
    }

    /// Element-wise division with broadcasting: self / other.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        let out = binary_op(self, other, |a, b| a / b)?;
        Ok(record(
            out,
            &[self, other],
            Box::new(autograd::DivBackward {
                lhs: self.clone(),
                rhs: other.clone(),
            }),
        ))
    }

    /// Element-wise negation: -self.
    pub fn neg(&self) -> Result<Tensor> {
        let out = unary_op(self, |a| -a)?;
        Ok(record(out, &[self], Box::new(autograd::NegBackward)))
    }

    /// Element-wise absolute value.
    pub fn abs(&self) -> Result<Tensor> {
        let out = unary_op(self, |a| a.abs())?;
        Ok(record(
            out,
            &[self],
            Box::new(autograd::AbsBackward { input: self.clone() }),
        ))
    }

    /// Element-wise square root.
    pub fn sqrt(&self) -> Result<Tensor> {
        let out = unary_op(self, |a| a.sqrt())?;
        Ok(record(
            out.clone(),
            &[self],
            Box::new(autograd::SqrtBackward { output: out }),
        ))
    }

    /// Element-wise reciprocal square root: 1 / sqrt(self).
    pub fn rsqrt(&self) -> Result<Tensor> {
        let out = unary_op(self, |a| 1.0 / a.sqrt())?;
        Ok(record(
            out.clone(),
            &[self],
            Box::new(autograd::RsqrtBackward { output: out }),
        ))
    }

    /// Element-wise square.
    pub fn square(&self) -> Result<Tensor> {
        let out = unary_op(self, |a| a * a)?;
        Ok(record(
            out,
            &[self],
            Box::new(autograd::SquareBackward { input: self.clone() }),
        ))
    }

    /// Element-wise exponential: e^self.
    pub fn exp(&self) -> Result<Tensor> {
        let out = unary_op(self, |a| a.exp())?;
        Ok(record(
            out.clone(),
            &[self],
            Box::new(autograd::ExpBackward { output: out }),
        ))
    }

    /// Element-wise natural logarithm.
    pub fn log(&self) -> Result<Tensor> {
        let out = unary_op(self, |a| a.ln())?;
        Ok(record(
            out,
            &[self],
            Box::new(autograd::LogBackward { input: self.clone() }),
        ))
    }

    /// Element-wise sine.
    pub fn sin(&self) -> Result<Tensor> {
        let out = unary_op(self, |a| a.sin())?;
        Ok(record(
            out,
            &[self],
            Box::new(autograd::SinBackward { input: self.clone() }),
        ))
    }

    /// Element-wise cosine.
    pub fn cos(&self) -> Result<Tensor> {
        let out = unary_op(self, |a| a.cos())?;
        Ok(record(
            out,
            &[self],
            Box::new(autograd::CosBackward { input: self.clone() }),
        ))
    }

    /// Element-wise sign: -1, 0, or +1. Piecewise constant, so no
    /// gradient is recorded.
    pub fn sign(&self) -> Result<Tensor> {
        unary_op(self, |a| {
            if a > 0.0 {
                1.0
            } else if a < 0.0 {
                -1.0
            } else {
                0.0
            }
        })
    }

    /// Element-wise rounding to the nearest integer. Piecewise constant,
    /// so no gradient is recorded.
    pub fn round(&self) -> Result<Tensor> {
        unary_op(self, |a| a.round())
    }

    /// Clamp all elements to [min, max]. Used by the integer-domain
    /// quantization path; no gradient is recorded.
    pub fn clamp(&self, min: f32, max: f32) -> Result<Tensor> {
        unary_op(self, |a| a.clamp(min, max))
    }

    /// Element-wise power with a scalar exponent.
    pub fn pow_scalar(&self, exponent: f32) -> Result<Tensor> {
        let out = unary_op(self, |a| a.powf(exponent))?;
        Ok(record(
            out,
            &[self],
            Box::new(autograd::PowScalarBackward {
                input: self.clone(),
                exponent,
            }),
        ))
    }

    /// Scalar addition: self + scalar.
    pub fn add_scalar(&self, scalar: f32) -> Result<Tensor> {
        let out = unary_op(self, |a| a + scalar)?;
        Ok(record(out, &[self], Box::new(autograd::AddScalarBackward)))
    }

    /// Scalar multiplication: self * scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Result<Tensor> {
        let out = unary_op(self, |a| a * scalar)?;
        Ok(record(
            out,
            &[self],
            Box::new(autograd::MulScalarBackward { scalar }),
        ))
    }

    /// Cast to another dtype.
    ///
    /// Float-to-float casts round through the target's representable set
    /// and are differentiable; casts touching U32 truncate/convert and
    /// record no gradient.
    pub fn astype(&self, dtype: DType) -> Result<Tensor> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let src = self.contiguous()?;
        let out = match (src.dtype(), dtype) {
            (DType::U32, d) if d.is_float() => {
                let data = src
                    .as_u32_slice()
                    .ok_or_else(|| OpalError::StorageError("astype: missing u32 buffer".into()))?;
                let vals: Vec<f32> = data.iter().map(|&v| v as f32).collect();
                Tensor::from_f32_with_dtype(vals, src.shape().dims(), dtype)
            }
            (s, DType::U32) if s.is_float() => {
                let data = src
                    .as_f32_slice()
                    .ok_or_else(|| OpalError::StorageError("astype: missing f32 buffer".into()))?;
                let vals: Vec<u32> = data.iter().map(|&v| v.max(0.0) as u32).collect();
                Tensor::from_u32(&vals, src.shape().dims())
            }
            (s, d) if s.is_float() && d.is_float() => {
                let data = src
                    .as_f32_slice()
                    .ok_or_else(|| OpalError::StorageError("astype: missing f32 buffer".into()))?;
                let vals: Vec<f32> = data.iter().map(|&v| round_to_dtype(v, d)).collect();
                let out = Tensor::from_f32_with_dtype(vals, src.shape().dims(), d);
                return Ok(record(
                    out,
                    &[self],
                    Box::new(autograd::AstypeBackward {
                        src_dtype: s,
                        dst_dtype: d,
                    }),
                ));
            }
            (s, _) => return Err(OpalError::UnsupportedDType(s)),
        };
        Ok(out)
    }
}

fn broadcast_dims(a: &Tensor, b: &Tensor) -> Result<Vec<usize>> {
    a.shape()
        .broadcast_with(b.shape())
        .map(|s| s.dims().to_vec())
        .ok_or_else(|| OpalError::BroadcastError {
            a: a.shape().dims().to_vec(),
            b: b.shape().dims().to_vec(),
        })
}

/// Apply a unary operation element-wise. Math runs in f32; the result
/// keeps the input dtype (rounding back through narrow kinds).
pub(crate) fn unary_op(a: &Tensor, op: impl Fn(f32) -> f32 + Sync) -> Result<Tensor> {
    if !a.dtype().is_float() {
        return Err(OpalError::UnsupportedDType(a.dtype()));
    }
    let a = a.contiguous()?;
    let data = a
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError("unary op: missing f32 buffer".into()))?;
    let result: Vec<f32> = if data.len() >= PAR_THRESHOLD {
        data.par_iter().map(|&v| op(v)).collect()
    } else {
        data.iter().map(|&v| op(v)).collect()
    };
    Ok(Tensor::from_f32_with_dtype(
        result,
        a.shape().dims(),
        a.dtype(),
    ))
}

/// Apply a binary operation element-wise with broadcasting. Math runs in
/// f32; the result carries the promoted dtype of the operands.
pub(crate) fn binary_op(
    a: &Tensor,
    b: &Tensor,
    op: impl Fn(f32, f32) -> f32 + Sync,
) -> Result<Tensor> {
    if !a.dtype().is_float() {
        return Err(OpalError::UnsupportedDType(a.dtype()));
    }
    if !b.dtype().is_float() {
        return Err(OpalError::UnsupportedDType(b.dtype()));
    }

    let out_shape = a
        .shape()
        .broadcast_with(b.shape())
        .ok_or_else(|| OpalError::BroadcastError {
            a: a.shape().dims().to_vec(),
            b: b.shape().dims().to_vec(),
        })?;
    let out_dtype = a.dtype().promote(b.dtype());
    let numel = out_shape.numel();

    let a_cont = a.contiguous()?;
    let b_cont = b.contiguous()?;
    let a_data = a_cont
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError("binary op: missing f32 buffer".into()))?;
    let b_data = b_cont
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError("binary op: missing f32 buffer".into()))?;

    let result: Vec<f32> = if a.shape() == b.shape() {
        if numel >= PAR_THRESHOLD {
            a_data
                .par_iter()
                .zip(b_data.par_iter())
                .map(|(&x, &y)| op(x, y))
                .collect()
        } else {
            a_data
                .iter()
                .zip(b_data.iter())
                .map(|(&x, &y)| op(x, y))
                .collect()
        }
    } else {
        let mut result = vec![0.0f32; numel];
        for (i, r) in result.iter_mut().enumerate() {
            let a_idx = broadcast_index(i, &out_shape, a_cont.shape());
            let b_idx = broadcast_index(i, &out_shape, b_cont.shape());
            *r = op(a_data[a_idx], b_data[b_idx]);
        }
        result
    };

    Ok(Tensor::from_f32_with_dtype(
        result,
        out_shape.dims(),
        out_dtype,
    ))
}

/// Compute the source index for a broadcast element.
fn broadcast_index(flat_idx: usize, out_shape: &Shape, src_shape: &Shape) -> usize {
    let out_dims = out_shape.dims();
    let src_dims = src_shape.dims();
    let out_ndim = out_dims.len();
    let src_ndim = src_dims.len();

    let mut remaining = flat_idx;
    let mut src_idx = 0;
    let out_strides = out_shape.contiguous_strides();
    let src_strides = src_shape.contiguous_strides();

    for i in 0..out_ndim {
        let coord = remaining / out_strides[i];
        remaining %= out_strides[i];

        let src_dim_idx = i as isize - (out_ndim as isize - src_ndim as isize);
        if src_dim_idx >= 0 {
            let si = src_dim_idx as usize;
            if src_dims[si] > 1 {
                src_idx += coord * src_strides[si];
            }
            // size-1 source axes broadcast: coord maps to 0
        }
    }

    src_idx
}

// Operator overloads
impl std::ops::Add for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Tensor {
        Tensor::add(self, rhs).expect("Add failed")
    }
}

impl std::ops::Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Tensor {
        Tensor::sub(self, rhs).expect("Sub failed")
    }
}

impl std::ops::Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Tensor {
        Tensor::mul(self, rhs).expect("Mul failed")
    }
}

impl std::ops::Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        Tensor::neg(self).expect("Neg failed")
    }
}

#[cfg(test)]
mod tests {
    use crate::{DType, Tensor};

    #[test]
    fn test_add() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        let b = Tensor::from_f32(&[4.0, 5.0, 6.0], &[3]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.as_f32_slice().unwrap(), &[5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_broadcast_add() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = Tensor::from_f32(&[10.0, 20.0, 30.0], &[3]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.shape().dims(), &[2, 3]);
        assert_eq!(
            c.as_f32_slice().unwrap(),
            &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
        );
    }

    #[test]
    fn test_broadcast_keepdims_shape() {
        // [2, 1] * [2, 3] broadcasts along the kept axis
        let a = Tensor::from_f32(&[2.0, 10.0], &[2, 1]);
        let b = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let c = a.mul(&b).unwrap();
        assert_eq!(c.as_f32_slice().unwrap(), &[2.0, 4.0, 6.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn test_sub_mul_div() {
        let a = Tensor::from_f32(&[4.0, 9.0], &[2]);
        let b = Tensor::from_f32(&[2.0, 3.0], &[2]);
        assert_eq!(a.sub(&b).unwrap().as_f32_slice().unwrap(), &[2.0, 6.0]);
        assert_eq!(a.mul(&b).unwrap().as_f32_slice().unwrap(), &[8.0, 27.0]);
        assert_eq!(a.div(&b).unwrap().as_f32_slice().unwrap(), &[2.0, 3.0]);
    }

    #[test]
    fn test_unary_ops() {
        let a = Tensor::from_f32(&[-1.0, 0.0, 4.0], &[3]);
        assert_eq!(a.abs().unwrap().as_f32_slice().unwrap(), &[1.0, 0.0, 4.0]);
        assert_eq!(a.neg().unwrap().as_f32_slice().unwrap(), &[1.0, 0.0, -4.0]);
        assert_eq!(a.sign().unwrap().as_f32_slice().unwrap(), &[-1.0, 0.0, 1.0]);
        let s = a.square().unwrap();
        assert_eq!(s.as_f32_slice().unwrap(), &[1.0, 0.0, 16.0]);
    }

    #[test]
    fn test_rsqrt() {
        let a = Tensor::from_f32(&[4.0, 16.0], &[2]);
        let r = a.rsqrt().unwrap();
        let data = r.as_f32_slice().unwrap();
        assert!((data[0] - 0.5).abs() < 1e-6);
        assert!((data[1] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_round_clamp() {
        let a = Tensor::from_f32(&[-0.6, 0.4, 2.5, 7.0], &[4]);
        assert_eq!(a.round().unwrap().as_f32_slice().unwrap(), &[-1.0, 0.0, 3.0, 7.0]);
        assert_eq!(
            a.clamp(0.0, 3.0).unwrap().as_f32_slice().unwrap(),
            &[0.0, 0.4, 2.5, 3.0]
        );
    }

    #[test]
    fn test_scalar_ops() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        assert_eq!(
            a.add_scalar(10.0).unwrap().as_f32_slice().unwrap(),
            &[11.0, 12.0, 13.0]
        );
        assert_eq!(
            a.mul_scalar(2.0).unwrap().as_f32_slice().unwrap(),
            &[2.0, 4.0, 6.0]
        );
    }

    #[test]
    fn test_exp_log() {
        let a = Tensor::from_f32(&[0.0, 1.0], &[2]);
        let b = a.exp().unwrap();
        let data = b.as_f32_slice().unwrap();
        assert!((data[0] - 1.0).abs() < 1e-6);
        assert!((data[1] - std::f32::consts::E).abs() < 1e-5);

        let c = b.log().unwrap();
        let data = c.as_f32_slice().unwrap();
        assert!((data[0] - 0.0).abs() < 1e-6);
        assert!((data[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_dtype_promotion_in_binary() {
        let a = Tensor::from_f32_with_dtype(vec![1.0, 2.0], &[2], DType::F16);
        let b = Tensor::from_f32(&[1.0, 1.0], &[2]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.dtype(), DType::F32);
    }

    #[test]
    fn test_astype_narrow_rounds() {
        let v = 1.0f32 + 1.0 / 4096.0; // not representable in bf16
        let a = Tensor::from_f32(&[v], &[1]);
        let b = a.astype(DType::BF16).unwrap();
        assert_eq!(b.dtype(), DType::BF16);
        assert_ne!(b.get_f32(0).unwrap(), v);
        let back = b.astype(DType::F32).unwrap();
        assert_eq!(back.dtype(), DType::F32);
    }

    #[test]
    fn test_astype_u32() {
        let a = Tensor::from_f32(&[1.7, 2.0, -3.0], &[3]);
        let u = a.astype(DType::U32).unwrap();
        assert_eq!(u.as_u32_slice().unwrap(), &[1, 2, 0]);
        let f = u.astype(DType::F32).unwrap();
        assert_eq!(f.as_f32_slice().unwrap(), &[1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_u32_arithmetic_rejected() {
        let a = Tensor::from_u32(&[1, 2], &[2]);
        let b = Tensor::from_u32(&[3, 4], &[2]);
        assert!(a.add(&b).is_err());
    }

    #[test]
    fn test_operator_overloads() {
        let a = Tensor::from_f32(&[1.0, 2.0], &[2]);
        let b = Tensor::from_f32(&[3.0, 4.0], &[2]);
        let c = &a + &b;
        assert_eq!(c.as_f32_slice().unwrap(), &[4.0, 6.0]);
        let d = &a * &b;
        assert_eq!(d.as_f32_slice().unwrap(), &[3.0, 8.0]);
        let e = -&a;
        assert_eq!(e.as_f32_slice().unwrap(), &[-1.0, -2.0]);
    }
}
