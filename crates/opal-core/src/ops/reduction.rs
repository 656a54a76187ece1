//! Reduction operations: sum and mean, whole-tensor and per-axis.

use rayon::prelude::*;

use crate::autograd;
use crate::error::OpalError;
use crate::ops::record;
use crate::tensor::Tensor;
use crate::Result;

const PAR_THRESHOLD: usize = 8192;

impl Tensor {
    /// Sum all elements, returning a scalar tensor.
    pub fn sum(&self) -> Result<Tensor> {
        if !self.dtype().is_float() {
            return Err(OpalError::UnsupportedDType(self.dtype()));
        }
        let data = self.contiguous()?;
        let slice = data
            .as_f32_slice()
            .ok_or_else(|| OpalError::StorageError("sum: missing f32 buffer".into()))?;
        let total: f32 = if slice.len() >= PAR_THRESHOLD {
            slice.par_iter().sum()
        } else {
            slice.iter().sum()
        };
        let result = Tensor::scalar_with_dtype(total, self.dtype());
        Ok(record(
            result,
            &[self],
            Box::new(autograd::SumAllBackward {
                input_dims: self.shape().dims().to_vec(),
            }),
        ))
    }

    /// Mean of all elements, returning a scalar tensor.
    pub fn mean(&self) -> Result<Tensor> {
        if !self.dtype().is_float() {
            return Err(OpalError::UnsupportedDType(self.dtype()));
        }
        let data = self.contiguous()?;
        let slice = data
            .as_f32_slice()
            .ok_or_else(|| OpalError::StorageError("mean: missing f32 buffer".into()))?;
        let total: f32 = slice.iter().sum();
        let result = Tensor::scalar_with_dtype(total / self.numel() as f32, self.dtype());
        Ok(record(
            result,
            &[self],
            Box::new(autograd::MeanAllBackward {
                input_dims: self.shape().dims().to_vec(),
            }),
        ))
    }

    /// Sum along one axis (negative axes count from the back).
    pub fn sum_axis(&self, axis: isize, keepdims: bool) -> Result<Tensor> {
        let ax = self.shape().normalize_axis(axis)?;
        let out = reduce_axis(self, ax, keepdims, "sum_axis", |acc, v| acc + v, |acc, _| acc)?;
        Ok(record(
            out,
            &[self],
            Box::new(autograd::SumAxisBackward {
                input_dims: self.shape().dims().to_vec(),
                axis: ax,
                keepdims,
            }),
        ))
    }

    /// Mean along one axis (negative axes count from the back).
    pub fn mean_axis(&self, axis: isize, keepdims: bool) -> Result<Tensor> {
        let ax = self.shape().normalize_axis(axis)?;
        let out = reduce_axis(
            self,
            ax,
            keepdims,
            "mean_axis",
            |acc, v| acc + v,
            |acc, n| acc / n as f32,
        )?;
        Ok(record(
            out,
            &[self],
            Box::new(autograd::MeanAxisBackward {
                input_dims: self.shape().dims().to_vec(),
                axis: ax,
                keepdims,
            }),
        ))
    }

    /// Sum over a set of axes at once.
    pub fn sum_axes(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        let mut resolved: Vec<usize> = axes
            .iter()
            .map(|&a| self.shape().normalize_axis(a))
            .collect::<Result<_>>()?;
        resolved.sort_unstable();
        resolved.dedup();

        // Reduce one axis at a time with keepdims, then drop the kept
        // axes at the end if requested.
        let mut out = self.clone();
        {
            let _guard = autograd::NoGradGuard::new();
            for &ax in &resolved {
                out = reduce_axis(&out, ax, true, "sum_axes", |acc, v| acc + v, |acc, _| acc)?;
            }
            if !keepdims {
                let target: Vec<isize> = self
                    .shape()
                    .dims()
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !resolved.contains(i))
                    .map(|(_, &d)| d as isize)
                    .collect();
                out = out.reshape(&target)?;
            }
        }
        Ok(record(
            out,
            &[self],
            Box::new(autograd::SumAxesBackward {
                input_dims: self.shape().dims().to_vec(),
                axes: resolved,
                keepdims,
            }),
        ))
    }
}

fn reduce_axis(
    t: &Tensor,
    axis: usize,
    keepdims: bool,
    op_name: &'static str,
    fold: impl Fn(f32, f32) -> f32,
    finish: impl Fn(f32, usize) -> f32,
) -> Result<Tensor> {
    if !t.dtype().is_float() {
        return Err(OpalError::UnsupportedDType(t.dtype()));
    }
    let data = t.contiguous()?;
    let dims = data.shape().dims().to_vec();
    let slice = data
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError(format!("{op_name}: missing f32 buffer")))?;

    let axis_size = dims[axis];
    let outer_size: usize = dims[..axis].iter().product();
    let inner_size: usize = dims[axis + 1..].iter().product();

    let mut result = vec![0.0f32; outer_size * inner_size];
    for outer in 0..outer_size {
        for inner in 0..inner_size {
            let mut acc = 0.0f32;
            for k in 0..axis_size {
                let idx = outer * axis_size * inner_size + k * inner_size + inner;
                acc = fold(acc, slice[idx]);
            }
            result[outer * inner_size + inner] = finish(acc, axis_size);
        }
    }

    let out_shape = data.shape().reduced(axis, keepdims);
    Ok(Tensor::from_f32_with_dtype(
        result,
        out_shape.dims(),
        t.dtype(),
    ))
}

#[cfg(test)]
mod tests {
    use crate::Tensor;

    #[test]
    fn test_sum() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[4]);
        let s = t.sum().unwrap();
        assert_eq!(s.get_f32(0).unwrap(), 10.0);
    }

    #[test]
    fn test_mean() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[4]);
        let m = t.mean().unwrap();
        assert!((m.get_f32(0).unwrap() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_sum_axis() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);

        let s0 = t.sum_axis(0, false).unwrap();
        assert_eq!(s0.shape().dims(), &[3]);
        assert_eq!(s0.as_f32_slice().unwrap(), &[5.0, 7.0, 9.0]);

        let s1 = t.sum_axis(1, false).unwrap();
        assert_eq!(s1.shape().dims(), &[2]);
        assert_eq!(s1.as_f32_slice().unwrap(), &[6.0, 15.0]);
    }

    #[test]
    fn test_sum_axis_keepdims() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s = t.sum_axis(-1, true).unwrap();
        assert_eq!(s.shape().dims(), &[2, 1]);
        assert_eq!(s.as_f32_slice().unwrap(), &[6.0, 15.0]);
    }

    #[test]
    fn test_mean_axis() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let m = t.mean_axis(-1, true).unwrap();
        assert_eq!(m.shape().dims(), &[2, 1]);
        let data = m.as_f32_slice().unwrap();
        assert!((data[0] - 2.0).abs() < 1e-6);
        assert!((data[1] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_sum_axes() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[2, 2, 2]);
        let s = t.sum_axes(&[0, 1], false).unwrap();
        assert_eq!(s.shape().dims(), &[2]);
        assert_eq!(s.as_f32_slice().unwrap(), &[16.0, 20.0]);
    }

    #[test]
    fn test_sum_axes_keepdims() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let s = t.sum_axes(&[0], true).unwrap();
        assert_eq!(s.shape().dims(), &[1, 2]);
        assert_eq!(s.as_f32_slice().unwrap(), &[4.0, 6.0]);
    }

    #[test]
    fn test_invalid_axis() {
        let t = Tensor::from_f32(&[1.0, 2.0], &[2]);
        assert!(t.sum_axis(1, false).is_err());
        assert!(t.sum_axis(-2, false).is_err());
    }
}
