//! Shape manipulation: reshape, expand_dims, swapaxes, strided slice,
//! cat, stack, softmax.
//!
//! View-producing ops share storage where possible and record their own
//! gradient nodes, so decompositions built from them stay differentiable
//! end to end.

use smallvec::SmallVec;

use crate::autograd::GradFn;
use crate::dtype::DType;
use crate::error::OpalError;
use crate::ops::record;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Reshape the tensor. Zero-copy when contiguous; materializes a
    /// contiguous copy first otherwise. At most one target dimension may
    /// be -1 (inferred).
    pub fn reshape(&self, target: &[isize]) -> Result<Tensor> {
        let resolved =
            self.shape()
                .resolve_reshape(target)
                .ok_or_else(|| OpalError::InvalidReshape {
                    numel: self.numel(),
                    shape: target.to_vec(),
                })?;

        let base = if self.is_contiguous() {
            self.clone()
        } else {
            self.contiguous()?
        };
        let strides = resolved.contiguous_strides();
        let out_dims = resolved.dims().to_vec();
        let out = base.view(resolved, strides, 0);
        Ok(record(
            out,
            &[self],
            Box::new(ReshapeBackward {
                input_dims: self.shape().dims().to_vec(),
                out_dims,
            }),
        ))
    }

    /// Insert a size-1 axis at `axis` (which may be negative, counting
    /// into the expanded rank).
    pub fn expand_dims(&self, axis: isize) -> Result<Tensor> {
        let ndim = self.ndim() as isize;
        let resolved = if axis < 0 { ndim + 1 + axis } else { axis };
        if resolved < 0 || resolved > ndim {
            return Err(OpalError::InvalidAxis {
                axis,
                ndim: self.ndim(),
            });
        }
        let mut target: Vec<isize> = self.shape().dims().iter().map(|&d| d as isize).collect();
        target.insert(resolved as usize, 1);
        self.reshape(&target)
    }

    /// Swap two axes (zero-copy view).
    pub fn swapaxes(&self, a: isize, b: isize) -> Result<Tensor> {
        let a = self.shape().normalize_axis(a)?;
        let b = self.shape().normalize_axis(b)?;
        let mut dims: SmallVec<[usize; 4]> = SmallVec::from_slice(self.shape().dims());
        let mut strides: SmallVec<[usize; 4]> = SmallVec::from_slice(self.strides());
        dims.swap(a, b);
        strides.swap(a, b);
        let offset = self.storage_offset();
        let out = self.view(Shape::new(&dims), strides, offset);
        Ok(record(
            out,
            &[self],
            Box::new(SwapAxesBackward { a, b }),
        ))
    }

    /// Strided slice: per-axis `starts`, `stops` (exclusive), `steps`
    /// (≥ 1). Zero-copy view.
    pub fn slice(&self, starts: &[usize], stops: &[usize], steps: &[usize]) -> Result<Tensor> {
        let ndim = self.ndim();
        if starts.len() != ndim || stops.len() != ndim || steps.len() != ndim {
            return Err(OpalError::StorageError(format!(
                "slice: expected {ndim} per-axis bounds, got {}/{}/{}",
                starts.len(),
                stops.len(),
                steps.len()
            )));
        }
        let dims = self.shape().dims();
        let mut out_dims: SmallVec<[usize; 4]> = SmallVec::with_capacity(ndim);
        let mut out_strides: SmallVec<[usize; 4]> = SmallVec::with_capacity(ndim);
        let mut offset = self.storage_offset();
        for i in 0..ndim {
            if steps[i] == 0 {
                return Err(OpalError::StorageError("slice: step must be >= 1".into()));
            }
            if stops[i] > dims[i] || starts[i] > stops[i] {
                return Err(OpalError::StorageError(format!(
                    "slice: bounds {}..{} out of range for axis {i} with size {}",
                    starts[i], stops[i], dims[i]
                )));
            }
            out_dims.push((stops[i] - starts[i]).div_ceil(steps[i]));
            out_strides.push(self.strides()[i] * steps[i]);
            offset += starts[i] * self.strides()[i];
        }
        let out = self.view(Shape::new(&out_dims), out_strides, offset);
        Ok(record(
            out,
            &[self],
            Box::new(SliceBackward {
                input_dims: dims.to_vec(),
                starts: starts.to_vec(),
                stops: stops.to_vec(),
                steps: steps.to_vec(),
            }),
        ))
    }

    /// Concatenate tensors along a given axis.
    ///
    /// All tensors must have the same shape except along `axis`.
    pub fn cat(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        if tensors.is_empty() {
            return Err(OpalError::StorageError("cat: empty tensor list".into()));
        }
        let first = tensors[0];
        let ndim = first.ndim();
        if ndim == 0 {
            return Err(OpalError::StorageError(
                "cat: cannot concatenate scalars".into(),
            ));
        }
        let axis = first.shape().normalize_axis(axis)?;

        let mut out_dtype = first.dtype();
        for t in &tensors[1..] {
            if t.ndim() != ndim {
                return Err(OpalError::ShapeMismatch {
                    expected: first.shape().dims().to_vec(),
                    got: t.shape().dims().to_vec(),
                });
            }
            for d in 0..ndim {
                if d != axis && t.shape().dims()[d] != first.shape().dims()[d] {
                    return Err(OpalError::ShapeMismatch {
                        expected: first.shape().dims().to_vec(),
                        got: t.shape().dims().to_vec(),
                    });
                }
            }
            out_dtype = out_dtype.promote(t.dtype());
        }
        if !out_dtype.is_float() {
            return Err(OpalError::UnsupportedDType(out_dtype));
        }

        let mut out_shape: Vec<usize> = first.shape().dims().to_vec();
        let cat_dim: usize = tensors.iter().map(|t| t.shape().dims()[axis]).sum();
        out_shape[axis] = cat_dim;

        let numel: usize = out_shape.iter().product();
        let mut result = vec![0.0f32; numel];

        let outer: usize = out_shape[..axis].iter().product();
        let inner: usize = out_shape[axis + 1..].iter().product();

        let mut cat_offset = 0;
        for t in tensors {
            let t_cont = t.contiguous()?;
            let t_data = t_cont
                .as_f32_slice()
                .ok_or(OpalError::UnsupportedDType(t.dtype()))?;
            let t_axis_size = t.shape().dims()[axis];

            for o in 0..outer {
                for a in 0..t_axis_size {
                    let src_start = (o * t_axis_size + a) * inner;
                    let dst_start = (o * cat_dim + (cat_offset + a)) * inner;
                    result[dst_start..dst_start + inner]
                        .copy_from_slice(&t_data[src_start..src_start + inner]);
                }
            }
            cat_offset += t_axis_size;
        }

        let out = Tensor::from_f32_with_dtype(result, &out_shape, out_dtype);
        let operands: Vec<&Tensor> = tensors.to_vec();
        Ok(record(
            out,
            &operands,
            Box::new(CatBackward {
                axis,
                piece_dims: tensors.iter().map(|t| t.shape().dims().to_vec()).collect(),
            }),
        ))
    }

    /// Stack tensors along a new axis.
    pub fn stack(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
        if tensors.is_empty() {
            return Err(OpalError::StorageError("stack: empty tensor list".into()));
        }
        let first = tensors[0];
        for t in &tensors[1..] {
            if t.shape().dims() != first.shape().dims() {
                return Err(OpalError::ShapeMismatch {
                    expected: first.shape().dims().to_vec(),
                    got: t.shape().dims().to_vec(),
                });
            }
        }
        let ndim = first.ndim() as isize;
        let resolved = if axis < 0 { ndim + 1 + axis } else { axis };
        if resolved < 0 || resolved > ndim {
            return Err(OpalError::InvalidAxis {
                axis,
                ndim: first.ndim(),
            });
        }

        let unsqueezed: Vec<Tensor> = tensors
            .iter()
            .map(|t| t.expand_dims(resolved))
            .collect::<Result<_>>()?;
        let refs: Vec<&Tensor> = unsqueezed.iter().collect();
        Tensor::cat(&refs, resolved)
    }

    /// Softmax along an axis, computed in f32 with max subtraction for
    /// numerical stability. The result keeps the input dtype.
    pub fn softmax(&self, axis: isize) -> Result<Tensor> {
        if !self.dtype().is_float() {
            return Err(OpalError::UnsupportedDType(self.dtype()));
        }
        let ax = self.shape().normalize_axis(axis)?;

        let data = self.contiguous()?;
        let src = data
            .as_f32_slice()
            .ok_or_else(|| OpalError::StorageError("softmax: missing f32 buffer".into()))?;
        let mut result = src.to_vec();

        let dims = data.shape().dims();
        let outer: usize = dims[..ax].iter().product();
        let axis_size = dims[ax];
        let inner: usize = dims[ax + 1..].iter().product();

        for o in 0..outer {
            for i in 0..inner {
                let mut max_val = f32::NEG_INFINITY;
                for a in 0..axis_size {
                    let idx = (o * axis_size + a) * inner + i;
                    if result[idx] > max_val {
                        max_val = result[idx];
                    }
                }

                let mut sum = 0.0f32;
                for a in 0..axis_size {
                    let idx = (o * axis_size + a) * inner + i;
                    result[idx] = (result[idx] - max_val).exp();
                    sum += result[idx];
                }

                if sum > 0.0 {
                    let inv_sum = 1.0 / sum;
                    for a in 0..axis_size {
                        let idx = (o * axis_size + a) * inner + i;
                        result[idx] *= inv_sum;
                    }
                }
            }
        }

        let out = Tensor::from_f32_with_dtype(result, dims, self.dtype());
        Ok(record(
            out.clone(),
            &[self],
            Box::new(SoftmaxBackward {
                output: out,
                axis: ax,
            }),
        ))
    }

    fn storage_offset(&self) -> usize {
        self.view_offset()
    }
}

// ============================================================================
// Backward functions for shape ops
// ============================================================================

struct ReshapeBackward {
    input_dims: Vec<usize>,
    out_dims: Vec<usize>,
}

impl GradFn for ReshapeBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let target: Vec<isize> = self.input_dims.iter().map(|&d| d as isize).collect();
        vec![Some(
            grad_output
                .reshape(&target)
                .expect("ReshapeBackward reshape failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            let target: Vec<isize> = self.out_dims.iter().map(|&d| d as isize).collect();
            t.reshape(&target).expect("ReshapeBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "ReshapeBackward"
    }
}

struct SwapAxesBackward {
    a: usize,
    b: usize,
}

impl GradFn for SwapAxesBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        vec![Some(
            grad_output
                .swapaxes(self.a as isize, self.b as isize)
                .expect("SwapAxesBackward swap failed"),
        )]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            t.swapaxes(self.a as isize, self.b as isize)
                .expect("SwapAxesBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "SwapAxesBackward"
    }
}

struct SliceBackward {
    input_dims: Vec<usize>,
    starts: Vec<usize>,
    stops: Vec<usize>,
    steps: Vec<usize>,
}

impl GradFn for SliceBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let g = grad_output
            .contiguous()
            .expect("SliceBackward contiguous failed");
        let g_data = g.as_f32_slice().expect("SliceBackward missing f32 buffer");
        let ndim = self.input_dims.len();

        let in_shape = Shape::new(&self.input_dims);
        let in_strides = in_shape.contiguous_strides();
        let g_strides = g.shape().contiguous_strides();

        let mut out = vec![0.0f32; in_shape.numel()];
        for (flat, &val) in g_data.iter().enumerate() {
            let mut remaining = flat;
            let mut in_idx = 0usize;
            for d in 0..ndim {
                let coord = remaining / g_strides[d];
                remaining %= g_strides[d];
                in_idx += (self.starts[d] + coord * self.steps[d]) * in_strides[d];
            }
            out[in_idx] += val;
        }

        vec![Some(Tensor::from_f32_with_dtype(
            out,
            &self.input_dims,
            grad_output.dtype(),
        ))]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            t.slice(&self.starts, &self.stops, &self.steps)
                .expect("SliceBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "SliceBackward"
    }
}

struct CatBackward {
    axis: usize,
    piece_dims: Vec<Vec<usize>>,
}

impl GradFn for CatBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let ndim = grad_output.ndim();
        let g_dims = grad_output.shape().dims().to_vec();
        let mut grads = Vec::with_capacity(self.piece_dims.len());
        let mut offset = 0usize;
        for piece in &self.piece_dims {
            let size = piece[self.axis];
            let mut starts = vec![0usize; ndim];
            let mut stops = g_dims.clone();
            let steps = vec![1usize; ndim];
            starts[self.axis] = offset;
            stops[self.axis] = offset + size;
            let piece_grad = grad_output
                .slice(&starts, &stops, &steps)
                .and_then(|s| s.contiguous())
                .expect("CatBackward slice failed");
            grads.push(Some(piece_grad));
            offset += size;
        }
        grads
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        if tangents.iter().all(|t| t.is_none()) {
            return None;
        }
        let pieces: Vec<Tensor> = tangents
            .iter()
            .zip(self.piece_dims.iter())
            .map(|(t, dims)| match t {
                Some(t) => t.clone(),
                None => Tensor::zeros(dims, DType::F32),
            })
            .collect();
        let refs: Vec<&Tensor> = pieces.iter().collect();
        Some(Tensor::cat(&refs, self.axis as isize).expect("CatBackward tangent failed"))
    }

    fn name(&self) -> &str {
        "CatBackward"
    }
}

struct SoftmaxBackward {
    output: Tensor,
    axis: usize,
}

impl GradFn for SoftmaxBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        // dx = y * (dy - sum(y * dy))
        let yg = self
            .output
            .mul(grad_output)
            .expect("SoftmaxBackward mul failed");
        let dot = yg
            .sum_axis(self.axis as isize, true)
            .expect("SoftmaxBackward sum failed");
        let dx = self
            .output
            .mul(&grad_output.sub(&dot).expect("SoftmaxBackward sub failed"))
            .expect("SoftmaxBackward mul failed");
        vec![Some(dx)]
    }

    fn tangent(&self, tangents: &[Option<Tensor>]) -> Option<Tensor> {
        tangents[0].as_ref().map(|t| {
            let yt = self.output.mul(t).expect("SoftmaxBackward tangent failed");
            let dot = yt
                .sum_axis(self.axis as isize, true)
                .expect("SoftmaxBackward tangent failed");
            self.output
                .mul(&t.sub(&dot).expect("SoftmaxBackward tangent failed"))
                .expect("SoftmaxBackward tangent failed")
        })
    }

    fn name(&self) -> &str {
        "SoftmaxBackward"
    }
}

#[cfg(test)]
mod tests {
    use crate::Tensor;

    #[test]
    fn test_reshape() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let r = t.reshape(&[3, 2]).unwrap();
        assert_eq!(r.shape().dims(), &[3, 2]);
        assert_eq!(r.as_f32_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let r = t.reshape(&[-1, 2]).unwrap();
        assert_eq!(r.shape().dims(), &[3, 2]);

        assert!(t.reshape(&[4, 2]).is_err());
    }

    #[test]
    fn test_expand_dims() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        let e = t.expand_dims(0).unwrap();
        assert_eq!(e.shape().dims(), &[1, 3]);
        let e = t.expand_dims(-1).unwrap();
        assert_eq!(e.shape().dims(), &[3, 1]);
        let e = t.expand_dims(1).unwrap();
        assert_eq!(e.shape().dims(), &[3, 1]);
    }

    #[test]
    fn test_swapaxes() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s = t.swapaxes(-1, -2).unwrap();
        assert_eq!(s.shape().dims(), &[3, 2]);
        assert!(!s.is_contiguous());
        let c = s.contiguous().unwrap();
        assert_eq!(c.as_f32_slice().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_slice_basic() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s = t.slice(&[0, 1], &[2, 3], &[1, 1]).unwrap();
        assert_eq!(s.shape().dims(), &[2, 2]);
        let c = s.contiguous().unwrap();
        assert_eq!(c.as_f32_slice().unwrap(), &[2.0, 3.0, 5.0, 6.0]);
    }

    #[test]
    fn test_slice_strided() {
        // Every other element along the last axis: the interleaved-pair
        // access pattern rotary encoding uses.
        let t = Tensor::from_f32(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[1, 6]);
        let even = t.slice(&[0, 0], &[1, 6], &[1, 2]).unwrap();
        let odd = t.slice(&[0, 1], &[1, 6], &[1, 2]).unwrap();
        assert_eq!(
            even.contiguous().unwrap().as_f32_slice().unwrap(),
            &[0.0, 2.0, 4.0]
        );
        assert_eq!(
            odd.contiguous().unwrap().as_f32_slice().unwrap(),
            &[1.0, 3.0, 5.0]
        );
    }

    #[test]
    fn test_slice_bounds_checked() {
        let t = Tensor::from_f32(&[1.0, 2.0], &[2]);
        assert!(t.slice(&[0], &[3], &[1]).is_err());
        assert!(t.slice(&[0], &[2], &[0]).is_err());
    }

    #[test]
    fn test_cat_axis0() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Tensor::from_f32(&[5.0, 6.0], &[1, 2]);
        let c = Tensor::cat(&[&a, &b], 0).unwrap();
        assert_eq!(c.shape().dims(), &[3, 2]);
        assert_eq!(c.as_f32_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_cat_axis1() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = Tensor::from_f32(&[5.0, 6.0, 7.0, 8.0, 9.0, 10.0], &[2, 3]);
        let c = Tensor::cat(&[&a, &b], -1).unwrap();
        assert_eq!(c.shape().dims(), &[2, 5]);
        assert_eq!(
            c.as_f32_slice().unwrap(),
            &[1.0, 2.0, 5.0, 6.0, 7.0, 3.0, 4.0, 8.0, 9.0, 10.0]
        );
    }

    #[test]
    fn test_stack() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0], &[3]);
        let b = Tensor::from_f32(&[4.0, 5.0, 6.0], &[3]);
        let c = Tensor::stack(&[&a, &b], 0).unwrap();
        assert_eq!(c.shape().dims(), &[2, 3]);
        assert_eq!(c.as_f32_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_softmax() {
        let a = Tensor::from_f32(&[1.0, 2.0, 3.0, 1.0, 2.0, 3.0], &[2, 3]);
        let s = a.softmax(-1).unwrap();
        let data = s.as_f32_slice().unwrap();
        let row0_sum: f32 = data[0..3].iter().sum();
        let row1_sum: f32 = data[3..6].iter().sum();
        assert!((row0_sum - 1.0).abs() < 1e-5);
        assert!((row1_sum - 1.0).abs() < 1e-5);
        assert!(data[2] > data[1] && data[1] > data[0]);
    }

    #[test]
    fn test_softmax_numerical_stability() {
        let a = Tensor::from_f32(&[1000.0, 1001.0, 1002.0], &[1, 3]);
        let s = a.softmax(-1).unwrap();
        let data = s.as_f32_slice().unwrap();
        assert!(data.iter().all(|v| v.is_finite()));
        let sum: f32 = data.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
