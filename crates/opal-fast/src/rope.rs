//! Rotary position encoding.
//!
//! Rotates the leading `dims` features of the last axis by a
//! position-dependent angle, either over interleaved even/odd pairs
//! (`traditional`) or over the two contiguous halves of the rotated
//! span. The inverse rotation is the same operator with `forward`
//! negated, which is also exactly its VJP — no separate gradient
//! decomposition exists.

use std::any::Any;
use std::sync::Arc;

use opal_core::{to_stream, OpalError, Result, Stream, Tensor};

use crate::policy;
use crate::primitive::{build_fused, Decomposition, FusedPrimitive, OutputSpec};

/// Apply rotary position encoding to `x` (rank ≥ 3; the last two axes
/// are sequence length × feature).
///
/// `dims` features rotate (must be even and at most the feature size);
/// the remainder passes through unchanged. `base`, `scale`, and `offset`
/// parameterize the angular frequency table.
pub fn rope(
    x: &Tensor,
    dims: usize,
    traditional: bool,
    base: f32,
    scale: f32,
    offset: usize,
    stream: Option<Stream>,
) -> Result<Tensor> {
    rope_impl(x, dims, traditional, base, scale, offset, true, stream)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn rope_impl(
    x: &Tensor,
    dims: usize,
    traditional: bool,
    base: f32,
    scale: f32,
    offset: usize,
    forward: bool,
    stream: Option<Stream>,
) -> Result<Tensor> {
    if x.ndim() < 3 {
        return Err(OpalError::invalid(
            "rope",
            format!(
                "input must have at least 3 dimensions but got input with {} dimensions",
                x.ndim()
            ),
        ));
    }
    let feature = x.dim(-1)?;
    if dims % 2 != 0 || dims > feature {
        return Err(OpalError::invalid(
            "rope",
            format!("cannot rotate {dims} of {feature} feature dimensions"),
        ));
    }

    let s = to_stream(stream);
    let prim = Rope {
        dims,
        traditional,
        base,
        scale,
        offset,
        forward,
        stream: s,
    };
    if policy::fast_path_eligible(&s) {
        let outs = build_fused(
            Arc::new(prim),
            vec![x.clone()],
            vec![OutputSpec::new(x.shape().dims(), x.dtype())],
        );
        return Ok(outs.into_iter().next().expect("rope has one output"));
    }
    let mut outs = prim.decomposition().evaluate(&[x.clone()])?;
    Ok(outs.remove(0))
}

#[allow(clippy::too_many_arguments)]
fn rope_decomposition(
    dims: usize,
    traditional: bool,
    base: f32,
    scale: f32,
    offset: usize,
    forward: bool,
) -> Arc<dyn Decomposition> {
    Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
        let shape: Vec<usize> = inputs[0].shape().dims().to_vec();
        let ndim = shape.len();
        let x = inputs[0].reshape(&[
            -1,
            shape[ndim - 2] as isize,
            shape[ndim - 1] as isize,
        ])?;
        let b = x.dim(0)?;
        let l = x.dim(1)?;
        let d = x.dim(2)?;
        let half_dims = dims / 2;

        // Sines and cosines of position * frequency
        let t = x.dtype();
        let positions = Tensor::arange(offset as f32, (offset + l) as f32, 1.0)
            .mul_scalar(scale)?;
        let freqs = Tensor::arange(0.0, half_dims as f32, 1.0)
            .neg()?
            .mul_scalar(base.ln() / half_dims as f32)?
            .exp()?;
        let theta = positions.expand_dims(1)?.mul(&freqs.expand_dims(0)?)?;
        let coss = theta.cos()?.astype(t)?;
        let sins = theta.sin()?.astype(t)?;

        let apply_rope = |x1: &Tensor, x2: &Tensor| -> Result<(Tensor, Tensor)> {
            if forward {
                Ok((
                    x1.mul(&coss)?.sub(&x2.mul(&sins)?)?,
                    x1.mul(&sins)?.add(&x2.mul(&coss)?)?,
                ))
            } else {
                Ok((
                    x2.mul(&sins)?.add(&x1.mul(&coss)?)?,
                    x2.mul(&coss)?.sub(&x1.mul(&sins)?)?,
                ))
            }
        };

        let out = if traditional {
            // Interleaved even/odd pairs via step-2 slices
            let x1 = x.slice(&[0, 0, 0], &[b, l, dims], &[1, 1, 2])?;
            let x2 = x.slice(&[0, 0, 1], &[b, l, dims], &[1, 1, 2])?;
            let (o1, o2) = apply_rope(&x1, &x2)?;
            let o1 = o1.expand_dims(3)?;
            let o2 = o2.expand_dims(3)?;
            let mut out = Tensor::cat(&[&o1, &o2], 3)?;
            if dims < d {
                out = out.reshape(&[b as isize, l as isize, dims as isize])?;
                let tail = x.slice(&[0, 0, dims], &[b, l, d], &[1, 1, 1])?;
                out = Tensor::cat(&[&out, &tail], 2)?;
            }
            out
        } else {
            // Two contiguous halves of the rotated span
            let x1 = x.slice(&[0, 0, 0], &[b, l, half_dims], &[1, 1, 1])?;
            let x2 = x.slice(&[0, 0, half_dims], &[b, l, dims], &[1, 1, 1])?;
            let (o1, o2) = apply_rope(&x1, &x2)?;
            if dims < d {
                let tail = x.slice(&[0, 0, dims], &[b, l, d], &[1, 1, 1])?;
                Tensor::cat(&[&o1, &o2, &tail], 2)?
            } else {
                Tensor::cat(&[&o1, &o2], 2)?
            }
        };

        let target: Vec<isize> = shape.iter().map(|&v| v as isize).collect();
        Ok(vec![out.reshape(&target)?])
    })
}

/// The rotary-encoding fused primitive. Input: `[x]`.
pub struct Rope {
    dims: usize,
    traditional: bool,
    base: f32,
    scale: f32,
    offset: usize,
    forward: bool,
    stream: Stream,
}

impl Rope {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dims: usize,
        traditional: bool,
        base: f32,
        scale: f32,
        offset: usize,
        forward: bool,
        stream: Stream,
    ) -> Self {
        Self {
            dims,
            traditional,
            base,
            scale,
            offset,
            forward,
            stream,
        }
    }
}

impl FusedPrimitive for Rope {
    fn name(&self) -> &'static str {
        "rope"
    }

    fn stream(&self) -> Stream {
        self.stream
    }

    fn decomposition(&self) -> Arc<dyn Decomposition> {
        rope_decomposition(
            self.dims,
            self.traditional,
            self.base,
            self.scale,
            self.offset,
            self.forward,
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    /// The VJP of the forward rotation is exactly the inverse rotation
    /// (and vice versa) applied to the cotangent.
    fn vjp(
        &self,
        _primals: &[Tensor],
        cotangents: &[Tensor],
        _argnums: &[usize],
        _outputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        debug_assert_eq!(cotangents.len(), 1);
        let g = &cotangents[0];
        let prim = Arc::new(Rope {
            dims: self.dims,
            traditional: self.traditional,
            base: self.base,
            scale: self.scale,
            offset: self.offset,
            forward: !self.forward,
            stream: self.stream,
        });
        let outs = build_fused(
            prim,
            vec![g.clone()],
            vec![OutputSpec::new(g.shape().dims(), g.dtype())],
        );
        Ok(outs)
    }

    fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool {
        other.as_any().downcast_ref::<Rope>().is_some_and(|o| {
            self.dims == o.dims
                && self.base == o.base
                && self.scale == o.scale
                && self.traditional == o.traditional
                && self.offset == o.offset
                && self.forward == o.forward
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::Device;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() < tol, "index {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_rope_rank_checked() {
        let x = Tensor::ones(&[4, 8]);
        let err = rope(&x, 8, false, 10000.0, 1.0, 0, None).unwrap_err();
        assert!(format!("{err}").contains("rope"));
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        // At offset 0 the first sequence position has angle 0 everywhere.
        let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 4]);
        for traditional in [false, true] {
            let out = rope(&x, 4, traditional, 10000.0, 1.0, 0, None).unwrap();
            assert_close(
                out.contiguous().unwrap().as_f32_slice().unwrap(),
                &[1.0, 2.0, 3.0, 4.0],
                1e-5,
            );
        }
    }

    #[test]
    fn test_rope_matches_direct_rotation() {
        // Non-traditional split-half rotation against a hand-rolled
        // reference.
        let seq = 3;
        let dim = 4;
        let data: Vec<f32> = (0..seq * dim).map(|i| (i as f32) * 0.37 - 1.0).collect();
        let x = Tensor::from_f32(&data, &[1, seq, dim]);
        let base = 10000.0f32;
        let out = rope(&x, dim, false, base, 1.0, 0, None).unwrap();
        let got = out.contiguous().unwrap();

        let half = dim / 2;
        for p in 0..seq {
            for i in 0..half {
                let freq = (-(i as f32) * base.ln() / half as f32).exp();
                let angle = p as f32 * freq;
                let (sin, cos) = angle.sin_cos();
                let x1 = data[p * dim + i];
                let x2 = data[p * dim + half + i];
                let e1 = x1 * cos - x2 * sin;
                let e2 = x1 * sin + x2 * cos;
                assert!((got.get_f32(p * dim + i).unwrap() - e1).abs() < 1e-4);
                assert!((got.get_f32(p * dim + half + i).unwrap() - e2).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_rope_round_trip() {
        for traditional in [false, true] {
            for dims in [4, 8] {
                let x = Tensor::randn(&[2, 5, 8]);
                let enc = rope_impl(&x, dims, traditional, 10000.0, 2.0, 7, true, None).unwrap();
                let dec = rope_impl(&enc, dims, traditional, 10000.0, 2.0, 7, false, None).unwrap();
                assert_close(
                    dec.contiguous().unwrap().as_f32_slice().unwrap(),
                    x.as_f32_slice().unwrap(),
                    1e-4,
                );
            }
        }
    }

    #[test]
    fn test_rope_partial_rotation_passes_tail_through() {
        let x = Tensor::from_f32(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            &[1, 1, 8],
        );
        for traditional in [false, true] {
            let out = rope(&x, 4, traditional, 10000.0, 1.0, 5, None).unwrap();
            let got = out.contiguous().unwrap();
            // Features beyond dims are unchanged at any position.
            for i in 4..8 {
                assert!(
                    (got.get_f32(i).unwrap() - x.get_f32(i).unwrap()).abs() < 1e-6,
                    "tail feature {i} changed"
                );
            }
        }
    }

    #[test]
    fn test_rope_preserves_pair_norm() {
        // Rotation preserves the L2 norm of each rotated pair.
        let x = Tensor::from_f32(&[3.0, 4.0, 1.0, 2.0], &[1, 1, 4]);
        let out = rope(&x, 4, false, 10000.0, 1.0, 9, None).unwrap();
        let got = out.contiguous().unwrap();
        let norm_before = (3.0f32 * 3.0 + 1.0).sqrt();
        let o0 = got.get_f32(0).unwrap();
        let o2 = got.get_f32(2).unwrap();
        let norm_after = (o0 * o0 + o2 * o2).sqrt();
        assert!((norm_before - norm_after).abs() < 1e-4);
    }

    #[test]
    fn test_rope_vjp_is_inverse_rotation() {
        let x = Tensor::randn(&[1, 4, 8]);
        let g = Tensor::randn(&[1, 4, 8]);
        let prim = Rope::new(8, false, 10000.0, 1.0, 0, true, Stream::new(Device::Cpu));

        let vjps = prim.vjp(&[x], &[g.clone()], &[0], &[]).unwrap();
        let expected = rope_impl(&g, 8, false, 10000.0, 1.0, 0, false, None).unwrap();
        assert_close(
            vjps[0].contiguous().unwrap().as_f32_slice().unwrap(),
            expected.contiguous().unwrap().as_f32_slice().unwrap(),
            1e-5,
        );
    }

    #[test]
    fn test_rope_gpu_stream_defers() {
        let x = Tensor::ones(&[1, 2, 4]);
        let out = rope(&x, 4, false, 10000.0, 1.0, 0, Some(Stream::new(Device::Gpu(0)))).unwrap();
        assert!(out.is_deferred());
        let cpu = rope(&x, 4, false, 10000.0, 1.0, 0, None).unwrap();
        assert_close(
            out.contiguous().unwrap().as_f32_slice().unwrap(),
            cpu.contiguous().unwrap().as_f32_slice().unwrap(),
            1e-6,
        );
    }

    #[test]
    fn test_rope_equivalence_compares_all_scalars() {
        let s = Stream::new(Device::Cpu);
        let a = Rope::new(8, false, 10000.0, 1.0, 0, true, s);
        let b = Rope::new(8, false, 10000.0, 1.0, 0, true, Stream::new(Device::Gpu(0)));
        let c = Rope::new(8, false, 10000.0, 1.0, 1, true, s);
        let d = Rope::new(8, false, 10000.0, 1.0, 0, false, s);
        assert!(a.is_equivalent(&b));
        assert!(!a.is_equivalent(&c));
        assert!(!a.is_equivalent(&d));
    }
}
