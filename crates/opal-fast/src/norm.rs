//! RMSNorm and LayerNorm fused operators.
//!
//! Both normalize the last axis, promoting to f32 for the reduction and
//! casting back to the promoted result type. Each carries a paired
//! analytic gradient primitive — the closed-form chain rule is cheaper
//! than differentiating the decomposition — while batching and
//! forward-mode still route through the generic transforms.

use std::any::Any;
use std::sync::Arc;

use opal_core::{to_stream, DType, OpalError, Result, Stream, Tensor};

use crate::policy;
use crate::primitive::{build_fused, Decomposition, FusedPrimitive, OutputSpec};

/// Root-mean-square normalization over the last axis:
/// `x * rsqrt(mean(x^2) + eps) * weight`.
///
/// `weight` must be rank 1; the promoted result type must be floating.
pub fn rms_norm(x: &Tensor, weight: &Tensor, eps: f32, stream: Option<Stream>) -> Result<Tensor> {
    if x.ndim() == 0 {
        return Err(OpalError::invalid(
            "rms_norm",
            "input must have at least 1 dimension but got input with 0 dimensions",
        ));
    }
    if weight.ndim() != 1 {
        return Err(OpalError::invalid(
            "rms_norm",
            format!(
                "weight must have 1 dimension but has {} dimensions",
                weight.ndim()
            ),
        ));
    }
    let out_type = x.dtype().promote(weight.dtype());
    if !out_type.is_float() {
        return Err(OpalError::invalid(
            "rms_norm",
            format!("received unsupported type {out_type}"),
        ));
    }

    let s = to_stream(stream);
    if policy::fast_path_eligible(&s) {
        let prim = Arc::new(RmsNorm::new(eps, out_type, s));
        let inputs = vec![x.astype(out_type)?, weight.astype(out_type)?];
        let outs = build_fused(
            prim,
            inputs,
            vec![OutputSpec::new(x.shape().dims(), out_type)],
        );
        return Ok(outs.into_iter().next().expect("rms_norm has one output"));
    }
    let mut outs = rms_norm_decomposition(eps, out_type).evaluate(&[x.clone(), weight.clone()])?;
    Ok(outs.remove(0))
}

fn rms_norm_decomposition(eps: f32, out_type: DType) -> Arc<dyn Decomposition> {
    Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
        let x = inputs[0].astype(DType::F32)?;
        let n = x
            .square()?
            .mean_axis(-1, true)?
            .add_scalar(eps)?
            .rsqrt()?;
        let y = x.mul(&n)?.astype(out_type)?;
        Ok(vec![inputs[1].mul(&y)?])
    })
}

/// The RMSNorm fused primitive. Inputs: `[x, weight]`.
pub struct RmsNorm {
    eps: f32,
    out_type: DType,
    stream: Stream,
}

impl RmsNorm {
    pub fn new(eps: f32, out_type: DType, stream: Stream) -> Self {
        Self {
            eps,
            out_type,
            stream,
        }
    }
}

impl FusedPrimitive for RmsNorm {
    fn name(&self) -> &'static str {
        "rms_norm"
    }

    fn stream(&self) -> Stream {
        self.stream
    }

    fn decomposition(&self) -> Arc<dyn Decomposition> {
        rms_norm_decomposition(self.eps, self.out_type)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn vjp(
        &self,
        primals: &[Tensor],
        cotangents: &[Tensor],
        argnums: &[usize],
        _outputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        debug_assert_eq!(primals.len(), 2);
        debug_assert_eq!(cotangents.len(), 1);

        let prim = Arc::new(RmsNormVjp::new(self.eps, self.stream));
        let specs = vec![
            OutputSpec::new(primals[0].shape().dims(), primals[0].dtype()),
            OutputSpec::new(primals[1].shape().dims(), primals[1].dtype()),
        ];
        let inputs = vec![
            primals[0].clone(),
            primals[1].clone(),
            cotangents[0].clone(),
        ];
        let vjps = build_fused(prim, inputs, specs);

        select_argnums(vjps, argnums, "rms_norm")
    }

    fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool {
        other
            .as_any()
            .downcast_ref::<RmsNorm>()
            .is_some_and(|o| self.eps == o.eps)
    }
}

fn rms_norm_vjp_decomposition(eps: f32) -> Arc<dyn Decomposition> {
    Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
        let x = &inputs[0];
        let w = &inputs[1];
        let g = &inputs[2];

        let n = x
            .square()?
            .mean_axis(-1, true)?
            .add_scalar(eps)?
            .rsqrt()?;
        let n3 = n.pow_scalar(3.0)?;

        // df/dx
        let gw = g.mul(w)?;
        let t = gw.mul(x)?.mean_axis(-1, true)?;
        let t = x.mul(&t)?.mul(&n3)?;
        let dx = gw.mul(&n)?.sub(&t)?;

        // df/dw
        let axes: Vec<isize> = (0..g.ndim() as isize - 1).collect();
        let dw = g.mul(&x.mul(&n)?)?.sum_axes(&axes, false)?;

        Ok(vec![dx, dw])
    })
}

/// The paired analytic gradient primitive for RMSNorm.
/// Inputs: `[x, weight, cotangent]`; outputs: `[dx, dweight]`.
pub struct RmsNormVjp {
    eps: f32,
    stream: Stream,
}

impl RmsNormVjp {
    pub fn new(eps: f32, stream: Stream) -> Self {
        Self { eps, stream }
    }
}

impl FusedPrimitive for RmsNormVjp {
    fn name(&self) -> &'static str {
        "rms_norm_vjp"
    }

    fn stream(&self) -> Stream {
        self.stream
    }

    fn decomposition(&self) -> Arc<dyn Decomposition> {
        rms_norm_vjp_decomposition(self.eps)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool {
        other
            .as_any()
            .downcast_ref::<RmsNormVjp>()
            .is_some_and(|o| self.eps == o.eps)
    }
}

/// Layer normalization over the last axis, with optional affine scale
/// and shift:
/// `(x - mean(x)) * rsqrt(var(x) + eps) * weight + bias`.
///
/// When `weight`/`bias` are absent a scalar identity (1 / 0) is
/// substituted so the same three-input decomposition shape applies
/// uniformly.
pub fn layer_norm(
    x: &Tensor,
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    eps: f32,
    stream: Option<Stream>,
) -> Result<Tensor> {
    if x.ndim() == 0 {
        return Err(OpalError::invalid(
            "layer_norm",
            "input must have at least 1 dimension but got input with 0 dimensions",
        ));
    }
    if let Some(w) = weight {
        if w.ndim() != 1 {
            return Err(OpalError::invalid(
                "layer_norm",
                format!("weight must have 1 dimension but has {} dimensions", w.ndim()),
            ));
        }
    }
    if let Some(b) = bias {
        if b.ndim() != 1 {
            return Err(OpalError::invalid(
                "layer_norm",
                format!("bias must have 1 dimension but has {} dimensions", b.ndim()),
            ));
        }
    }

    let mut out_type = x.dtype();
    if let Some(w) = weight {
        out_type = out_type.promote(w.dtype());
    }
    if let Some(b) = bias {
        out_type = out_type.promote(b.dtype());
    }
    if !out_type.is_float() {
        return Err(OpalError::invalid(
            "layer_norm",
            format!("received unsupported type {out_type}"),
        ));
    }

    let has_weight = weight.is_some();
    let has_bias = bias.is_some();
    let passed_weight = match weight {
        Some(w) => w.astype(out_type)?,
        None => Tensor::scalar_with_dtype(1.0, out_type),
    };
    let passed_bias = match bias {
        Some(b) => b.astype(out_type)?,
        None => Tensor::scalar_with_dtype(0.0, out_type),
    };

    let s = to_stream(stream);
    if policy::fast_path_eligible(&s) {
        let prim = Arc::new(LayerNorm::new(eps, out_type, has_weight, has_bias, s));
        let inputs = vec![x.astype(out_type)?, passed_weight, passed_bias];
        let outs = build_fused(
            prim,
            inputs,
            vec![OutputSpec::new(x.shape().dims(), out_type)],
        );
        return Ok(outs.into_iter().next().expect("layer_norm has one output"));
    }
    let mut outs = layer_norm_decomposition(eps, out_type, has_weight, has_bias).evaluate(&[
        x.clone(),
        passed_weight,
        passed_bias,
    ])?;
    Ok(outs.remove(0))
}

fn layer_norm_decomposition(
    eps: f32,
    out_type: DType,
    has_weight: bool,
    has_bias: bool,
) -> Arc<dyn Decomposition> {
    Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
        let x = inputs[0].astype(DType::F32)?;

        // var = mean(x^2) - mean(x)^2
        let mu = x.mean_axis(-1, true)?;
        let mu2 = mu.square()?;
        let x2 = x.square()?.mean_axis(-1, true)?;
        let v = x2.sub(&mu2)?;

        let y = x.sub(&mu)?.mul(&v.add_scalar(eps)?.rsqrt()?)?;
        let mut y = y.astype(out_type)?;

        if has_weight {
            y = y.mul(&inputs[1])?;
        }
        if has_bias {
            y = y.add(&inputs[2])?;
        }
        Ok(vec![y])
    })
}

/// The LayerNorm fused primitive. Inputs: `[x, weight, bias]` (weight
/// and bias may be rank-0 identity placeholders).
pub struct LayerNorm {
    eps: f32,
    out_type: DType,
    has_weight: bool,
    has_bias: bool,
    stream: Stream,
}

impl LayerNorm {
    pub fn new(eps: f32, out_type: DType, has_weight: bool, has_bias: bool, stream: Stream) -> Self {
        Self {
            eps,
            out_type,
            has_weight,
            has_bias,
            stream,
        }
    }
}

impl FusedPrimitive for LayerNorm {
    fn name(&self) -> &'static str {
        "layer_norm"
    }

    fn stream(&self) -> Stream {
        self.stream
    }

    fn decomposition(&self) -> Arc<dyn Decomposition> {
        layer_norm_decomposition(self.eps, self.out_type, self.has_weight, self.has_bias)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn vjp(
        &self,
        primals: &[Tensor],
        cotangents: &[Tensor],
        argnums: &[usize],
        _outputs: &[Tensor],
    ) -> Result<Vec<Tensor>> {
        debug_assert_eq!(primals.len(), 3);
        debug_assert_eq!(cotangents.len(), 1);

        let prim = Arc::new(LayerNormVjp::new(self.eps, self.stream));
        let specs = primals
            .iter()
            .map(|p| OutputSpec::new(p.shape().dims(), p.dtype()))
            .collect();
        let inputs = vec![
            primals[0].clone(),
            primals[1].clone(),
            primals[2].clone(),
            cotangents[0].clone(),
        ];
        let vjps = build_fused(prim, inputs, specs);

        select_argnums(vjps, argnums, "layer_norm")
    }

    fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool {
        other
            .as_any()
            .downcast_ref::<LayerNorm>()
            .is_some_and(|o| self.eps == o.eps)
    }
}

fn layer_norm_vjp_decomposition(eps: f32) -> Arc<dyn Decomposition> {
    Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
        let x = &inputs[0];
        let w = &inputs[1];
        let b = &inputs[2];
        let g = &inputs[3];

        let mu = x.mean_axis(-1, true)?;
        let mu2 = x.square()?.mean_axis(-1, true)?;
        let var = mu2.sub(&mu.square()?)?;
        let n = var.add_scalar(eps)?.rsqrt()?;
        let n3 = n.pow_scalar(3.0)?;
        let x_c = x.sub(&mu)?;

        // df/dx
        let wg = w.mul(g)?;
        let sumwg = wg.mean_axis(-1, true)?;
        let sumwgxc = wg.mul(&x_c)?.mean_axis(-1, true)?;
        let t1 = x_c.mul(&sumwgxc)?.mul(&n3)?;
        let t2 = wg.sub(&sumwg)?.mul(&n)?;
        let dx = t2.sub(&t1)?;

        let axes: Vec<isize> = (0..g.ndim() as isize - 1).collect();

        // df/dw: zero when weight was an unset rank-0 placeholder
        let dw = if w.ndim() == 0 {
            Tensor::zeros_like(w)
        } else {
            g.mul(&x_c.mul(&n)?)?.sum_axes(&axes, false)?
        };

        // df/db
        let db = if b.ndim() == 0 {
            Tensor::zeros_like(b)
        } else {
            g.sum_axes(&axes, false)?
        };

        Ok(vec![dx, dw, db])
    })
}

/// The paired analytic gradient primitive for LayerNorm.
/// Inputs: `[x, weight, bias, cotangent]`; outputs: `[dx, dweight, dbias]`.
pub struct LayerNormVjp {
    eps: f32,
    stream: Stream,
}

impl LayerNormVjp {
    pub fn new(eps: f32, stream: Stream) -> Self {
        Self { eps, stream }
    }
}

impl FusedPrimitive for LayerNormVjp {
    fn name(&self) -> &'static str {
        "layer_norm_vjp"
    }

    fn stream(&self) -> Stream {
        self.stream
    }

    fn decomposition(&self) -> Arc<dyn Decomposition> {
        layer_norm_vjp_decomposition(self.eps)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool {
        other
            .as_any()
            .downcast_ref::<LayerNormVjp>()
            .is_some_and(|o| self.eps == o.eps)
    }
}

/// Select the gradients for the requested argument indices, in ascending
/// index order.
pub(crate) fn select_argnums(
    vjps: Vec<Tensor>,
    argnums: &[usize],
    op: &'static str,
) -> Result<Vec<Tensor>> {
    let mut order = argnums.to_vec();
    order.sort_unstable();
    order
        .iter()
        .map(|&i| {
            vjps.get(i).cloned().ok_or_else(|| {
                OpalError::invalid(op, format!("gradient requested for argument {i} of {}", vjps.len()))
            })
        })
        .collect()
}
