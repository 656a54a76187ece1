//! Scaled dot-product attention: `O = softmax(scale * Q @ K^T + mask) @ V`.
//!
//! Supports multi-head, grouped-query, and multi-query layouts: when the
//! query head count is a multiple of the key/value head count, keys and
//! values broadcast across the repeat factor instead of being
//! materialized per query head. The softmax always accumulates in f32 —
//! an undercast softmax loses precision catastrophically for long
//! sequences.

use std::any::Any;
use std::sync::Arc;

use opal_core::{to_stream, DType, OpalError, Result, Stream, Tensor};

use crate::primitive::{build_fused, Decomposition, FusedPrimitive, OutputSpec};

/// Fast-path eligibility for the attention operator.
///
/// The two architectural gates (a decode-optimized single-query variant
/// and a full self-attention variant) are computed in full, then masked
/// by `fused_enabled` — the fused kernel stays disabled by default
/// pending performance tuning. This is a tunable policy, not an
/// algorithmic requirement: with the gate closed every call evaluates
/// the decomposition and remains correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpaPolicy {
    pub fused_enabled: bool,
}

impl Default for SdpaPolicy {
    fn default() -> Self {
        Self {
            fused_enabled: false,
        }
    }
}

impl SdpaPolicy {
    #[allow(clippy::too_many_arguments)]
    pub fn eligible(
        &self,
        batch: usize,
        n_q_heads: usize,
        n_kv_heads: usize,
        query_seq_len: usize,
        head_dim: usize,
        has_mask: bool,
        dtype: DType,
        stream: &Stream,
    ) -> bool {
        let supported_head_dim = matches!(head_dim, 64 | 80 | 128);
        let supported_head_dim_self_attn = matches!(head_dim, 64 | 128);

        let supports_full_self_attention = query_seq_len >= 16
            && !has_mask
            && supported_head_dim_self_attn
            && n_q_heads == n_kv_heads
            && dtype != DType::BF16
            && stream.device.is_gpu();

        // decode-optimized single-query path
        let supports_sdpa = batch == 1
            && query_seq_len == 1
            && !has_mask
            && supported_head_dim
            && dtype != DType::BF16
            && stream.device.is_gpu();

        (supports_sdpa || supports_full_self_attention) && self.fused_enabled
    }
}

/// Scaled dot-product attention over rank-4 inputs
/// `(batch, heads, sequence, head_dim)`.
///
/// `keys`/`values` must share the queries' batch size and each other's
/// head count; the query head count must be an exact multiple of the
/// key/value head count. An optional additive `mask` broadcasts onto the
/// raw score tensor. `scale` multiplies queries before the dot product.
pub fn scaled_dot_product_attention(
    queries: &Tensor,
    keys: &Tensor,
    values: &Tensor,
    scale: f32,
    mask: Option<&Tensor>,
    stream: Option<Stream>,
) -> Result<Tensor> {
    scaled_dot_product_attention_with_policy(
        queries,
        keys,
        values,
        scale,
        mask,
        SdpaPolicy::default(),
        stream,
    )
}

/// As [`scaled_dot_product_attention`], with an explicit fast-path
/// policy.
#[allow(clippy::too_many_arguments)]
pub fn scaled_dot_product_attention_with_policy(
    queries: &Tensor,
    keys: &Tensor,
    values: &Tensor,
    scale: f32,
    mask: Option<&Tensor>,
    policy: SdpaPolicy,
    stream: Option<Stream>,
) -> Result<Tensor> {
    const OP: &str = "scaled_dot_product_attention";

    for tensor in [queries, keys, values] {
        if tensor.ndim() != 4 {
            return Err(OpalError::invalid(
                OP,
                format!("input with shape {} expected to be rank 4", tensor.shape()),
            ));
        }
    }

    let batch = queries.dim(0)?;
    for tensor in [keys, values] {
        if tensor.dim(0)? != batch {
            return Err(OpalError::invalid(
                OP,
                format!(
                    "mismatching batch dimension for input with shape {}",
                    tensor.shape()
                ),
            ));
        }
    }

    if queries.dim(-1)? != keys.dim(-1)? {
        return Err(OpalError::invalid(
            OP,
            format!(
                "query, keys expected to have matching last dimension; found query shape {} for keys shape {}",
                queries.shape(),
                keys.shape()
            ),
        ));
    }

    let n_q_heads = queries.dim(-3)?;
    let n_kv_heads = keys.dim(-3)?;
    if keys.dim(-3)? != values.dim(-3)? {
        return Err(OpalError::invalid(
            OP,
            format!(
                "keys, values expected to have matching n_kv_heads; found keys with n_heads {} for values with n_heads {}",
                keys.dim(-3)?,
                values.dim(-3)?
            ),
        ));
    }
    if n_q_heads % n_kv_heads != 0 {
        return Err(OpalError::invalid(
            OP,
            format!(
                "n_heads must be a multiple of n_kv_heads, found n_heads {n_q_heads} for n_kv_heads {n_kv_heads}"
            ),
        ));
    }

    let final_type = queries
        .dtype()
        .promote(keys.dtype())
        .promote(values.dtype());
    if !final_type.is_float() {
        return Err(OpalError::invalid(
            OP,
            format!("received unsupported type {final_type}"),
        ));
    }

    let q = queries.astype(final_type)?;
    let k = keys.astype(final_type)?;
    let v = values.astype(final_type)?;

    let s = to_stream(stream);
    let needs_mask = mask.is_some();
    let head_dim = q.dim(-1)?;
    let query_seq_len = q.dim(2)?;

    if policy.eligible(
        batch,
        n_q_heads,
        n_kv_heads,
        query_seq_len,
        head_dim,
        needs_mask,
        final_type,
        &s,
    ) {
        let out_shape = vec![batch, n_q_heads, query_seq_len, v.dim(-1)?];
        let prim = Arc::new(Sdpa {
            scale,
            needs_mask: false,
            n_q_heads,
            n_kv_heads,
            stream: s,
        });
        let outs = build_fused(
            prim,
            vec![q, k, v],
            vec![OutputSpec::new(&out_shape, final_type)],
        );
        return Ok(outs.into_iter().next().expect("sdpa has one output"));
    }

    let decomposition = sdpa_decomposition(scale, needs_mask, n_q_heads, n_kv_heads);
    let mut inputs = vec![q, k, v];
    if let Some(m) = mask {
        inputs.push(m.clone());
    }
    let mut outs = decomposition.evaluate(&inputs)?;
    Ok(outs.remove(0))
}

fn sdpa_decomposition(
    scale: f32,
    needs_mask: bool,
    n_q_heads: usize,
    n_kv_heads: usize,
) -> Arc<dyn Decomposition> {
    Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
        let q = inputs[0].mul_scalar(scale)?;
        let n_repeats = n_q_heads / n_kv_heads;
        let b = q.dim(0)? as isize;
        let l = q.dim(2)? as isize;

        let mut q = q;
        let mut k = inputs[1].clone();
        let mut v = inputs[2].clone();
        if n_repeats > 1 {
            // Expose the head-repeat factor and broadcast keys/values
            // across it instead of materializing repeats.
            q = q.reshape(&[b, n_kv_heads as isize, n_repeats as isize, l, -1])?;
            k = k.expand_dims(2)?;
            v = v.expand_dims(2)?;
        }

        let mut scores = q.matmul(&k.swapaxes(-1, -2)?)?;
        if needs_mask {
            scores = scores.add(&inputs[3])?;
        }
        // softmax accumulates in f32 regardless of input precision
        let scores = scores.softmax(-1)?;
        let mut out = scores.matmul(&v)?;
        if n_repeats > 1 {
            out = out.reshape(&[b, n_q_heads as isize, l, -1])?;
        }
        Ok(vec![out])
    })
}

/// The attention fused primitive. Inputs: `[q, k, v]` (plus a mask when
/// the decomposition path carries one).
pub struct Sdpa {
    scale: f32,
    needs_mask: bool,
    n_q_heads: usize,
    n_kv_heads: usize,
    stream: Stream,
}

impl Sdpa {
    pub fn new(
        scale: f32,
        needs_mask: bool,
        n_q_heads: usize,
        n_kv_heads: usize,
        stream: Stream,
    ) -> Self {
        Self {
            scale,
            needs_mask,
            n_q_heads,
            n_kv_heads,
            stream,
        }
    }
}

impl FusedPrimitive for Sdpa {
    fn name(&self) -> &'static str {
        "scaled_dot_product_attention"
    }

    fn stream(&self) -> Stream {
        self.stream
    }

    fn decomposition(&self) -> Arc<dyn Decomposition> {
        sdpa_decomposition(self.scale, self.needs_mask, self.n_q_heads, self.n_kv_heads)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool {
        other
            .as_any()
            .downcast_ref::<Sdpa>()
            .is_some_and(|o| self.needs_mask == o.needs_mask && self.scale == o.scale)
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

    /// Plain reference attention in f64, one (batch, q-head) at a time.
    fn reference_attention(
        q: &[f32],
        k: &[f32],
        v: &[f32],
        mask: Option<&[f32]>,
        b: usize,
        hq: usize,
        hkv: usize,
        lq: usize,
        lk: usize,
        d: usize,
        dv: usize,
        scale: f32,
    ) -> Vec<f32> {
        let rep = hq / hkv;
        let mut out = vec![0.0f32; b * hq * lq * dv];
        for bi in 0..b {
            for h in 0..hq {
                let kvh = h / rep;
                for i in 0..lq {
                    let mut scores = vec![0.0f64; lk];
                    for j in 0..lk {
                        let mut dot = 0.0f64;
                        for p in 0..d {
                            let qv = q[((bi * hq + h) * lq + i) * d + p] as f64;
                            let kv = k[((bi * hkv + kvh) * lk + j) * d + p] as f64;
                            dot += qv * kv;
                        }
                        scores[j] = dot * scale as f64;
                        if let Some(m) = mask {
                            scores[j] += m[i * lk + j] as f64;
                        }
                    }
                    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    let mut sum = 0.0f64;
                    for s in scores.iter_mut() {
                        *s = (*s - max).exp();
                        sum += *s;
                    }
                    for j in 0..lk {
                        scores[j] /= sum;
                    }
                    for p in 0..dv {
                        let mut acc = 0.0f64;
                        for j in 0..lk {
                            acc += scores[j] * v[((bi * hkv + kvh) * lk + j) * dv + p] as f64;
                        }
                        out[((bi * hq + h) * lq + i) * dv + p] = acc as f32;
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_sdpa_matches_reference() {
        let (b, h, l, d) = (2, 2, 3, 4);
        let q = Tensor::randn(&[b, h, l, d]);
        let k = Tensor::randn(&[b, h, l, d]);
        let v = Tensor::randn(&[b, h, l, d]);
        let scale = 1.0 / (d as f32).sqrt();

        let out = scaled_dot_product_attention(&q, &k, &v, scale, None, None).unwrap();
        assert_eq!(out.shape().dims(), &[b, h, l, d]);

        let expected = reference_attention(
            q.as_f32_slice().unwrap(),
            k.as_f32_slice().unwrap(),
            v.as_f32_slice().unwrap(),
            None,
            b,
            h,
            h,
            l,
            l,
            d,
            d,
            scale,
        );
        assert_close(
            out.contiguous().unwrap().as_f32_slice().unwrap(),
            &expected,
            1e-4,
        );
    }

    #[test]
    fn test_sdpa_grouped_query_heads() {
        // 4 query heads over 2 kv heads: broadcast, not materialized.
        let (b, hq, hkv, l, d) = (1, 4, 2, 3, 2);
        let q = Tensor::randn(&[b, hq, l, d]);
        let k = Tensor::randn(&[b, hkv, l, d]);
        let v = Tensor::randn(&[b, hkv, l, d]);
        let scale = 0.5f32;

        let out = scaled_dot_product_attention(&q, &k, &v, scale, None, None).unwrap();
        assert_eq!(out.shape().dims(), &[b, hq, l, d]);

        let expected = reference_attention(
            q.as_f32_slice().unwrap(),
            k.as_f32_slice().unwrap(),
            v.as_f32_slice().unwrap(),
            None,
            b,
            hq,
            hkv,
            l,
            l,
            d,
            d,
            scale,
        );
        assert_close(
            out.contiguous().unwrap().as_f32_slice().unwrap(),
            &expected,
            1e-4,
        );
    }

    #[test]
    fn test_sdpa_additive_mask() {
        let (b, h, l, d) = (1, 1, 4, 2);
        let q = Tensor::randn(&[b, h, l, d]);
        let k = Tensor::randn(&[b, h, l, d]);
        let v = Tensor::randn(&[b, h, l, d]);
        // causal mask
        let mut m = vec![0.0f32; l * l];
        for i in 0..l {
            for j in (i + 1)..l {
                m[i * l + j] = f32::NEG_INFINITY;
            }
        }
        let mask = Tensor::from_f32(&m, &[l, l]);
        let scale = 1.0f32;

        let out = scaled_dot_product_attention(&q, &k, &v, scale, Some(&mask), None).unwrap();
        let expected = reference_attention(
            q.as_f32_slice().unwrap(),
            k.as_f32_slice().unwrap(),
            v.as_f32_slice().unwrap(),
            Some(&m),
            b,
            h,
            h,
            l,
            l,
            d,
            d,
            scale,
        );
        assert_close(
            out.contiguous().unwrap().as_f32_slice().unwrap(),
            &expected,
            1e-4,
        );
    }

    #[test]
    fn test_sdpa_shape_contract_with_distinct_value_dim() {
        let q = Tensor::randn(&[2, 4, 5, 8]);
        let k = Tensor::randn(&[2, 2, 6, 8]);
        let v = Tensor::randn(&[2, 2, 6, 3]);
        let out = scaled_dot_product_attention(&q, &k, &v, 0.35, None, None).unwrap();
        assert_eq!(out.shape().dims(), &[2, 4, 5, 3]);
    }

    #[test]
    fn test_sdpa_validation_failures() {
        let ok = Tensor::randn(&[1, 2, 3, 4]);
        let rank3 = Tensor::randn(&[2, 3, 4]);
        assert!(scaled_dot_product_attention(&rank3, &ok, &ok, 1.0, None, None).is_err());

        // batch mismatch
        let other_batch = Tensor::randn(&[2, 2, 3, 4]);
        assert!(scaled_dot_product_attention(&ok, &other_batch, &other_batch, 1.0, None, None)
            .is_err());

        // head_dim mismatch between q and k
        let wide = Tensor::randn(&[1, 2, 3, 8]);
        assert!(scaled_dot_product_attention(&ok, &wide, &ok, 1.0, None, None).is_err());

        // kv head count mismatch between k and v
        let one_head = Tensor::randn(&[1, 1, 3, 4]);
        assert!(scaled_dot_product_attention(&ok, &ok, &one_head, 1.0, None, None).is_err());

        // n_q_heads not a multiple of n_kv_heads
        let three_heads = Tensor::randn(&[1, 3, 3, 4]);
        assert!(
            scaled_dot_product_attention(&three_heads, &ok, &ok, 1.0, None, None).is_err()
        );
    }

    #[test]
    fn test_sdpa_policy_default_off() {
        // Eligible configuration in every respect, but the fused flag is
        // off by default.
        let policy = SdpaPolicy::default();
        let s = Stream::new(Device::Gpu(0));
        assert!(!policy.eligible(1, 8, 8, 1, 64, false, DType::F32, &s));

        let enabled = SdpaPolicy { fused_enabled: true };
        assert!(enabled.eligible(1, 8, 8, 1, 64, false, DType::F32, &s));
    }

    #[test]
    fn test_sdpa_policy_gates() {
        let p = SdpaPolicy { fused_enabled: true };
        let gpu = Stream::new(Device::Gpu(0));
        let cpu = Stream::new(Device::Cpu);

        // decode path: batch 1, single query position
        assert!(p.eligible(1, 8, 8, 1, 80, false, DType::F32, &gpu));
        assert!(!p.eligible(2, 8, 8, 1, 80, false, DType::F32, &gpu));
        assert!(!p.eligible(1, 8, 8, 1, 96, false, DType::F32, &gpu));

        // full self-attention path: long sequence, equal heads
        assert!(p.eligible(4, 8, 8, 32, 128, false, DType::F32, &gpu));
        assert!(!p.eligible(4, 8, 4, 32, 128, false, DType::F32, &gpu));
        assert!(!p.eligible(4, 8, 8, 32, 80, false, DType::F32, &gpu));
        assert!(!p.eligible(4, 8, 8, 8, 128, false, DType::F32, &gpu));

        // masks, bf16, and cpu targets always fall back
        assert!(!p.eligible(1, 8, 8, 1, 64, true, DType::F32, &gpu));
        assert!(!p.eligible(1, 8, 8, 1, 64, false, DType::BF16, &gpu));
        assert!(!p.eligible(1, 8, 8, 1, 64, false, DType::F32, &cpu));
    }

    #[test]
    fn test_sdpa_softmax_runs_wide_for_narrow_inputs() {
        // With f16 inputs whose scores are far apart, a softmax computed
        // at f16 resolution would denormalize; the wide accumulation
        // keeps rows summing to 1.
        let q = Tensor::from_f32(&[8.0, 8.0], &[1, 1, 1, 2]).astype(DType::F16).unwrap();
        let k = Tensor::from_f32(&[8.0, 8.0, -8.0, -8.0, 0.0, 0.0], &[1, 1, 3, 2])
            .astype(DType::F16)
            .unwrap();
        let v = Tensor::from_f32(&[1.0, 0.0, 0.0, 1.0, 0.5, 0.5], &[1, 1, 3, 2])
            .astype(DType::F16)
            .unwrap();

        let out = scaled_dot_product_attention(&q, &k, &v, 1.0, None, None).unwrap();
        assert_eq!(out.dtype(), DType::F16);
        let data = out.contiguous().unwrap();
        let total = data.get_f32(0).unwrap() + data.get_f32(1).unwrap();
        assert!((total - 1.0).abs() < 1e-2, "attention row sums to {total}");
    }

    #[test]
    fn test_sdpa_vjp_through_decomposition() {
        // The generic reverse transform over the decomposition: check
        // dV against the analytic fact dV = P^T @ g.
        let (b, h, l, d) = (1, 1, 2, 2);
        let q = Tensor::randn(&[b, h, l, d]);
        let k = Tensor::randn(&[b, h, l, d]);
        let v = Tensor::randn(&[b, h, l, d]);
        let g = Tensor::ones(&[b, h, l, d]);
        let scale = 0.7f32;

        let prim = Sdpa::new(scale, false, h, h, Stream::new(Device::Cpu));
        let grads = prim
            .vjp(&[q.clone(), k.clone(), v.clone()], &[g.clone()], &[2], &[])
            .unwrap();
        assert_eq!(grads.len(), 1);
        let dv = grads[0].contiguous().unwrap();

        let scores = q
            .mul_scalar(scale)
            .unwrap()
            .matmul(&k.swapaxes(-1, -2).unwrap())
            .unwrap()
            .softmax(-1)
            .unwrap();
        let expected = scores.swapaxes(-1, -2).unwrap().matmul(&g).unwrap();
        assert_close(
            dv.as_f32_slice().unwrap(),
            expected.contiguous().unwrap().as_f32_slice().unwrap(),
            1e-4,
        );
    }

    #[test]
    fn test_sdpa_equivalence() {
        let s = Stream::new(Device::Cpu);
        let a = Sdpa::new(0.5, false, 8, 8, s);
        let b = Sdpa::new(0.5, false, 4, 4, s);
        let c = Sdpa::new(0.25, false, 8, 8, s);
        let d = Sdpa::new(0.5, true, 8, 8, s);
        assert!(a.is_equivalent(&b));
        assert!(!a.is_equivalent(&c));
        assert!(!a.is_equivalent(&d));
    }
}
