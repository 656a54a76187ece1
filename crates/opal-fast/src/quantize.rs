//! Affine quantization codec.
//!
//! Weights are partitioned along the last axis into groups of
//! `group_size` elements sharing one scale and bias. Calibration picks
//! the "long edge" of each group (the extremum with the larger
//! magnitude) and re-centers the scale so that edge value round-trips
//! exactly. Codes pack `32 / bits` to a 32-bit word.

use std::any::Any;
use std::sync::Arc;

use opal_core::{to_stream, DType, OpalError, Result, Stream, Tensor};
use opal_kernels::pack::{codes_per_word, pack_codes, unpack_words};

use crate::policy;
use crate::primitive::{build_fused, Decomposition, FusedPrimitive, OutputSpec};

const QUANT_EPS: f32 = 1e-7;

/// Quantize `w` (rank ≥ 2) with per-group calibration.
///
/// Returns `(packed_weights, scales, biases)`: packed weights are `u32`
/// with last axis `w.last / (32 / bits)`; scales and biases carry `w`'s
/// dtype with last axis `w.last / group_size`.
pub fn affine_quantize(
    w: &Tensor,
    group_size: usize,
    bits: u32,
    stream: Option<Stream>,
) -> Result<(Tensor, Tensor, Tensor)> {
    validate_quantize_args("affine_quantize", w, group_size, bits)?;
    let per_word = codes_per_word(bits);
    let last = w.dim(-1)?;

    let s = to_stream(stream);
    let prim = AffineQuantize {
        group_size,
        bits,
        dequantize: false,
        stream: s,
    };

    let mut lead: Vec<usize> = w.shape().dims().to_vec();
    lead.pop();
    let mut wq_shape = lead.clone();
    wq_shape.push(last / per_word);
    let mut s_shape = lead;
    s_shape.push(last / group_size);

    let outputs = if policy::fast_path_eligible(&s) {
        build_fused(
            Arc::new(prim),
            vec![w.clone()],
            vec![
                OutputSpec::new(&wq_shape, DType::U32),
                OutputSpec::new(&s_shape, w.dtype()),
                OutputSpec::new(&s_shape, w.dtype()),
            ],
        )
    } else {
        prim.decomposition().evaluate(&[w.clone()])?
    };
    let mut it = outputs.into_iter();
    Ok((
        it.next().expect("packed weights"),
        it.next().expect("scales"),
        it.next().expect("biases"),
    ))
}

/// Quantize `w` against externally supplied per-group scales and biases
/// (e.g. from a previously calibrated model), skipping calibration.
pub fn affine_quantize_with(
    w: &Tensor,
    scales: &Tensor,
    biases: &Tensor,
    group_size: usize,
    bits: u32,
    stream: Option<Stream>,
) -> Result<Tensor> {
    validate_quantize_args("affine_quantize", w, group_size, bits)?;
    let last = w.dim(-1)?;
    if scales.dim(-1)? != last / group_size || biases.dim(-1)? != last / group_size {
        return Err(OpalError::invalid(
            "affine_quantize",
            format!(
                "scales/biases of shape {}/{} do not match matrix shape {} with group_size={group_size}",
                scales.shape(),
                biases.shape(),
                w.shape()
            ),
        ));
    }
    let per_word = codes_per_word(bits);

    let s = to_stream(stream);
    let prim = AffineQuantize {
        group_size,
        bits,
        dequantize: false,
        stream: s,
    };
    let inputs = vec![w.clone(), scales.clone(), biases.clone()];

    if policy::fast_path_eligible(&s) {
        let mut wq_shape: Vec<usize> = w.shape().dims().to_vec();
        *wq_shape.last_mut().expect("rank >= 2") = last / per_word;
        let outs = build_fused(
            Arc::new(prim),
            inputs,
            vec![OutputSpec::new(&wq_shape, DType::U32)],
        );
        return Ok(outs.into_iter().next().expect("packed weights"));
    }
    let mut outs = prim.decomposition().evaluate(&inputs)?;
    Ok(outs.remove(0))
}

/// Invert the packing: unpack each 32-bit word into `32 / bits` codes,
/// multiply by the group scale and add the group bias.
pub fn affine_dequantize(
    w: &Tensor,
    scales: &Tensor,
    biases: &Tensor,
    group_size: usize,
    bits: u32,
    stream: Option<Stream>,
) -> Result<Tensor> {
    const OP: &str = "affine_dequantize";
    if bits == 0 {
        return Err(OpalError::invalid(OP, format!("invalid value for bits: {bits}")));
    }
    if group_size == 0 {
        return Err(OpalError::invalid(
            OP,
            format!("invalid value for group_size: {group_size}"),
        ));
    }
    if !matches!(bits, 2 | 4 | 8) {
        return Err(OpalError::unsupported(
            OP,
            format!("{bits}-bit codes are not supported; the supported bits are 2, 4 and 8"),
        ));
    }
    if w.ndim() < 2 || scales.ndim() < 2 || biases.ndim() < 2 {
        return Err(OpalError::invalid(
            OP,
            format!(
                "the matrix to be dequantized must have at least 2 dimensions but it has only {}",
                w.ndim()
            ),
        ));
    }
    let mut w_lead: Vec<usize> = w.shape().dims().to_vec();
    w_lead.pop();
    let mut s_lead: Vec<usize> = scales.shape().dims().to_vec();
    s_lead.pop();
    let mut b_lead: Vec<usize> = biases.shape().dims().to_vec();
    b_lead.pop();
    if w_lead != s_lead || w_lead != b_lead || scales.shape() != biases.shape() {
        return Err(OpalError::invalid(
            OP,
            "shape of scales and biases does not match the matrix",
        ));
    }
    if w.dtype() != DType::U32 {
        return Err(OpalError::invalid(
            OP,
            "the matrix should be given as a u32",
        ));
    }
    let per_word = codes_per_word(bits);
    if w.dim(-1)? * per_word != scales.dim(-1)? * group_size {
        return Err(OpalError::invalid(
            OP,
            format!(
                "shape of scales and biases does not match the matrix given the quantization parameters; provided matrix of shape {} and scales/biases of shape {} with group_size={group_size} and bits={bits}",
                w.shape(),
                scales.shape()
            ),
        ));
    }

    let s = to_stream(stream);
    let prim = AffineQuantize {
        group_size,
        bits,
        dequantize: true,
        stream: s,
    };
    let inputs = vec![w.clone(), scales.clone(), biases.clone()];

    if policy::fast_path_eligible(&s) {
        let mut out_shape: Vec<usize> = w.shape().dims().to_vec();
        *out_shape.last_mut().expect("rank >= 2") = w.dim(-1)? * per_word;
        let outs = build_fused(
            Arc::new(prim),
            inputs,
            vec![OutputSpec::new(&out_shape, scales.dtype())],
        );
        return Ok(outs.into_iter().next().expect("dequantized weights"));
    }
    let mut outs = prim.decomposition().evaluate(&inputs)?;
    Ok(outs.remove(0))
}

fn validate_quantize_args(
    op: &'static str,
    w: &Tensor,
    group_size: usize,
    bits: u32,
) -> Result<()> {
    if !matches!(group_size, 32 | 64 | 128) {
        return Err(OpalError::invalid(
            op,
            format!(
                "the requested group size {group_size} is not supported; the supported group sizes are 32, 64 and 128"
            ),
        ));
    }
    if !matches!(bits, 2 | 4 | 8) {
        return Err(OpalError::unsupported(
            op,
            format!(
                "the requested number of bits {bits} is not supported; the supported bits are 2, 4 and 8"
            ),
        ));
    }
    if w.ndim() < 2 {
        return Err(OpalError::invalid(
            op,
            format!(
                "the matrix to be quantized must have at least 2 dimensions but it has only {}",
                w.ndim()
            ),
        ));
    }
    if !w.dtype().is_float() {
        return Err(OpalError::invalid(
            op,
            format!("received unsupported type {}", w.dtype()),
        ));
    }
    let last = w.dim(-1)?;
    if last % group_size != 0 {
        return Err(OpalError::invalid(
            op,
            format!(
                "the last dimension of the matrix needs to be divisible by the quantization group size {group_size}; the provided matrix has shape {}",
                w.shape()
            ),
        ));
    }
    let per_word = codes_per_word(bits);
    if last < 32 * per_word {
        return Err(OpalError::invalid(
            op,
            format!(
                "the feature dimension is too small for quantization; we support >= 512 for 2 bits, >= 256 for 4 bits and >= 128 for 8 bits, but the provided matrix has shape {}",
                w.shape()
            ),
        ));
    }
    Ok(())
}

/// The quantization codec primitive. In quantize mode the inputs are
/// `[w]` (calibrating) or `[w, scales, biases]` (externally calibrated);
/// in dequantize mode they are `[packed, scales, biases]`.
pub struct AffineQuantize {
    group_size: usize,
    bits: u32,
    dequantize: bool,
    stream: Stream,
}

impl AffineQuantize {
    pub fn new(group_size: usize, bits: u32, dequantize: bool, stream: Stream) -> Self {
        Self {
            group_size,
            bits,
            dequantize,
            stream,
        }
    }
}

impl FusedPrimitive for AffineQuantize {
    fn name(&self) -> &'static str {
        if self.dequantize {
            "affine_dequantize"
        } else {
            "affine_quantize"
        }
    }

    fn stream(&self) -> Stream {
        self.stream
    }

    fn decomposition(&self) -> Arc<dyn Decomposition> {
        let group_size = self.group_size;
        let bits = self.bits;
        let dequantize = self.dequantize;
        Arc::new(move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
            if dequantize {
                dequantize_decomposition(inputs, group_size, bits)
            } else if inputs.len() == 1 {
                quantize_calibrating(&inputs[0], group_size, bits)
            } else {
                quantize_with_given(inputs, group_size, bits)
            }
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_equivalent(&self, other: &dyn FusedPrimitive) -> bool {
        other.as_any().downcast_ref::<AffineQuantize>().is_some_and(|o| {
            self.group_size == o.group_size
                && self.bits == o.bits
                && self.dequantize == o.dequantize
        })
    }
}

/// Calibrate one group: long-edge pick, scale sign-flip, and the
/// re-centering that makes the edge value round-trip exactly.
fn calibrate_group(group: &[f32], n_bins: f32) -> (f32, f32) {
    let w_max = group.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let w_min = group.iter().cloned().fold(f32::INFINITY, f32::min);

    let min_is_edge = w_min.abs() > w_max.abs();
    let mut scale = ((w_max - w_min) / n_bins).max(QUANT_EPS);
    if !min_is_edge {
        scale = -scale;
    }
    let edge = if min_is_edge { w_min } else { w_max };

    let q0 = (edge / scale).round();
    if q0 != 0.0 {
        (edge / q0, edge)
    } else {
        (scale, 0.0)
    }
}

fn quantize_group(group: &[f32], scale: f32, bias: f32, n_bins: f32, codes: &mut Vec<u32>) {
    for &v in group {
        let code = ((v - bias) / scale).round().clamp(0.0, n_bins);
        codes.push(code as u32);
    }
}

fn quantize_calibrating(w: &Tensor, group_size: usize, bits: u32) -> Result<Vec<Tensor>> {
    let w = w.contiguous()?;
    if !w.dtype().is_float() {
        return Err(OpalError::UnsupportedDType(w.dtype()));
    }
    let data = w
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError("quantize: missing f32 buffer".into()))?;

    let last = w.dim(-1)?;
    let rows = w.numel() / last;
    let groups = last / group_size;
    let per_word = codes_per_word(bits);
    let n_bins = ((1u32 << bits) - 1) as f32;

    let mut packed = Vec::with_capacity(rows * last / per_word);
    let mut scales = Vec::with_capacity(rows * groups);
    let mut biases = Vec::with_capacity(rows * groups);

    let mut codes = Vec::with_capacity(last);
    for r in 0..rows {
        let row = &data[r * last..(r + 1) * last];
        codes.clear();
        for g in 0..groups {
            let group = &row[g * group_size..(g + 1) * group_size];
            let (scale, bias) = calibrate_group(group, n_bins);
            scales.push(scale);
            biases.push(bias);
            quantize_group(group, scale, bias, n_bins, &mut codes);
        }
        packed.extend_from_slice(&pack_codes(&codes, bits));
    }

    let mut lead: Vec<usize> = w.shape().dims().to_vec();
    lead.pop();
    let mut wq_shape = lead.clone();
    wq_shape.push(last / per_word);
    let mut s_shape = lead;
    s_shape.push(groups);

    Ok(vec![
        Tensor::from_u32(&packed, &wq_shape),
        Tensor::from_f32_with_dtype(scales, &s_shape, w.dtype()),
        Tensor::from_f32_with_dtype(biases, &s_shape, w.dtype()),
    ])
}

fn quantize_with_given(inputs: &[Tensor], group_size: usize, bits: u32) -> Result<Vec<Tensor>> {
    let w = inputs[0].contiguous()?;
    let scales_t = inputs[1].contiguous()?;
    let biases_t = inputs[2].contiguous()?;
    let data = w
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError("quantize: missing f32 buffer".into()))?;
    let scales = scales_t
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError("quantize: missing scales buffer".into()))?;
    let biases = biases_t
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError("quantize: missing biases buffer".into()))?;

    let last = w.dim(-1)?;
    let rows = w.numel() / last;
    let groups = last / group_size;
    let per_word = codes_per_word(bits);
    let n_bins = ((1u32 << bits) - 1) as f32;

    let mut packed = Vec::with_capacity(rows * last / per_word);
    let mut codes = Vec::with_capacity(last);
    for r in 0..rows {
        let row = &data[r * last..(r + 1) * last];
        codes.clear();
        for g in 0..groups {
            let group = &row[g * group_size..(g + 1) * group_size];
            let scale = scales[r * groups + g];
            let bias = biases[r * groups + g];
            quantize_group(group, scale, bias, n_bins, &mut codes);
        }
        packed.extend_from_slice(&pack_codes(&codes, bits));
    }

    let mut wq_shape: Vec<usize> = w.shape().dims().to_vec();
    *wq_shape.last_mut().expect("rank >= 2") = last / per_word;
    Ok(vec![Tensor::from_u32(&packed, &wq_shape)])
}

fn dequantize_decomposition(
    inputs: &[Tensor],
    group_size: usize,
    bits: u32,
) -> Result<Vec<Tensor>> {
    let w = inputs[0].contiguous()?;
    let scales_t = inputs[1].contiguous()?;
    let biases_t = inputs[2].contiguous()?;
    let words = w
        .as_u32_slice()
        .ok_or_else(|| OpalError::StorageError("dequantize: missing u32 buffer".into()))?;
    let scales = scales_t
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError("dequantize: missing scales buffer".into()))?;
    let biases = biases_t
        .as_f32_slice()
        .ok_or_else(|| OpalError::StorageError("dequantize: missing biases buffer".into()))?;

    let per_word = codes_per_word(bits);
    let last_w = w.dim(-1)?;
    let rows = w.numel() / last_w;
    let out_last = last_w * per_word;
    let groups = out_last / group_size;

    let mut out = Vec::with_capacity(rows * out_last);
    for r in 0..rows {
        let row_words = &words[r * last_w..(r + 1) * last_w];
        let codes = unpack_words(row_words, bits);
        for (i, &code) in codes.iter().enumerate() {
            let g = i / group_size;
            out.push(code as f32 * scales[r * groups + g] + biases[r * groups + g]);
        }
    }

    let mut out_shape: Vec<usize> = w.shape().dims().to_vec();
    *out_shape.last_mut().expect("rank >= 2") = out_last;
    Ok(vec![Tensor::from_f32_with_dtype(
        out,
        &out_shape,
        scales_t.dtype(),
    )])
}
