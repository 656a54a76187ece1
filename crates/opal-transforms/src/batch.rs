//! Batching transform over closures.

use opal_core::{OpalError, Result, Tensor};

/// Lift `f` to apply independently across a batch axis.
///
/// `in_axes[i]` names the batch axis of `inputs[i]`, or `None` for
/// inputs shared across the whole batch. Every output is stacked along
/// axis 0 regardless of the input axes.
pub fn vmap(
    f: impl Fn(&[Tensor]) -> Result<Vec<Tensor>>,
    inputs: &[Tensor],
    in_axes: &[Option<usize>],
) -> Result<Vec<Tensor>> {
    if in_axes.len() != inputs.len() {
        return Err(OpalError::invalid(
            "vmap",
            format!(
                "{} inputs but {} batch axes were given",
                inputs.len(),
                in_axes.len()
            ),
        ));
    }

    let mut batch_size: Option<usize> = None;
    for (t, ax) in inputs.iter().zip(in_axes.iter()) {
        if let Some(ax) = ax {
            let n = t.dim(*ax as isize)?;
            match batch_size {
                None => batch_size = Some(n),
                Some(prev) if prev != n => {
                    return Err(OpalError::invalid(
                        "vmap",
                        format!("mismatched batch sizes {prev} and {n}"),
                    ));
                }
                _ => {}
            }
        }
    }
    let batch_size = batch_size.ok_or_else(|| {
        OpalError::invalid("vmap", "at least one input must carry a batch axis")
    })?;

    let mut per_index_outputs: Vec<Vec<Tensor>> = Vec::with_capacity(batch_size);
    for b in 0..batch_size {
        let mut sliced = Vec::with_capacity(inputs.len());
        for (t, ax) in inputs.iter().zip(in_axes.iter()) {
            match ax {
                Some(ax) => sliced.push(take_index(t, *ax, b)?),
                None => sliced.push(t.clone()),
            }
        }
        per_index_outputs.push(f(&sliced)?);
    }

    let n_outputs = per_index_outputs[0].len();
    if per_index_outputs.iter().any(|o| o.len() != n_outputs) {
        return Err(OpalError::invalid(
            "vmap",
            "closure returned a varying number of outputs across the batch",
        ));
    }

    let mut stacked = Vec::with_capacity(n_outputs);
    for k in 0..n_outputs {
        let pieces: Vec<&Tensor> = per_index_outputs.iter().map(|o| &o[k]).collect();
        stacked.push(Tensor::stack(&pieces, 0)?);
    }
    Ok(stacked)
}

/// Select index `b` along `axis` and drop that axis.
fn take_index(t: &Tensor, axis: usize, b: usize) -> Result<Tensor> {
    let dims = t.shape().dims();
    let mut starts = vec![0usize; dims.len()];
    let mut stops = dims.to_vec();
    let steps = vec![1usize; dims.len()];
    starts[axis] = b;
    stops[axis] = b + 1;
    let sliced = t.slice(&starts, &stops, &steps)?;
    let mut squeezed: Vec<isize> = Vec::with_capacity(dims.len() - 1);
    for (i, &d) in dims.iter().enumerate() {
        if i != axis {
            squeezed.push(d as isize);
        }
    }
    sliced.reshape(&squeezed)
}
