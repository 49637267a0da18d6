//! Padding and splitting of variable-length per-image groups.

use candle_core::Tensor;
use lg_core::Error as CoreError;

use crate::error::{Error, Result};

/// Stack per-image `[N_i, ...]` tensors into a zero-padded
/// `[B, max(N_i), ...]` tensor.
///
/// Zero-length groups are allowed; their trailing shape is taken from the
/// first non-empty group.
pub fn pad_sequence(seqs: &[Tensor]) -> Result<Tensor> {
    let first = seqs
        .first()
        .ok_or_else(|| Error::InvalidInput("cannot pad an empty batch".to_string()))?;

    let lengths = seqs
        .iter()
        .map(|s| s.dim(0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let reference = seqs
        .iter()
        .zip(&lengths)
        .find(|(_, n)| **n > 0)
        .map(|(s, _)| s)
        .unwrap_or(first);

    let tail = reference.dims()[1..].to_vec();
    let max_len = lengths.iter().copied().max().unwrap_or(0);

    if max_len == 0 {
        let mut shape = vec![seqs.len(), 0];
        shape.extend(&tail);
        return Ok(Tensor::zeros(shape, reference.dtype(), reference.device())?);
    }

    let padded = seqs
        .iter()
        .zip(&lengths)
        .map(|(s, &n)| pad_rows(s, n, max_len, &tail))
        .collect::<Result<Vec<_>>>()?;

    Ok(Tensor::stack(&padded, 0)?)
}

fn pad_rows(seq: &Tensor, n: usize, len: usize, tail: &[usize]) -> Result<Tensor> {
    if n == len {
        return Ok(seq.clone());
    }

    let mut shape = vec![len - n];
    shape.extend(tail);
    let pad = Tensor::zeros(shape, seq.dtype(), seq.device())?;

    if n == 0 {
        Ok(pad)
    } else {
        Ok(Tensor::cat(&[seq, &pad], 0)?)
    }
}

/// Split the leading dimension of `t` into consecutive groups of `counts`.
pub fn split_rows(t: &Tensor, counts: &[usize]) -> Result<Vec<Tensor>> {
    let total: usize = counts.iter().sum();
    let rows = t.dim(0)?;
    if total != rows {
        return Err(CoreError::ShapeMismatch {
            expected: format!("{} rows", total),
            actual: format!("{} rows", rows),
        }
        .into());
    }

    let mut start = 0;
    let mut groups = Vec::with_capacity(counts.len());
    for &n in counts {
        groups.push(t.narrow(0, start, n)?);
        start += n;
    }
    Ok(groups)
}

/// Concatenate along dim 0, skipping zero-row tensors. Returns `None` when
/// nothing is left.
pub fn cat_rows(tensors: &[Tensor]) -> Result<Option<Tensor>> {
    let non_empty: Vec<&Tensor> = tensors
        .iter()
        .filter(|t| t.dims().first().copied().unwrap_or(0) > 0)
        .collect();

    match non_empty.as_slice() {
        [] => Ok(None),
        [only] => Ok(Some((*only).clone())),
        many => Ok(Some(Tensor::cat(many, 0)?)),
    }
}

/// Split then pad: the inverse of flattening a padded batch's valid rows.
pub fn split_and_pad(t: &Tensor, counts: &[usize]) -> Result<Tensor> {
    pad_sequence(&split_rows(t, counts)?)
}
