use std::mem;

use aggregation::{Gradient, SparseGradient, Tensor};
use ndarray::{Axis, concatenate};

use crate::{CollectiveErr, Compression, ReduceOp, Result};

/// Combines the contributions of every rank of a round, position by position.
///
/// Dense tensors are summed in rank order, sparse ones are gathered by concatenating their rows
/// in rank order. Either way the result is divided according to `op`.
///
/// # Arguments
/// * `contributions` - The tensors of every rank, indexed by rank. Must not be empty.
/// * `op` - The reduction operator.
/// * `compression` - The precision the result travels back with.
///
/// # Returns
/// The reduced tensors, or an error if the ranks disagree on their amount, shape or format.
pub(crate) fn reduce(
    contributions: Vec<Vec<Gradient>>,
    op: ReduceOp,
    compression: Compression,
) -> Result<Vec<Gradient>> {
    let expected = contributions.first().map_or(0, Vec::len);

    if let Some((rank, got)) = contributions
        .iter()
        .map(Vec::len)
        .enumerate()
        .find(|&(_, len)| len != expected)
    {
        return Err(CollectiveErr::Desync {
            rank,
            got,
            expected,
        });
    }

    let divisor = op.divisor(contributions.len());
    let mut ranks: Vec<_> = contributions.into_iter().map(Vec::into_iter).collect();

    (0..expected)
        .map(|position| {
            let mut dense = Vec::new();
            let mut sparse = Vec::new();

            for grad in ranks.iter_mut().filter_map(Iterator::next) {
                match grad {
                    Gradient::Dense(t) => dense.push(t),
                    Gradient::Sparse(s) => sparse.push(s),
                }
            }

            let reduced = match (dense.is_empty(), sparse.is_empty()) {
                (false, true) => sum(position, dense, divisor)?,
                (true, false) => gather(position, sparse, divisor)?,
                _ => return Err(CollectiveErr::MixedFormats { position }),
            };

            Ok(compression.apply_gradient(reduced))
        })
        .collect()
}

/// Hands every rank a copy of the root's tensors.
///
/// # Arguments
/// * `contributions` - The tensors of every rank, indexed by rank.
/// * `root` - The rank whose tensors are kept, must be in bounds.
///
/// # Returns
/// The root's tensors, or an error if any rank holds a different amount or shape of them.
pub(crate) fn broadcast(
    mut contributions: Vec<Vec<Gradient>>,
    root: usize,
) -> Result<Vec<Gradient>> {
    let source = mem::take(&mut contributions[root]);

    for (rank, tensors) in contributions.iter().enumerate() {
        if rank == root {
            continue;
        }

        if tensors.len() != source.len() {
            return Err(CollectiveErr::Desync {
                rank,
                got: tensors.len(),
                expected: source.len(),
            });
        }

        if let Some(position) = tensors
            .iter()
            .zip(&source)
            .position(|(t, s)| t.shape() != s.shape())
        {
            return Err(CollectiveErr::ShapeMismatch { rank, position });
        }
    }

    Ok(source)
}

fn sum(position: usize, tensors: Vec<Tensor>, divisor: f32) -> Result<Gradient> {
    let mut tensors = tensors.into_iter();
    let Some(mut total) = tensors.next() else {
        return Err(CollectiveErr::MixedFormats { position });
    };

    for (rank, t) in tensors.enumerate() {
        if t.shape() != total.shape() {
            return Err(CollectiveErr::ShapeMismatch {
                rank: rank + 1,
                position,
            });
        }

        total += &t;
    }

    if divisor != 1. {
        total.mapv_inplace(|x| x / divisor);
    }

    Ok(Gradient::Dense(total))
}

fn gather(position: usize, parts: Vec<SparseGradient>, divisor: f32) -> Result<Gradient> {
    let dense_shape = parts[0].dense_shape().to_vec();

    if let Some(rank) = parts.iter().position(|s| s.dense_shape() != dense_shape) {
        return Err(CollectiveErr::ShapeMismatch { rank, position });
    }

    let indices = parts
        .iter()
        .flat_map(|s| s.indices().iter().copied())
        .collect();

    let views: Vec<_> = parts.iter().map(|s| s.values().view()).collect();
    let mut values = concatenate(Axis(0), &views)
        .map_err(|_| CollectiveErr::ShapeMismatch { rank: 0, position })?;

    if divisor != 1. {
        values.mapv_inplace(|x| x / divisor);
    }

    let gathered = SparseGradient::new(indices, values, dense_shape)
        .map_err(|_| CollectiveErr::ShapeMismatch { rank: 0, position })?;

    Ok(Gradient::Sparse(gathered))
}
