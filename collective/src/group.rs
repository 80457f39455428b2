use std::{num::NonZeroUsize, sync::Arc};

use aggregation::{AggregationErr, AllReduce, Gradient, Tensor};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::{CollectiveErr, Compression, ReduceOp, Result, reduction};

/// What a participant expects the round to do with the contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundKind {
    AllReduce,
    Broadcast { root: usize },
}

/// The state of the round in progress, guarded by the group's mutex.
struct Round {
    pending: Vec<Option<(RoundKind, Vec<Gradient>)>>,
    arrived: usize,
    generation: u64,
    outcome: Option<Result<Vec<Gradient>>>,
    closed: bool,
}

struct Shared {
    size: usize,
    op: ReduceOp,
    compression: Compression,
    round: Mutex<Round>,
    done: Condvar,
}

/// Creates a collective group of `size` participants living in the same process.
///
/// Each returned handle belongs to one participant, its rank being its position in the list.
/// A round completes once every handle has joined it, until then the callers block.
///
/// # Arguments
/// * `size` - The amount of participants.
/// * `op` - How the contributions are combined.
/// * `compression` - The precision tensors travel with.
///
/// # Returns
/// One `LocalCollective` handle per rank.
pub fn local_group(
    size: NonZeroUsize,
    op: ReduceOp,
    compression: Compression,
) -> Vec<LocalCollective> {
    let size = size.get();
    let shared = Arc::new(Shared {
        size,
        op,
        compression,
        round: Mutex::new(Round {
            pending: vec![None; size],
            arrived: 0,
            generation: 0,
            outcome: None,
            closed: false,
        }),
        done: Condvar::new(),
    });

    (0..size)
        .map(|rank| LocalCollective {
            rank,
            shared: Arc::clone(&shared),
        })
        .collect()
}

/// One participant of a group created by `local_group`.
///
/// Dropping a handle closes the group, the rounds still waiting on it fail with `GroupClosed`.
pub struct LocalCollective {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalCollective {
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns the amount of participants of the group.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Contributes `grads` to the current round and blocks until every rank has done so.
    ///
    /// # Arguments
    /// * `grads` - This rank's tensors, in the order every rank agreed on.
    ///
    /// # Returns
    /// The reduced tensors, identical for every rank.
    pub fn reduce(&self, grads: Vec<Gradient>) -> Result<Vec<Gradient>> {
        let compression = self.shared.compression;
        let grads = grads
            .into_iter()
            .map(|g| compression.apply_gradient(g))
            .collect();

        self.join(RoundKind::AllReduce, grads)
    }

    /// Replaces every rank's `tensors` with the ones of `root`, blocking until every rank has
    /// joined the round.
    ///
    /// # Arguments
    /// * `root` - The rank whose tensors are handed out, every rank must pass the same one.
    /// * `tensors` - This rank's tensors, only their amount and shapes matter off the root.
    ///
    /// # Returns
    /// A copy of the root's tensors.
    pub fn broadcast(&self, root: usize, tensors: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let tensors = tensors.into_iter().map(Gradient::Dense).collect();
        let received = self.join(RoundKind::Broadcast { root }, tensors)?;
        Ok(received.into_iter().map(Gradient::into_dense).collect())
    }

    fn join(&self, kind: RoundKind, contribution: Vec<Gradient>) -> Result<Vec<Gradient>> {
        let mut round = self.shared.round.lock();
        if round.closed {
            return Err(CollectiveErr::GroupClosed);
        }

        round.pending[self.rank] = Some((kind, contribution));
        round.arrived += 1;
        let generation = round.generation;

        if round.arrived == self.shared.size {
            let pending = round.pending.iter_mut().map(Option::take).collect();

            let outcome = self.complete(kind, pending);
            if let Err(e) = &outcome {
                warn!(rank = self.rank; "collective round failed: {e}");
            }

            round.outcome = Some(outcome);
            round.arrived = 0;
            round.generation += 1;
            debug!(generation = round.generation; "collective round completed");
            self.shared.done.notify_all();
        } else {
            while round.generation == generation && !round.closed {
                self.shared.done.wait(&mut round);
            }

            if round.generation == generation {
                return Err(CollectiveErr::GroupClosed);
            }
        }

        round.outcome.clone().unwrap_or(Err(CollectiveErr::GroupClosed))
    }

    /// Runs the round once every rank has contributed, as seen by the last one to arrive.
    fn complete(
        &self,
        kind: RoundKind,
        pending: Vec<Option<(RoundKind, Vec<Gradient>)>>,
    ) -> Result<Vec<Gradient>> {
        let mut contributions = Vec::with_capacity(pending.len());
        for (rank, contribution) in pending.into_iter().enumerate() {
            match contribution {
                Some((k, grads)) if k == kind => contributions.push(grads),
                Some(_) => return Err(CollectiveErr::MismatchedRound { rank }),
                None => return Err(CollectiveErr::GroupClosed),
            }
        }

        match kind {
            RoundKind::AllReduce => {
                reduction::reduce(contributions, self.shared.op, self.shared.compression)
            }
            RoundKind::Broadcast { root } if root >= contributions.len() => {
                Err(CollectiveErr::InvalidRoot {
                    root,
                    size: contributions.len(),
                })
            }
            RoundKind::Broadcast { root } => reduction::broadcast(contributions, root),
        }
    }
}

impl AllReduce for LocalCollective {
    fn all_reduce(
        &mut self,
        grads: Vec<Gradient>,
    ) -> aggregation::Result<Vec<Option<Gradient>>> {
        let reduced = self.reduce(grads).map_err(AggregationErr::from)?;
        Ok(reduced.into_iter().map(Some).collect())
    }
}

impl Drop for LocalCollective {
    fn drop(&mut self) {
        let mut round = self.shared.round.lock();
        round.closed = true;
        self.shared.done.notify_all();
    }
}
