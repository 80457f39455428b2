use log::{debug, trace, warn};

use crate::{AggregationConfig, AggregationErr, AllReduce, Gradient, Result, Tensor};

/// How a parameter slot has been classified since the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// The slot hasn't been part of any call yet.
    Unseen,
    /// The slot produced a gradient, it owns the buffer at this index.
    Buffered(usize),
    /// The slot was first seen without a gradient, it must never produce one.
    AbsentOnly,
}

/// The outcome of a single `Accumulator::accumulate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregated {
    synced: bool,
    grads: Vec<Option<Gradient>>,
}

impl Aggregated {
    /// Whether this step reached a synchronization boundary.
    ///
    /// When it's `false` the gradients are only the running local sums and must not be
    /// applied to the parameters.
    pub fn synced(&self) -> bool {
        self.synced
    }

    /// One entry per input position, absent where the slot has no gradient.
    pub fn grads(&self) -> &[Option<Gradient>] {
        &self.grads
    }

    pub fn into_grads(self) -> Vec<Option<Gradient>> {
        self.grads
    }
}

/// What a single input position does to the accumulator state, decided before mutating it.
enum SlotAction {
    Skip,
    MarkAbsent,
    Allocate(Tensor),
    Add(usize, Tensor),
}

/// Accumulates local gradients for `aggregation_frequency` steps before reducing them
/// across every worker.
///
/// Each slot that ever produced a gradient owns a buffer for the rest of the run, buffers
/// are zeroed after every synchronization but never deallocated.
#[derive(Debug)]
pub struct Accumulator {
    config: AggregationConfig,
    slots: Vec<SlotState>,
    buffers: Vec<Tensor>,
    absent: usize,
    step: usize,
    poisoned: bool,
}

impl Accumulator {
    /// Creates a new `Accumulator` with no buffers and its step counter at zero.
    ///
    /// # Arguments
    /// * `config` - The aggregation settings for the whole run.
    pub fn new(config: AggregationConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            buffers: Vec::new(),
            absent: 0,
            step: 0,
            poisoned: false,
        }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Returns the amount of local steps accumulated since the last synchronization.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Returns the accumulation buffers in allocation order.
    pub fn buffers(&self) -> &[Tensor] {
        &self.buffers
    }

    /// Returns the accumulation buffer owned by `slot`, if any.
    pub fn buffer(&self, slot: usize) -> Option<&Tensor> {
        match self.slot_state(slot) {
            SlotState::Buffered(idx) => self.buffers.get(idx),
            _ => None,
        }
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots.get(slot).copied().unwrap_or(SlotState::Unseen)
    }

    /// Returns the amount of slots that have never produced a gradient.
    pub fn absent_slots(&self) -> usize {
        self.absent
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Zeroes every buffer and the step counter, clearing a poisoned state.
    ///
    /// Slot classification and buffer allocations are kept.
    pub fn reset(&mut self) {
        self.step = 0;
        self.poisoned = false;
        self.buffers.iter_mut().for_each(|buf| buf.fill(0.));
    }

    /// Adds one step of local gradients into the buffers, reducing them across workers when
    /// the synchronization boundary is reached.
    ///
    /// The call is validated as a whole before any buffer is touched, so a failing call leaves
    /// the state as it was.
    ///
    /// # Arguments
    /// * `grads` - One entry per parameter slot, absent for slots without a gradient this step.
    /// * `reducer` - The collective reduction, only invoked at a synchronization boundary.
    ///
    /// # Returns
    /// The reduced gradients on a synchronization step, the provisional local sums otherwise.
    ///
    /// # Errors
    /// * `UnsupportedSparseGradient` if a sparse gradient arrives without `sparse_as_dense`.
    /// * `ShapeMismatch` if a gradient doesn't match the shape of its slot's buffer.
    /// * `AccumulationInvariantViolated` if the gradient presence pattern contradicts the
    ///   previous calls.
    /// * `ReconstructionMismatch` or `Reduce` if the reduction fails, which poisons the accumulator.
    pub fn accumulate<R>(
        &mut self,
        grads: Vec<Option<Gradient>>,
        reducer: &mut R,
    ) -> Result<Aggregated>
    where
        R: AllReduce + ?Sized,
    {
        if self.poisoned {
            return Err(AggregationErr::Poisoned);
        }

        let positions = grads.len();
        let actions = self.plan(grads)?;
        self.check_invariant(&actions, positions)?;

        let boundary = self.step + 1 == self.config.aggregation_frequency();
        let mut provisional = vec![None; positions];

        for (slot, action) in actions.into_iter().enumerate() {
            if slot == self.slots.len() {
                self.slots.push(SlotState::Unseen);
            }

            let idx = match action {
                SlotAction::Skip => continue,
                SlotAction::MarkAbsent => {
                    self.slots[slot] = SlotState::AbsentOnly;
                    self.absent += 1;
                    continue;
                }
                SlotAction::Allocate(grad) => {
                    let idx = self.buffers.len();
                    trace!(slot = slot, buffer = idx; "allocating accumulation buffer");

                    let mut buf = Tensor::zeros(grad.raw_dim());
                    buf += &grad;
                    self.buffers.push(buf);
                    self.slots[slot] = SlotState::Buffered(idx);
                    idx
                }
                SlotAction::Add(idx, grad) => {
                    self.buffers[idx] += &grad;
                    idx
                }
            };

            if !boundary {
                provisional[slot] = Some(Gradient::Dense(self.buffers[idx].clone()));
            }
        }

        self.step += 1;
        debug!(
            step = self.step,
            frequency = self.config.aggregation_frequency();
            "accumulated local gradients"
        );

        if !boundary {
            return Ok(Aggregated {
                synced: false,
                grads: provisional,
            });
        }

        match self.synchronize(reducer, positions) {
            Ok(grads) => Ok(Aggregated { synced: true, grads }),
            Err(e) => {
                warn!("synchronization failed, poisoning the accumulator: {e}");
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Validates every input position and decides what it does to the state.
    fn plan(&self, grads: Vec<Option<Gradient>>) -> Result<Vec<SlotAction>> {
        grads
            .into_iter()
            .enumerate()
            .map(|(slot, grad)| {
                let grad = match grad {
                    None => None,
                    Some(Gradient::Dense(t)) => Some(t),
                    Some(Gradient::Sparse(s)) if self.config.sparse_as_dense() => Some(s.to_dense()),
                    Some(Gradient::Sparse(_)) => {
                        warn!(slot = slot; "rejecting sparse gradient");
                        return Err(AggregationErr::UnsupportedSparseGradient { slot });
                    }
                };

                let action = match (self.slot_state(slot), grad) {
                    (SlotState::Unseen, None) => SlotAction::MarkAbsent,
                    (SlotState::Unseen | SlotState::AbsentOnly, Some(grad)) => {
                        SlotAction::Allocate(grad)
                    }
                    (SlotState::Buffered(idx), Some(grad)) => {
                        let expected = self.buffers[idx].shape();
                        if grad.shape() != expected {
                            return Err(AggregationErr::ShapeMismatch {
                                slot,
                                got: grad.shape().to_vec(),
                                expected: expected.to_vec(),
                            });
                        }
                        SlotAction::Add(idx, grad)
                    }
                    (SlotState::Buffered(_) | SlotState::AbsentOnly, None) => SlotAction::Skip,
                };

                Ok(action)
            })
            .collect()
    }

    /// Checks that allocated buffers plus absent-only slots account for every position once
    /// `actions` are applied.
    fn check_invariant(&self, actions: &[SlotAction], positions: usize) -> Result<()> {
        let (allocated, marked) =
            actions
                .iter()
                .fold((0, 0), |(allocated, marked), action| match action {
                    SlotAction::Allocate(_) => (allocated + 1, marked),
                    SlotAction::MarkAbsent => (allocated, marked + 1),
                    _ => (allocated, marked),
                });

        let buffers = self.buffers.len() + allocated;
        let absent = self.absent + marked;

        if buffers + absent != positions {
            warn!(
                buffers = buffers, absent = absent, positions = positions;
                "inconsistent gradient presence across steps"
            );
            return Err(AggregationErr::AccumulationInvariantViolated {
                buffers,
                absent,
                positions,
            });
        }

        Ok(())
    }

    /// Reduces the buffers, scales the result and rebuilds one entry per position, then
    /// clears the buffers for the next round.
    fn synchronize<R>(&mut self, reducer: &mut R, positions: usize) -> Result<Vec<Option<Gradient>>>
    where
        R: AllReduce + ?Sized,
    {
        let frequency = self.config.aggregation_frequency();
        debug!(buffers = self.buffers.len(); "synchronization boundary reached");

        let local = self.buffers.iter().cloned().map(Gradient::Dense).collect();
        let mut reduced = reducer.all_reduce(local)?;

        if reduced.len() != self.buffers.len() {
            return Err(AggregationErr::ReconstructionMismatch {
                what: "reduced gradients",
                got: reduced.len(),
                expected: self.buffers.len(),
            });
        }

        if frequency > 1 {
            let divisor = self.config.gradient_divisor();
            for grad in reduced.iter_mut() {
                if let Some(Gradient::Dense(t)) = grad {
                    t.mapv_inplace(|g| g / divisor);
                }
            }
        }

        let mut restored = 0;
        let grads: Vec<_> = self.slots[..positions]
            .iter()
            .map(|state| match *state {
                SlotState::Buffered(idx) => {
                    restored += 1;
                    reduced[idx].take()
                }
                _ => None,
            })
            .collect();

        if restored != self.buffers.len() {
            return Err(AggregationErr::ReconstructionMismatch {
                what: "buffered slots",
                got: restored,
                expected: self.buffers.len(),
            });
        }

        if grads.len() != positions {
            return Err(AggregationErr::ReconstructionMismatch {
                what: "output positions",
                got: grads.len(),
                expected: positions,
            });
        }

        self.step = 0;
        self.buffers.iter_mut().for_each(|buf| buf.fill(0.));
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use ndarray::{arr1, arr2};

    use super::*;
    use crate::{Identity, SparseGradient};

    fn accumulator(frequency: usize, average: bool, sparse_as_dense: bool) -> Accumulator {
        let frequency = NonZeroUsize::new(frequency).unwrap();
        Accumulator::new(AggregationConfig::new(frequency, average, sparse_as_dense))
    }

    fn dense(values: &[f32]) -> Option<Gradient> {
        Some(Gradient::from_slice(values))
    }

    fn sparse_row() -> Option<Gradient> {
        let values = arr2(&[[1., 2.]]).into_dyn();
        Some(SparseGradient::new(vec![1], values, vec![2, 2]).unwrap().into())
    }

    #[test]
    fn test_single_step_frequency_reduces_unscaled() {
        let mut acc = accumulator(1, true, false);

        for i in 1..=3 {
            let g = i as f32;
            let out = acc.accumulate(vec![dense(&[g, 2. * g])], &mut Identity).unwrap();

            assert!(out.synced());
            assert_eq!(out.grads(), &[dense(&[g, 2. * g])]);
            assert_eq!(acc.step(), 0);
        }
    }

    #[test]
    fn test_end_to_end_average() {
        let mut acc = accumulator(3, true, false);
        let steps = [[1., 10.], [2., 20.], [3., 30.]];

        for g in &steps[..2] {
            let out = acc.accumulate(vec![dense(&[g[0]]), dense(&[g[1]])], &mut Identity).unwrap();
            assert!(!out.synced());
        }

        let g = steps[2];
        let out = acc.accumulate(vec![dense(&[g[0]]), dense(&[g[1]])], &mut Identity).unwrap();

        assert!(out.synced());
        assert_eq!(out.grads(), &[dense(&[2.]), dense(&[20.])]);
        assert_eq!(acc.buffers(), &[arr1(&[0.]).into_dyn(), arr1(&[0.]).into_dyn()]);
        assert_eq!(acc.step(), 0);
    }

    #[test]
    fn test_no_average_leaves_sum_unscaled() {
        let mut acc = accumulator(2, false, false);

        acc.accumulate(vec![dense(&[1.5])], &mut Identity).unwrap();
        let out = acc.accumulate(vec![dense(&[2.5])], &mut Identity).unwrap();

        assert_eq!(out.grads(), &[dense(&[4.])]);
    }

    #[test]
    fn test_reduce_receives_exact_sum() {
        let mut acc = accumulator(3, true, false);
        let inputs = [0.1f32, 0.2, 0.7];
        let mut seen = Vec::new();

        let mut reducer = |grads: Vec<Gradient>| -> Result<Vec<Option<Gradient>>> {
            seen = grads.clone();
            Ok(grads.into_iter().map(Some).collect())
        };

        for g in inputs {
            acc.accumulate(vec![dense(&[g])], &mut reducer).unwrap();
        }

        let expected = 0.0f32 + 0.1 + 0.2 + 0.7;
        assert_eq!(seen, vec![Gradient::from_slice(&[expected])]);
    }

    #[test]
    fn test_provisional_output_is_the_running_sum() {
        let mut acc = accumulator(3, true, false);

        let out = acc.accumulate(vec![dense(&[1.]), None], &mut Identity).unwrap();
        assert_eq!(out.grads(), &[dense(&[1.]), None]);

        let out = acc.accumulate(vec![dense(&[2.]), None], &mut Identity).unwrap();
        assert!(!out.synced());
        assert_eq!(out.grads(), &[dense(&[3.]), None]);
    }

    #[test]
    fn test_absent_slots_are_never_buffered_or_reduced() {
        let mut acc = accumulator(2, true, false);
        let mut reduced_lens = Vec::new();

        let mut reducer = |grads: Vec<Gradient>| -> Result<Vec<Option<Gradient>>> {
            reduced_lens.push(grads.len());
            Ok(grads.into_iter().map(Some).collect())
        };

        for _ in 0..4 {
            let out = acc
                .accumulate(vec![None, dense(&[2.]), None, dense(&[4.])], &mut reducer)
                .unwrap();

            if out.synced() {
                assert_eq!(out.grads(), &[None, dense(&[2.]), None, dense(&[4.])]);
            }
        }

        assert_eq!(reduced_lens, vec![2, 2]);
        assert_eq!(acc.buffers().len(), 2);
        assert_eq!(acc.absent_slots(), 2);
        assert_eq!(acc.slot_state(0), SlotState::AbsentOnly);
        assert_eq!(acc.slot_state(3), SlotState::Buffered(1));
        assert_eq!(acc.buffer(0), None);
    }

    #[test]
    fn test_absent_then_present_violates_invariant() {
        let mut acc = accumulator(3, true, false);
        acc.accumulate(vec![dense(&[1.]), None], &mut Identity).unwrap();

        let err = acc
            .accumulate(vec![dense(&[1.]), dense(&[1.])], &mut Identity)
            .unwrap_err();

        assert!(matches!(
            err,
            AggregationErr::AccumulationInvariantViolated {
                buffers: 2,
                absent: 1,
                positions: 2
            }
        ));
        assert_eq!(acc.step(), 1);
        assert_eq!(acc.buffers().len(), 1);
    }

    #[test]
    fn test_buffered_slot_keeps_contributing_when_absent() {
        let mut acc = accumulator(2, true, false);

        acc.accumulate(vec![dense(&[4.])], &mut Identity).unwrap();
        let out = acc.accumulate(vec![None], &mut Identity).unwrap();

        assert!(out.synced());
        assert_eq!(out.grads(), &[dense(&[2.])]);
    }

    #[test]
    fn test_fewer_positions_violates_invariant() {
        let mut acc = accumulator(2, true, false);
        acc.accumulate(vec![dense(&[1.]), dense(&[1.])], &mut Identity).unwrap();

        let err = acc.accumulate(vec![dense(&[1.])], &mut Identity).unwrap_err();
        assert!(matches!(err, AggregationErr::AccumulationInvariantViolated { .. }));
    }

    #[test]
    fn test_sparse_rejected_on_first_sight() {
        for frequency in [1, 4] {
            let mut acc = accumulator(frequency, true, false);

            let err = acc
                .accumulate(vec![dense(&[1.]), sparse_row()], &mut Identity)
                .unwrap_err();

            assert!(matches!(err, AggregationErr::UnsupportedSparseGradient { slot: 1 }));
            assert_eq!(acc.step(), 0);
            assert!(acc.buffers().is_empty());
        }
    }

    #[test]
    fn test_sparse_as_dense_accumulates_densified() {
        let mut acc = accumulator(2, false, true);

        acc.accumulate(vec![sparse_row()], &mut Identity).unwrap();
        let out = acc.accumulate(vec![sparse_row()], &mut Identity).unwrap();

        let expected = arr2(&[[0., 0.], [2., 4.]]).into_dyn();
        assert_eq!(out.grads(), &[Some(Gradient::Dense(expected))]);
    }

    #[test]
    fn test_shape_change_is_rejected() {
        let mut acc = accumulator(2, true, false);
        acc.accumulate(vec![dense(&[1., 2.])], &mut Identity).unwrap();

        let err = acc.accumulate(vec![dense(&[1.])], &mut Identity).unwrap_err();
        assert!(matches!(err, AggregationErr::ShapeMismatch { slot: 0, .. }));
    }

    #[test]
    fn test_sparse_reduced_values_pass_through_unscaled() {
        let mut acc = accumulator(2, true, false);
        let gathered = sparse_row();
        let returned = gathered.clone();

        let mut reducer = move |_: Vec<Gradient>| -> Result<Vec<Option<Gradient>>> {
            Ok(vec![returned.clone(), None])
        };

        acc.accumulate(vec![dense(&[1.]), dense(&[1.])], &mut reducer).unwrap();
        let out = acc.accumulate(vec![dense(&[1.]), dense(&[1.])], &mut reducer).unwrap();

        assert_eq!(out.grads(), &[gathered, None]);
    }

    #[test]
    fn test_wrong_reduced_length_poisons() {
        let mut acc = accumulator(1, true, false);
        let mut reducer = |_: Vec<Gradient>| -> Result<Vec<Option<Gradient>>> { Ok(vec![]) };

        let err = acc.accumulate(vec![dense(&[1.])], &mut reducer).unwrap_err();
        assert!(matches!(err, AggregationErr::ReconstructionMismatch { .. }));
        assert!(acc.is_poisoned());

        let err = acc.accumulate(vec![dense(&[1.])], &mut Identity).unwrap_err();
        assert!(matches!(err, AggregationErr::Poisoned));
    }

    #[test]
    fn test_reset_recovers_from_failed_reduce() {
        let mut acc = accumulator(2, true, false);
        let mut failing = |_: Vec<Gradient>| -> Result<Vec<Option<Gradient>>> {
            Err(AggregationErr::reduce("peer went away"))
        };

        acc.accumulate(vec![dense(&[1.])], &mut failing).unwrap();
        let err = acc.accumulate(vec![dense(&[1.])], &mut failing).unwrap_err();
        assert!(matches!(err, AggregationErr::Reduce(_)));

        acc.reset();
        assert!(!acc.is_poisoned());
        assert_eq!(acc.buffer(0), Some(&arr1(&[0.]).into_dyn()));

        acc.accumulate(vec![dense(&[3.])], &mut Identity).unwrap();
        let out = acc.accumulate(vec![dense(&[5.])], &mut Identity).unwrap();
        assert_eq!(out.grads(), &[dense(&[4.])]);
    }
}
