use std::cell::RefCell;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    Accumulator, AggregationConfig, AllReduce, ApplyGate, Gradient, Result, Tensor,
    optimization::{GradientAggregation, Optimizer},
};

/// How the wrapped optimizer expects the synchronized gradients to be handed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyConvention {
    /// The optimizer aggregates the gradients inside its own update.
    #[default]
    Legacy,
    /// The gradients are aggregated outside of the update, which then must skip its own
    /// aggregation.
    External,
}

/// Wraps an optimizer so it only updates the parameters once every `aggregation_frequency`
/// steps, with gradients reduced across every worker.
pub struct DistributedOptimizer<O, R> {
    accumulator: Accumulator,
    gate: ApplyGate,
    optimizer: O,
    reducer: R,
    convention: ApplyConvention,
}

impl<O, R> DistributedOptimizer<O, R>
where
    O: Optimizer,
    R: AllReduce,
{
    /// Creates a new `DistributedOptimizer`.
    ///
    /// # Arguments
    /// * `config` - The local aggregation settings.
    /// * `optimizer` - The optimizer applying the synchronized gradients.
    /// * `reducer` - The collective reduction shared with the other workers.
    /// * `convention` - How `optimizer` expects the gradients.
    ///
    /// # Returns
    /// A new `DistributedOptimizer` instance.
    pub fn new(
        config: AggregationConfig,
        optimizer: O,
        reducer: R,
        convention: ApplyConvention,
    ) -> Self {
        Self {
            accumulator: Accumulator::new(config),
            gate: ApplyGate::new(),
            optimizer,
            reducer,
            convention,
        }
    }

    /// Runs one training step: accumulates `grads` and, on a synchronization boundary,
    /// applies the reduced gradients onto `params`.
    ///
    /// # Arguments
    /// * `grads` - The local gradients of this step, one per parameter slot.
    /// * `params` - The model parameters, one tensor per slot.
    ///
    /// # Returns
    /// Whether the parameters were updated.
    pub fn step(&mut self, grads: Vec<Option<Gradient>>, params: &mut [Tensor]) -> Result<bool> {
        let aggregated = self.accumulator.accumulate(grads, &mut self.reducer)?;
        let synced = aggregated.synced();
        let convention = self.convention;
        let optimizer = RefCell::new(&mut self.optimizer);

        self.gate.maybe_apply(
            synced,
            || {
                let mut optimizer = optimizer.borrow_mut();
                let grads = aggregated.into_grads();

                match convention {
                    ApplyConvention::Legacy => {
                        optimizer.apply_gradients(grads, params, GradientAggregation::Internal)
                    }
                    ApplyConvention::External => {
                        let grads = optimizer.aggregate_gradients(grads);
                        optimizer.apply_gradients(grads, params, GradientAggregation::Skip)
                    }
                }
            },
            || {
                optimizer.borrow_mut().increment_iterations();
                Ok(())
            },
        )?;

        debug!(synced = synced, iterations = self.optimizer.iterations(); "optimizer step");
        Ok(synced)
    }

    /// Clears the accumulated gradients, recovering from a failed reduce.
    pub fn reset(&mut self) {
        self.accumulator.reset();
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub fn gate(&self) -> &ApplyGate {
        &self.gate
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn convention(&self) -> ApplyConvention {
        self.convention
    }
}
