use crate::{AggregationErr, Gradient, Result, Tensor};

/// Whether `Optimizer::apply_gradients` aggregates the gradients itself before updating.
///
/// Callers that already aggregated the gradients outside of the optimizer must pass `Skip`,
/// otherwise they would be aggregated twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientAggregation {
    Internal,
    Skip,
}

/// Defines the strategy for updating model parameters based on the synchronized gradients.
pub trait Optimizer {
    /// Updates a single parameter slot using its gradient.
    ///
    /// # Arguments
    /// * `slot` - The index of the parameter, used to find its optimizer state.
    /// * `grad` - The slot's dense gradient.
    /// * `params` - The slot's parameters to update.
    ///
    /// # Returns
    /// An error if the shapes of `grad` and `params` differ.
    fn update_slot(&mut self, slot: usize, grad: &Tensor, params: &mut Tensor) -> Result<()>;

    /// Returns the amount of iterations this optimizer has gone through, including the ones
    /// that didn't update any parameter.
    fn iterations(&self) -> u64;

    /// Advances the iteration counter without touching any parameter.
    fn increment_iterations(&mut self);

    /// Aggregates the gradients before they are applied. Does nothing by default.
    ///
    /// # Arguments
    /// * `grads` - One gradient per parameter slot.
    fn aggregate_gradients(&mut self, grads: Vec<Option<Gradient>>) -> Vec<Option<Gradient>> {
        grads
    }

    /// Applies the gradients onto the parameters and advances the iteration counter.
    ///
    /// Slots without a gradient are left untouched, sparse gradients are densified.
    ///
    /// # Arguments
    /// * `grads` - One gradient per parameter slot.
    /// * `params` - The parameters of the model, one tensor per slot.
    /// * `aggregation` - Whether to call `aggregate_gradients` first.
    ///
    /// # Returns
    /// An error if `grads` and `params` don't have the same length or their shapes differ.
    fn apply_gradients(
        &mut self,
        grads: Vec<Option<Gradient>>,
        params: &mut [Tensor],
        aggregation: GradientAggregation,
    ) -> Result<()> {
        if grads.len() != params.len() {
            return Err(AggregationErr::Optimizer(format!(
                "got {} gradients for {} parameters",
                grads.len(),
                params.len()
            )));
        }

        let grads = match aggregation {
            GradientAggregation::Internal => self.aggregate_gradients(grads),
            GradientAggregation::Skip => grads,
        };

        for (slot, (grad, param)) in grads.into_iter().zip(params.iter_mut()).enumerate() {
            if let Some(grad) = grad {
                self.update_slot(slot, &grad.into_dense(), param)?;
            }
        }

        self.increment_iterations();
        Ok(())
    }
}

impl<T: Optimizer + ?Sized> Optimizer for Box<T> {
    fn update_slot(&mut self, slot: usize, grad: &Tensor, params: &mut Tensor) -> Result<()> {
        (**self).update_slot(slot, grad, params)
    }

    fn iterations(&self) -> u64 {
        (**self).iterations()
    }

    fn increment_iterations(&mut self) {
        (**self).increment_iterations()
    }

    fn aggregate_gradients(&mut self, grads: Vec<Option<Gradient>>) -> Vec<Option<Gradient>> {
        (**self).aggregate_gradients(grads)
    }

    fn apply_gradients(
        &mut self,
        grads: Vec<Option<Gradient>>,
        params: &mut [Tensor],
        aggregation: GradientAggregation,
    ) -> Result<()> {
        (**self).apply_gradients(grads, params, aggregation)
    }
}

/// Checks that a gradient can be applied onto a slot's parameters.
pub(super) fn check_shapes(slot: usize, grad: &Tensor, params: &Tensor) -> Result<()> {
    if grad.shape() != params.shape() {
        return Err(AggregationErr::ShapeMismatch {
            slot,
            got: grad.shape().to_vec(),
            expected: params.shape().to_vec(),
        });
    }

    Ok(())
}

/// Returns the per slot optimizer state, allocating it zeroed like `params` on first use.
///
/// The state starts over from zero if `params` no longer has the shape it was allocated for.
pub(super) fn slot_state<'a>(
    states: &'a mut Vec<Option<Tensor>>,
    slot: usize,
    params: &Tensor,
) -> &'a mut Tensor {
    if states.len() <= slot {
        states.resize(slot + 1, None);
    }

    let state = states[slot].get_or_insert_with(|| Tensor::zeros(params.raw_dim()));
    if state.shape() != params.shape() {
        *state = Tensor::zeros(params.raw_dim());
    }

    state
}
