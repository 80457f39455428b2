use ndarray::Zip;

use super::{
    Optimizer,
    optimizer::{check_shapes, slot_state},
};
use crate::{Result, Tensor};

#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Vec<Option<Tensor>>,
    iterations: u64,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: Vec::new(),
            iterations: 0,
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_slot(&mut self, slot: usize, grad: &Tensor, params: &mut Tensor) -> Result<()> {
        check_shapes(slot, grad, params)?;

        let lr = self.learning_rate;
        let mu = self.momentum;
        let velocity = slot_state(&mut self.velocity, slot, params);

        Zip::from(params)
            .and(grad)
            .and(velocity)
            .par_for_each(|p, &g, v| {
                *v = (mu * *v) + g;
                *p -= lr * *v;
            });

        Ok(())
    }

    fn iterations(&self) -> u64 {
        self.iterations
    }

    fn increment_iterations(&mut self) {
        self.iterations += 1;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::*;
    use crate::{Gradient, optimization::GradientAggregation};

    #[test]
    fn test_velocity_builds_up_per_slot() {
        let mut opt = GradientDescentWithMomentum::new(1., 0.5);
        let mut params = vec![arr1(&[0.]).into_dyn(), arr1(&[0.]).into_dyn()];

        for _ in 0..2 {
            let grads = vec![Some(Gradient::from_slice(&[1.])), None];
            opt.apply_gradients(grads, &mut params, GradientAggregation::Skip)
                .unwrap();
        }

        // v1 = 1, v2 = 0.5 + 1
        assert_eq!(params[0], arr1(&[-2.5]).into_dyn());
        assert_eq!(params[1], arr1(&[0.]).into_dyn());
        assert_eq!(opt.iterations(), 2);
    }

    #[test]
    fn test_velocity_restarts_when_the_slot_is_resized() {
        let mut opt = GradientDescentWithMomentum::new(1., 0.5);
        let mut params = vec![arr1(&[0.]).into_dyn()];

        let grads = vec![Some(Gradient::from_slice(&[1.]))];
        opt.apply_gradients(grads, &mut params, GradientAggregation::Skip)
            .unwrap();
        assert_eq!(params[0], arr1(&[-1.]).into_dyn());

        params[0] = arr1(&[0., 0.]).into_dyn();
        opt.apply_gradients(
            vec![Some(Gradient::from_slice(&[1., 1.]))],
            &mut params,
            GradientAggregation::Skip,
        )
        .unwrap();

        assert_eq!(params[0], arr1(&[-1., -1.]).into_dyn());
    }
}
