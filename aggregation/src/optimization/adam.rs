use ndarray::Zip;

use super::{
    Optimizer,
    optimizer::{check_shapes, slot_state},
};
use crate::{Result, Tensor};

/// Adam, with its bias correction driven by the iteration counter.
///
/// Steps that skip the update still advance the counter, so the correction follows the global
/// step count and not the amount of applied updates.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    v: Vec<Option<Tensor>>,
    s: Vec<Option<Tensor>>,
    iterations: u64,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            v: Vec::new(),
            s: Vec::new(),
            iterations: 0,
        }
    }
}

impl Optimizer for Adam {
    fn update_slot(&mut self, slot: usize, grad: &Tensor, params: &mut Tensor) -> Result<()> {
        check_shapes(slot, grad, params)?;

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        let t = (self.iterations + 1).min(i32::MAX as u64) as i32;
        let bc1 = 1. - b1.powi(t);
        let bc2 = 1. - b2.powi(t);
        let step_size = lr * (bc2.sqrt() / bc1);

        let v = slot_state(&mut self.v, slot, params);
        let s = slot_state(&mut self.s, slot, params);

        Zip::from(params)
            .and(grad)
            .and(v)
            .and(s)
            .par_for_each(|p, &g, v, s| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
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
    fn test_first_step_moves_by_learning_rate() {
        let mut opt = Adam::new(0.1, 0.9, 0.999, 1e-8);
        let mut params = vec![arr1(&[1., 1.]).into_dyn()];
        let grads = vec![Some(Gradient::from_slice(&[4., -0.5]))];

        opt.apply_gradients(grads, &mut params, GradientAggregation::Skip)
            .unwrap();

        let p = &params[0];
        assert!((p[0] - 0.9).abs() < 1e-5, "got {}", p[0]);
        assert!((p[1] - 1.1).abs() < 1e-5, "got {}", p[1]);
    }

    #[test]
    fn test_skipped_iterations_change_bias_correction() {
        let grads = || vec![Some(Gradient::from_slice(&[1.]))];

        let mut fresh = Adam::new(0.1, 0.9, 0.999, 1e-8);
        let mut fresh_params = vec![arr1(&[0.]).into_dyn()];
        fresh
            .apply_gradients(grads(), &mut fresh_params, GradientAggregation::Skip)
            .unwrap();

        let mut lagged = Adam::new(0.1, 0.9, 0.999, 1e-8);
        let mut lagged_params = vec![arr1(&[0.]).into_dyn()];
        lagged.increment_iterations();
        lagged.increment_iterations();
        lagged
            .apply_gradients(grads(), &mut lagged_params, GradientAggregation::Skip)
            .unwrap();

        assert_eq!(lagged.iterations(), 3);
        assert_ne!(fresh_params[0], lagged_params[0]);
    }

    #[test]
    fn test_moments_restart_when_the_slot_is_resized() {
        let mut opt = Adam::new(0.1, 0.9, 0.999, 1e-8);
        let mut params = vec![arr1(&[0.]).into_dyn()];

        let grads = vec![Some(Gradient::from_slice(&[1.]))];
        opt.apply_gradients(grads, &mut params, GradientAggregation::Skip)
            .unwrap();

        params[0] = arr1(&[0., 0., 0.]).into_dyn();
        let grads = vec![Some(Gradient::from_slice(&[1., 1., 1.]))];
        opt.apply_gradients(grads, &mut params, GradientAggregation::Skip)
            .unwrap();

        assert_eq!(params[0].shape(), &[3]);
        assert!(params[0].iter().all(|&p| p < 0. && p.is_finite()));
    }
}
