use ndarray::Zip;

use super::{Optimizer, optimizer::check_shapes};
use crate::{Result, Tensor};

#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
    iterations: u64,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    ///
    /// # Returns
    /// A new `GradientDescent` instance.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            iterations: 0,
        }
    }
}

impl Optimizer for GradientDescent {
    fn update_slot(&mut self, slot: usize, grad: &Tensor, params: &mut Tensor) -> Result<()> {
        check_shapes(slot, grad, params)?;

        let lr = self.learning_rate;

        Zip::from(params)
            .and(grad)
            .par_for_each(|p, &g| *p -= lr * g);

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
    use crate::{AggregationErr, Gradient, optimization::GradientAggregation};

    #[test]
    fn test_step_against_the_gradient() {
        let mut opt = GradientDescent::new(0.5);
        let mut params = vec![arr1(&[1., 2.]).into_dyn(), arr1(&[3.]).into_dyn()];
        let grads = vec![Some(Gradient::from_slice(&[2., -2.])), None];

        opt.apply_gradients(grads, &mut params, GradientAggregation::Skip)
            .unwrap();

        assert_eq!(params[0], arr1(&[0., 3.]).into_dyn());
        assert_eq!(params[1], arr1(&[3.]).into_dyn());
        assert_eq!(opt.iterations(), 1);
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let mut opt = GradientDescent::new(0.5);
        let mut params = vec![arr1(&[1., 2.]).into_dyn()];
        let grads = vec![Some(Gradient::from_slice(&[1.]))];

        let err = opt
            .apply_gradients(grads, &mut params, GradientAggregation::Skip)
            .unwrap_err();
        assert!(matches!(err, AggregationErr::ShapeMismatch { slot: 0, .. }));
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let mut opt = GradientDescent::new(0.5);
        let mut params = vec![arr1(&[1.]).into_dyn()];

        let err = opt
            .apply_gradients(vec![], &mut params, GradientAggregation::Skip)
            .unwrap_err();
        assert!(matches!(err, AggregationErr::Optimizer(_)));
        assert_eq!(opt.iterations(), 0);
    }
}
