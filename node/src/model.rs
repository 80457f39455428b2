use aggregation::{Gradient, Tensor};
use anyhow::Context;
use ndarray::{Array1, Array2, Ix1};
use rand::Rng;

/// Slot of the weight vector.
pub const WEIGHTS: usize = 0;
/// Slot of the bias.
pub const BIAS: usize = 1;
/// Slot of a frozen feature scale that never receives a gradient.
pub const FROZEN: usize = 2;

/// A linear model trained with the mean squared error.
///
/// It has three parameter slots, the last one is frozen so the gradient list always carries an
/// absent entry.
pub struct LinearModel {
    features: usize,
}

impl LinearModel {
    pub fn new(features: usize) -> Self {
        Self { features }
    }

    /// Returns the initial parameters, one tensor per slot, with small random weights.
    pub fn init_params<R: Rng>(&self, rng: &mut R) -> Vec<Tensor> {
        let weights: Array1<f32> =
            Array1::from_shape_fn(self.features, |_| rng.random_range(-0.1..0.1));

        vec![
            weights.into_dyn(),
            Array1::<f32>::zeros(1).into_dyn(),
            Array1::<f32>::ones(self.features).into_dyn(),
        ]
    }

    /// Computes the loss and the gradients of a batch.
    ///
    /// # Arguments
    /// * `params` - The current parameters.
    /// * `x` - The batch inputs, one row per sample.
    /// * `y` - The batch targets.
    ///
    /// # Returns
    /// The batch loss and one gradient per slot, absent for the frozen slot.
    pub fn gradients(
        &self,
        params: &[Tensor],
        x: &Array2<f32>,
        y: &Array1<f32>,
    ) -> anyhow::Result<(f32, Vec<Option<Gradient>>)> {
        let w = params[WEIGHTS]
            .view()
            .into_dimensionality::<Ix1>()
            .context("weights must be a vector")?;
        let b = params[BIAS].first().copied().context("missing bias")?;
        let n = y.len() as f32;

        let err = x.dot(&w) + b - y;
        let loss = err.mapv(|e| e * e).sum() / n;

        let dw = x.t().dot(&err) * (2. / n);
        let db = Array1::from_elem(1, err.sum() * 2. / n);

        let mut grads = vec![None; params.len()];
        grads[WEIGHTS] = Some(Gradient::Dense(dw.into_dyn()));
        grads[BIAS] = Some(Gradient::Dense(db.into_dyn()));

        Ok((loss, grads))
    }
}
