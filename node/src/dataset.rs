use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use anyhow::ensure;
use rand_distr::{Distribution, Normal};

/// A synthetic linear regression problem, `y = x · w + b + noise`.
pub struct Dataset {
    x: Array2<f32>,
    y: Array1<f32>,
}

impl Dataset {
    /// Samples a new `Dataset` with inputs uniformly drawn from `[-1, 1)`.
    ///
    /// # Arguments
    /// * `samples` - The amount of rows.
    /// * `weights` - The true weights of the problem.
    /// * `bias` - The true bias of the problem.
    /// * `noise` - The standard deviation of the gaussian noise added to every target.
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// A new `Dataset` or an error if `noise` is negative or not a number.
    pub fn synthetic<R: Rng>(
        samples: usize,
        weights: &Array1<f32>,
        bias: f32,
        noise: f32,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        ensure!(noise >= 0., "noise must be a non negative standard deviation, got {noise}");
        let normal = Normal::new(0., noise)?;
        let x: Array2<f32> =
            Array2::from_shape_fn((samples, weights.len()), |_| rng.random_range(-1.0..1.0));
        let mut y = x.dot(weights) + bias;
        y.mapv_inplace(|t| t + normal.sample(rng));

        Ok(Self { x, y })
    }

    fn len(&self) -> usize {
        self.y.len()
    }

    /// Draws `size` rows with replacement.
    pub fn batch<R: Rng>(&self, size: usize, rng: &mut R) -> (Array2<f32>, Array1<f32>) {
        let rows: Vec<usize> = (0..size).map(|_| rng.random_range(0..self.len())).collect();
        (self.x.select(Axis(0), &rows), self.y.select(Axis(0), &rows))
    }
}
