use ndarray::{Array1, ArrayD, Axis, IxDyn};

use crate::{AggregationErr, Result};

/// A dense gradient or parameter tensor.
pub type Tensor = ArrayD<f32>;

/// A gradient stored as a set of rows of a dense tensor.
///
/// Row `indices[k]` of the dense tensor is `values[k]`, rows that aren't listed are zero and
/// repeated indices add up.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseGradient {
    indices: Vec<usize>,
    values: Tensor,
    dense_shape: Vec<usize>,
}

impl SparseGradient {
    /// Creates a new `SparseGradient`.
    ///
    /// # Arguments
    /// * `indices` - The row of the dense tensor each value row belongs to.
    /// * `values` - The value rows, its first dimension must be as long as `indices`.
    /// * `dense_shape` - The shape of the dense tensor this gradient represents.
    ///
    /// # Returns
    /// A new `SparseGradient` or an `InvalidSparseGradient` error if the parts don't agree.
    pub fn new(indices: Vec<usize>, values: Tensor, dense_shape: Vec<usize>) -> Result<Self> {
        let Some((&rows, row_shape)) = dense_shape.split_first() else {
            return Err(AggregationErr::InvalidSparseGradient(
                "the dense shape has no dimensions".into(),
            ));
        };

        if values.ndim() != dense_shape.len()
            || values.shape()[0] != indices.len()
            || &values.shape()[1..] != row_shape
        {
            return Err(AggregationErr::InvalidSparseGradient(format!(
                "values of shape {:?} can't hold {} rows of a {dense_shape:?} tensor",
                values.shape(),
                indices.len()
            )));
        }

        if let Some(&idx) = indices.iter().find(|&&idx| idx >= rows) {
            return Err(AggregationErr::InvalidSparseGradient(format!(
                "row {idx} is out of bounds for {rows} rows"
            )));
        }

        Ok(Self {
            indices,
            values,
            dense_shape,
        })
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn dense_shape(&self) -> &[usize] {
        &self.dense_shape
    }

    /// Scatters the rows into a zeroed dense tensor, adding up repeated rows.
    pub fn to_dense(&self) -> Tensor {
        let mut dense = Tensor::zeros(IxDyn(&self.dense_shape));

        for (&idx, row) in self.indices.iter().zip(self.values.outer_iter()) {
            let mut dst = dense.index_axis_mut(Axis(0), idx);
            dst += &row;
        }

        dense
    }

    /// Applies `f` to every value, keeping the indices untouched.
    pub fn map_values<F>(mut self, f: F) -> Self
    where
        F: Fn(f32) -> f32,
    {
        self.values.mapv_inplace(f);
        self
    }
}

/// A gradient for a single parameter slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Gradient {
    Dense(Tensor),
    Sparse(SparseGradient),
}

impl Gradient {
    /// Builds a one dimensional dense gradient out of `values`.
    pub fn from_slice(values: &[f32]) -> Self {
        Self::Dense(Array1::from(values.to_vec()).into_dyn())
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }

    /// Returns the shape of the dense tensor this gradient represents.
    pub fn shape(&self) -> &[usize] {
        match self {
            Gradient::Dense(t) => t.shape(),
            Gradient::Sparse(s) => s.dense_shape(),
        }
    }

    /// Converts this gradient into a dense tensor, scattering it if it's sparse.
    pub fn into_dense(self) -> Tensor {
        match self {
            Gradient::Dense(t) => t,
            Gradient::Sparse(s) => s.to_dense(),
        }
    }
}

impl From<Tensor> for Gradient {
    fn from(value: Tensor) -> Self {
        Self::Dense(value)
    }
}

impl From<SparseGradient> for Gradient {
    fn from(value: SparseGradient) -> Self {
        Self::Sparse(value)
    }
}
