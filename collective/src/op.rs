use aggregation::{Gradient, Tensor};
use half::f16;
use serde::{Deserialize, Serialize};

/// How the contributions of every rank are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    /// The sum divided by the size of the group.
    #[default]
    Average,
}

impl ReduceOp {
    /// Returns what the summed contributions are divided by.
    pub(crate) fn divisor(&self, size: usize) -> f32 {
        match self {
            ReduceOp::Sum => 1.,
            ReduceOp::Average => size as f32,
        }
    }
}

/// The precision tensors travel with between ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    /// Tensors are rounded to half precision on the way in and out of a round.
    Fp16,
}

impl Compression {
    /// Rounds `tensor` to the precision it would have on the wire.
    pub fn apply(&self, tensor: Tensor) -> Tensor {
        match self {
            Compression::None => tensor,
            Compression::Fp16 => tensor.mapv_into(round_to_half),
        }
    }

    /// Rounds every value of `grad`, dense or sparse, to the wire precision.
    pub fn apply_gradient(&self, grad: Gradient) -> Gradient {
        match (self, grad) {
            (Compression::None, grad) => grad,
            (Compression::Fp16, Gradient::Dense(t)) => Gradient::Dense(self.apply(t)),
            (Compression::Fp16, Gradient::Sparse(s)) => {
                Gradient::Sparse(s.map_values(round_to_half))
            }
        }
    }
}

fn round_to_half(x: f32) -> f32 {
    f16::from_f32(x).to_f32()
}
