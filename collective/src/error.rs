use std::{
    error::Error,
    fmt::{self, Display},
};

use aggregation::AggregationErr;

/// The result type used in the entire collective module.
pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// Failures of a collective round, every participant of the round gets the same error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectiveErr {
    Desync {
        rank: usize,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        rank: usize,
        position: usize,
    },
    MixedFormats {
        position: usize,
    },
    MismatchedRound {
        rank: usize,
    },
    InvalidRoot {
        root: usize,
        size: usize,
    },
    GroupClosed,
}

impl Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveErr::Desync {
                rank,
                got,
                expected,
            } => write!(
                f,
                "participants are out of sync, rank {rank} contributed {got} tensors and expected {expected}"
            ),
            CollectiveErr::ShapeMismatch { rank, position } => write!(
                f,
                "rank {rank} contributed a tensor with a different shape at position {position}"
            ),
            CollectiveErr::MixedFormats { position } => {
                write!(f, "dense and sparse tensors were mixed at position {position}")
            }
            CollectiveErr::MismatchedRound { rank } => write!(
                f,
                "rank {rank} joined a round of a different kind than the other participants"
            ),
            CollectiveErr::InvalidRoot { root, size } => {
                write!(f, "root rank {root} is out of bounds for a group of {size}")
            }
            CollectiveErr::GroupClosed => {
                f.write_str("a participant left the group before the round completed")
            }
        }
    }
}

impl Error for CollectiveErr {}

impl From<CollectiveErr> for AggregationErr {
    fn from(value: CollectiveErr) -> Self {
        AggregationErr::reduce(value)
    }
}
