use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire aggregation module.
pub type Result<T> = std::result::Result<T, AggregationErr>;

/// Boxed error returned by external collaborators, such as the collective reduce.
pub type BoxedErr = Box<dyn Error + Send + Sync + 'static>;

/// The aggregation module's error type.
#[derive(Debug)]
pub enum AggregationErr {
    UnsupportedSparseGradient {
        slot: usize,
    },
    InvalidSparseGradient(String),
    ShapeMismatch {
        slot: usize,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    AccumulationInvariantViolated {
        buffers: usize,
        absent: usize,
        positions: usize,
    },
    ReconstructionMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Poisoned,
    Reduce(BoxedErr),
    Optimizer(String),
}

impl AggregationErr {
    /// Wraps an arbitrary collaborator error as a reduce failure.
    ///
    /// # Arguments
    /// * `err` - The error returned by the collective reduce.
    pub fn reduce<E>(err: E) -> Self
    where
        E: Into<BoxedErr>,
    {
        Self::Reduce(err.into())
    }
}

impl Display for AggregationErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationErr::UnsupportedSparseGradient { slot } => write!(
                f,
                "slot {slot} produced a sparse gradient, sparse gradients can't be accumulated unless sparse_as_dense is set"
            ),
            AggregationErr::InvalidSparseGradient(reason) => {
                write!(f, "malformed sparse gradient: {reason}")
            }
            AggregationErr::ShapeMismatch {
                slot,
                got,
                expected,
            } => write!(
                f,
                "gradient shape mismatch at slot {slot}, got {got:?} and expected {expected:?}"
            ),
            AggregationErr::AccumulationInvariantViolated {
                buffers,
                absent,
                positions,
            } => write!(
                f,
                "accumulation invariant violated: {buffers} buffers and {absent} absent slots don't add up to {positions} positions"
            ),
            AggregationErr::ReconstructionMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "failed to rebuild the reduced gradients, {what} got {got} and expected {expected}"
            ),
            AggregationErr::Poisoned => {
                f.write_str("the accumulator is poisoned by a failed reduce, it must be reset")
            }
            AggregationErr::Reduce(e) => write!(f, "collective reduce failed: {e}"),
            AggregationErr::Optimizer(reason) => write!(f, "optimizer error: {reason}"),
        }
    }
}

impl Error for AggregationErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AggregationErr::Reduce(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
