//! Local gradient aggregation for data parallel training.
//!
//! Workers accumulate their gradients for `aggregation_frequency` steps before reducing them
//! across every participant, and only then let the optimizer update the parameters.

mod accumulator;
mod config;
mod distributed;
mod error;
mod gate;
pub mod optimization;
mod reduce;
mod tensor;

pub use accumulator::{Accumulator, Aggregated, SlotState};
pub use config::AggregationConfig;
pub use distributed::{ApplyConvention, DistributedOptimizer};
pub use error::{AggregationErr, BoxedErr, Result};
pub use gate::ApplyGate;
pub use reduce::{AllReduce, Identity};
pub use tensor::{Gradient, SparseGradient, Tensor};
