//! In-process collective reduction for workers sharing a process.

mod error;
mod group;
mod op;
mod reduction;

pub use error::{CollectiveErr, Result};
pub use group::{LocalCollective, local_group};
pub use op::{Compression, ReduceOp};
