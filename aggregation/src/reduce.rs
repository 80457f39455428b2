use crate::{Gradient, Result};

/// The collective reduction performed at every synchronization boundary.
///
/// Every participant calls `all_reduce` the same amount of times with its gradients in the
/// same slot order, the call blocks until all of them have contributed.
pub trait AllReduce {
    /// Combines the local `grads` with the ones of every other participant.
    ///
    /// # Arguments
    /// * `grads` - One gradient per accumulation buffer, in allocation order.
    ///
    /// # Returns
    /// The reduced gradients, same length and order as `grads`. An entry may be absent or
    /// stay sparse, those are passed through untouched by the caller.
    fn all_reduce(&mut self, grads: Vec<Gradient>) -> Result<Vec<Option<Gradient>>>;
}

impl<F> AllReduce for F
where
    F: FnMut(Vec<Gradient>) -> Result<Vec<Option<Gradient>>>,
{
    fn all_reduce(&mut self, grads: Vec<Gradient>) -> Result<Vec<Option<Gradient>>> {
        self(grads)
    }
}

/// The reduction of a single worker, returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl AllReduce for Identity {
    fn all_reduce(&mut self, grads: Vec<Gradient>) -> Result<Vec<Option<Gradient>>> {
        Ok(grads.into_iter().map(Some).collect())
    }
}
