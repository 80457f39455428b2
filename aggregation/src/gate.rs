use log::trace;

/// Decides, once per step, whether the optimizer updates the parameters.
///
/// On synchronization steps the real update runs, on accumulation-only steps the fallback
/// runs instead so the optimizer can still advance its own step counter.
#[derive(Debug, Default)]
pub struct ApplyGate {
    applied: usize,
    skipped: usize,
}

impl ApplyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs exactly one of `apply` and `fallback`.
    ///
    /// # Arguments
    /// * `synced` - Whether the current step reached a synchronization boundary.
    /// * `apply` - The optimizer's parameter update, using the synchronized gradients.
    /// * `fallback` - Bookkeeping for steps without an update.
    ///
    /// # Returns
    /// The result of whichever closure ran.
    pub fn maybe_apply<T, A, F>(&mut self, synced: bool, apply: A, fallback: F) -> T
    where
        A: FnOnce() -> T,
        F: FnOnce() -> T,
    {
        if synced {
            self.applied += 1;
            trace!(applied = self.applied; "applying synchronized gradients");
            apply()
        } else {
            self.skipped += 1;
            fallback()
        }
    }

    /// Returns the amount of steps that ran the real update.
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Returns the amount of steps that ran the fallback.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_exactly_one_closure() {
        let mut gate = ApplyGate::new();
        let applies = Cell::new(0);
        let fallbacks = Cell::new(0);

        for synced in [true, false, false, true, false] {
            let ran = gate.maybe_apply(
                synced,
                || {
                    applies.set(applies.get() + 1);
                    "apply"
                },
                || {
                    fallbacks.set(fallbacks.get() + 1);
                    "fallback"
                },
            );

            assert_eq!(ran, if synced { "apply" } else { "fallback" });
        }

        assert_eq!(applies.get(), 2);
        assert_eq!(fallbacks.get(), 3);
        assert_eq!(gate.applied(), 2);
        assert_eq!(gate.skipped(), 3);
    }

    #[test]
    fn test_propagates_closure_errors() {
        let mut gate = ApplyGate::new();

        let res: Result<(), &str> = gate.maybe_apply(true, || Err("update failed"), || Ok(()));
        assert_eq!(res, Err("update failed"));

        let res: Result<(), &str> = gate.maybe_apply(false, || Err("update failed"), || Ok(()));
        assert_eq!(res, Ok(()));
    }
}
