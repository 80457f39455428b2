use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Immutable settings of an `Accumulator`, fixed for the whole run.
///
/// Every participant of a collective must use the same `aggregation_frequency`, otherwise
/// they will disagree on which steps reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationConfig {
    aggregation_frequency: NonZeroUsize,
    #[serde(default = "default_average")]
    average_aggregated_gradients: bool,
    #[serde(default)]
    sparse_as_dense: bool,
}

fn default_average() -> bool {
    true
}

impl AggregationConfig {
    /// Creates a new `AggregationConfig`.
    ///
    /// # Arguments
    /// * `aggregation_frequency` - The amount of local steps between synchronizations.
    /// * `average_aggregated_gradients` - Whether to divide the reduced sum by `aggregation_frequency`.
    /// * `sparse_as_dense` - Whether sparse gradients are densified instead of rejected.
    ///
    /// # Returns
    /// A new `AggregationConfig` instance.
    pub fn new(
        aggregation_frequency: NonZeroUsize,
        average_aggregated_gradients: bool,
        sparse_as_dense: bool,
    ) -> Self {
        Self {
            aggregation_frequency,
            average_aggregated_gradients,
            sparse_as_dense,
        }
    }

    /// Returns the amount of local steps between synchronizations.
    pub fn aggregation_frequency(&self) -> usize {
        self.aggregation_frequency.get()
    }

    pub fn average_aggregated_gradients(&self) -> bool {
        self.average_aggregated_gradients
    }

    pub fn sparse_as_dense(&self) -> bool {
        self.sparse_as_dense
    }

    /// Returns the divisor applied to the reduced gradients at a synchronization boundary.
    pub(crate) fn gradient_divisor(&self) -> f32 {
        if self.average_aggregated_gradients {
            self.aggregation_frequency.get() as f32
        } else {
            1.
        }
    }
}

impl Default for AggregationConfig {
    /// Synchronizes on every step, that is, no local aggregation at all.
    fn default() -> Self {
        Self::new(NonZeroUsize::MIN, true, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{ "aggregation_frequency": 4 }"#;
        let cfg: AggregationConfig = serde_json::from_str(json).unwrap();

        assert_eq!(cfg.aggregation_frequency(), 4);
        assert!(cfg.average_aggregated_gradients());
        assert!(!cfg.sparse_as_dense());
        assert_eq!(cfg.gradient_divisor(), 4.);
    }

    #[test]
    fn test_deserialize_rejects_zero_frequency() {
        let json = r#"{ "aggregation_frequency": 0 }"#;
        assert!(serde_json::from_str::<AggregationConfig>(json).is_err());
    }

    #[test]
    fn test_unscaled_divisor() {
        let cfg = AggregationConfig::new(NonZeroUsize::new(3).unwrap(), false, false);
        assert_eq!(cfg.gradient_divisor(), 1.);
    }
}
