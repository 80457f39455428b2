use std::{fs, num::NonZeroUsize};

use aggregation::{
    AggregationConfig, ApplyConvention,
    optimization::{Adam, GradientDescent, GradientDescentWithMomentum, Optimizer},
};
use anyhow::Context;
use collective::{Compression, ReduceOp};
use serde::Deserialize;

/// The optimizer every worker wraps, as read from the session file.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerSpec {
    GradientDescent {
        learning_rate: f32,
    },
    GradientDescentWithMomentum {
        learning_rate: f32,
        momentum: f32,
    },
    Adam {
        learning_rate: f32,
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

impl OptimizerSpec {
    /// Builds a new optimizer out of this spec.
    pub fn build(&self) -> Box<dyn Optimizer + Send> {
        match *self {
            OptimizerSpec::GradientDescent { learning_rate } => {
                Box::new(GradientDescent::new(learning_rate))
            }
            OptimizerSpec::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => Box::new(GradientDescentWithMomentum::new(learning_rate, momentum)),
            OptimizerSpec::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(learning_rate, beta1, beta2, epsilon)),
        }
    }
}

/// A whole training session: the synthetic problem, the workers and how they synchronize.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub workers: NonZeroUsize,
    pub steps: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    pub samples: NonZeroUsize,
    pub features: NonZeroUsize,
    pub noise: f32,
    pub seed: u64,
    pub aggregation: AggregationConfig,
    pub optimizer: OptimizerSpec,
    pub convention: ApplyConvention,
    pub reduce_op: ReduceOp,
    pub compression: Compression,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let nz = |n| NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN);

        Self {
            workers: nz(4),
            steps: nz(400),
            batch_size: nz(16),
            samples: nz(256),
            features: nz(3),
            noise: 0.01,
            seed: 7,
            aggregation: AggregationConfig::new(nz(4), true, false),
            optimizer: OptimizerSpec::GradientDescent { learning_rate: 0.1 },
            convention: ApplyConvention::default(),
            reduce_op: ReduceOp::default(),
            compression: Compression::default(),
        }
    }
}

impl SessionConfig {
    /// Loads a `SessionConfig` from a JSON file, missing fields take their default value.
    ///
    /// # Arguments
    /// * `path` - The path of the session file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("cannot read '{path}'"))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("invalid session file '{path}'"))?;
        Ok(config)
    }
}
