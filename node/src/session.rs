use aggregation::{DistributedOptimizer, Tensor};
use anyhow::{Context, anyhow};
use collective::{LocalCollective, local_group};
use log::{debug, info};
use ndarray::Array1;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::task::JoinSet;

use crate::{config::SessionConfig, dataset::Dataset, model::LinearModel};

/// What a worker ends up with after its last step.
#[derive(Debug)]
pub struct Report {
    pub rank: usize,
    pub params: Vec<Tensor>,
    pub loss: f32,
    pub updates: usize,
}

/// Runs a data parallel training session, every worker on its own blocking thread.
///
/// # Arguments
/// * `config` - The session settings.
///
/// # Returns
/// One report per worker sorted by rank, or the first error any worker ran into.
pub async fn run(config: SessionConfig) -> anyhow::Result<Vec<Report>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let features = config.features.get();
    let weights: Array1<f32> = Array1::from_shape_fn(features, |_| rng.random_range(-2.0..2.0));
    let bias: f32 = rng.random_range(-1.0..1.0);
    debug!(features = features, bias = bias; "sampled the true model");

    let group = local_group(config.workers, config.reduce_op, config.compression);

    let mut join_set = JoinSet::new();
    for reducer in group {
        let config = config.clone();
        let weights = weights.clone();
        join_set.spawn_blocking(move || train(config, reducer, &weights, bias));
    }

    let mut reports = Vec::with_capacity(config.workers.get());
    while let Some(res) = join_set.join_next().await {
        reports.push(res.context("worker panicked")??);
    }

    reports.sort_by_key(|r| r.rank);
    Ok(reports)
}

fn train(
    config: SessionConfig,
    reducer: LocalCollective,
    weights: &Array1<f32>,
    bias: f32,
) -> anyhow::Result<Report> {
    let rank = reducer.rank();
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(rank as u64 + 1));
    let dataset = Dataset::synthetic(
        config.samples.get(),
        weights,
        bias,
        config.noise,
        &mut rng,
    )?;

    let model = LinearModel::new(config.features.get());
    let mut params = reducer
        .broadcast(0, model.init_params(&mut rng))
        .with_context(|| format!("rank {rank} didn't receive the initial parameters"))?;
    let mut opt = DistributedOptimizer::new(
        config.aggregation,
        config.optimizer.build(),
        reducer,
        config.convention,
    );

    let mut loss = f32::NAN;
    let mut updates = 0;

    for step in 1..=config.steps.get() {
        let (x, y) = dataset.batch(config.batch_size.get(), &mut rng);
        let (batch_loss, grads) = model.gradients(&params, &x, &y)?;
        loss = batch_loss;

        let synced = opt
            .step(grads, &mut params)
            .map_err(|e| anyhow!("rank {rank} failed at step {step}: {e}"))?;

        if synced {
            updates += 1;
            if rank == 0 {
                info!(step = step, loss = loss; "parameters updated");
            }
        }
    }

    Ok(Report {
        rank,
        params,
        loss,
        updates,
    })
}
