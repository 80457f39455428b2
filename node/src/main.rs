mod config;
mod dataset;
mod model;
mod session;

use std::env;

use anyhow::ensure;
use log::info;

use crate::config::SessionConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::var("CONFIG") {
        Ok(path) => SessionConfig::load(&path)?,
        Err(_) => {
            info!("CONFIG not set, using the default session");
            SessionConfig::default()
        }
    };

    info!(
        workers = config.workers.get(),
        frequency = config.aggregation.aggregation_frequency();
        "starting session"
    );

    let reports = session::run(config).await?;

    for report in &reports {
        ensure!(
            report.params == reports[0].params,
            "rank {} diverged from rank 0",
            report.rank
        );
    }

    if let Some(report) = reports.first() {
        info!(loss = report.loss, updates = report.updates; "session finished");
        info!("final parameters: {:?}", report.params);
    }

    Ok(())
}
