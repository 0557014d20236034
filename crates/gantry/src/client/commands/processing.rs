use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::common::cli::ProcessingOpts;
use crate::common::config::SiteConfig;
use crate::processing::{ProcessingParams, ProcessingService};
use crate::store::create_store;

pub async fn command_processing(
    config_path: &Path,
    opts: ProcessingOpts,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let mut config = SiteConfig::load(config_path)?;
    if let Some(workers) = opts.num_workers {
        anyhow::ensure!(workers > 0, "At least one worker is needed");
        config.processing.num_workers = workers;
    }
    if config.processing.apps.is_empty() {
        log::info!("No application hooks are configured, jobs only move between states");
    }

    let store = create_store(&config.upstream)?;
    let service = ProcessingService::start(ProcessingParams::new(&config), store).await?;
    let outcome = service.run(stop).await;
    anyhow::ensure!(
        outcome.status.is_complete(),
        "Status of {} job(s) was not delivered",
        outcome.status.lost_jobs.len()
    );
    Ok(())
}
