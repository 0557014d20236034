use std::path::Path;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::autoalloc::{AllocationController, create_resource_manager};
use crate::common::cli::QueueServiceOpts;
use crate::common::config::SiteConfig;
use crate::store::create_store;

pub async fn command_queue_service(
    config_path: &Path,
    opts: QueueServiceOpts,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let config = SiteConfig::load(config_path)?;
    if config.allocation.elastic.is_none() && config.allocation.maintainer.is_none() {
        log::warn!("No scaling policy is configured, allocations are only reconciled");
    }
    let launcher_cmd = match &config.allocation.launcher_cmd {
        Some(command) => command.clone(),
        None => default_launcher_cmd(config_path)?,
    };
    log::debug!("Allocations will run `{launcher_cmd}`");

    let store = create_store(&config.upstream)?;
    let manager = create_resource_manager(config.allocation.scheduler);
    let mut controller = AllocationController::new(&config, store, manager, launcher_cmd).await?;
    if opts.once {
        controller.tick().await?;
    } else {
        controller.run(stop).await;
    }
    Ok(())
}

/// Command that starts a launcher with the same binary and configuration file.
fn default_launcher_cmd(config_path: &Path) -> anyhow::Result<String> {
    let binary = std::env::current_exe().context("Cannot find the path of the gantry binary")?;
    let config = std::path::absolute(config_path).with_context(|| {
        format!("Cannot resolve configuration path {}", config_path.display())
    })?;
    Ok(format!(
        "{} --config {} launcher",
        binary.display(),
        config.display()
    ))
}
