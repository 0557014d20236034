use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::common::cli::LauncherOpts;
use crate::common::config::SiteConfig;
use crate::launcher::{
    GANTRY_ALLOCATION_ID, Launcher, LauncherParams, detect_nodes, detect_wall_time,
};
use crate::store::create_store;

/// Runs the launcher until it ends and returns the exit code of the process.
pub async fn command_launcher(
    config_path: &Path,
    opts: LauncherOpts,
    stop: CancellationToken,
) -> anyhow::Result<i32> {
    let mut config = SiteConfig::load(config_path)?;
    if let Some(mode) = opts.job_mode {
        config.launcher.job_mode = mode;
    }
    let nodes = detect_nodes(&config.launcher);
    let wall_time = detect_wall_time(opts.wall_time).await;
    match wall_time {
        Some(time) => log::info!("Allocation wall time: {time:?}"),
        None => log::info!("Allocation wall time is unbounded"),
    }

    let store = create_store(&config.upstream)?;
    let mut params = LauncherParams::new(&config, nodes, wall_time);
    params.allocation = std::env::var(GANTRY_ALLOCATION_ID).ok();

    let launcher = Launcher::start(params, store).await?;
    let outcome = launcher.run(stop).await;
    if let crate::launcher::ExitReason::Fatal(error) = &outcome.reason {
        log::error!("Launcher failed: {error}");
    }
    Ok(outcome.exit_code())
}
