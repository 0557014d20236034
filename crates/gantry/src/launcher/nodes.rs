use std::time::Duration;

use gantry_exec::resources::NodeDescriptor;

use crate::common::config::LauncherConfig;
use crate::common::manager::slurm::get_remaining_timelimit;

/// Nodes of the allocation. Without configured nodes, the launcher runs on the local host
/// with all of its cores.
pub fn detect_nodes(config: &LauncherConfig) -> Vec<NodeDescriptor> {
    if !config.nodes.is_empty() {
        return config.nodes.clone();
    }
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let cores = std::thread::available_parallelism()
        .map(|count| count.get() as u32)
        .unwrap_or(1);
    log::debug!("Detected local node {hostname} with {cores} core(s)");
    vec![NodeDescriptor::new(hostname, cores, config.gpus_per_node)]
}

/// Remaining time of the allocation, from the command line or from Slurm.
///
/// Returns `None` when the time is unbounded or cannot be found out.
pub async fn detect_wall_time(explicit: Option<Duration>) -> Option<Duration> {
    if explicit.is_some() {
        return explicit;
    }
    let job_id = std::env::var("SLURM_JOB_ID").ok()?;
    match get_remaining_timelimit(&job_id).await {
        Ok(remaining) => {
            log::info!("Remaining time of Slurm job {job_id}: {remaining:?}");
            Some(remaining)
        }
        Err(error) => {
            log::warn!("Cannot get the remaining time of Slurm job {job_id}: {error:?}");
            None
        }
    }
}
