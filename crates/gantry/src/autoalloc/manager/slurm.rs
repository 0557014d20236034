use std::path::Path;

use anyhow::Context;
use bstr::ByteSlice;
use chrono::{DateTime, Local, TimeZone, Utc};

use crate::Map;
use crate::autoalloc::manager::common::{check_command_output, create_command, run_command};
use crate::autoalloc::manager::{
    AllocationExternalStatus, AllocationStatusMap, ManagerFuture, ResourceManager,
};
use crate::autoalloc::script::SLURM_TEMPLATE;
use crate::autoalloc::{AutoAllocResult, BatchJob};
use crate::common::manager::ManagerType;
use crate::common::manager::slurm::{get_scontrol_items, parse_sbatch_output, parse_slurm_datetime};

pub struct SlurmManager;

impl ResourceManager for SlurmManager {
    fn manager_type(&self) -> ManagerType {
        ManagerType::Slurm
    }

    fn default_template(&self) -> &'static str {
        SLURM_TEMPLATE
    }

    fn submit<'a>(
        &'a self,
        _allocation: &'a BatchJob,
        script_path: &'a Path,
        workdir: &'a Path,
    ) -> ManagerFuture<'a, String> {
        Box::pin(async move {
            let script = script_path.display().to_string();
            let output = run_command(&["sbatch", &script], workdir).await?;
            log::debug!("Sbatch output: {output}");
            parse_sbatch_output(&output)
        })
    }

    fn status<'a>(&'a self, scheduler_ids: &'a [String]) -> ManagerFuture<'a, AllocationStatusMap> {
        Box::pin(async move {
            let mut result = Map::with_capacity_and_hasher(scheduler_ids.len(), Default::default());
            for id in scheduler_ids {
                result.insert(id.clone(), get_allocation_status(id).await);
            }
            Ok(result)
        })
    }

    fn cancel<'a>(&'a self, scheduler_id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move {
            run_command(&["scancel", scheduler_id], Path::new(".")).await?;
            Ok(())
        })
    }
}

async fn get_allocation_status(scheduler_id: &str) -> AutoAllocResult<AllocationExternalStatus> {
    let arguments = ["scontrol", "show", "job", scheduler_id];
    log::debug!("Running Slurm command `{}`", arguments.join(" "));
    let output = create_command(&arguments, Path::new("."))
        .output()
        .await
        .context("scontrol start failed")?;
    if !output.status.success() && output.stderr.contains_str("Invalid job id") {
        return Ok(AllocationExternalStatus::Finished {
            failed: false,
            info: Some("Allocation is no longer known to Slurm".to_string()),
        });
    }
    let output = check_command_output(output).context("scontrol execution failed")?;
    let output = output
        .stdout
        .to_str()
        .map_err(|err| anyhow::anyhow!("Invalid UTF-8 in scontrol output: {err:?}"))?;
    parse_slurm_status(get_scontrol_items(output))
}

fn parse_start_time(items: &Map<&str, &str>) -> Option<DateTime<Utc>> {
    let time = parse_slurm_datetime(items.get("StartTime")?).ok()?;
    Local
        .from_local_datetime(&time)
        .single()
        .map(|time| time.with_timezone(&Utc))
}

fn parse_slurm_status(items: Map<&str, &str>) -> AutoAllocResult<AllocationExternalStatus> {
    let state = items
        .get("JobState")
        .copied()
        .ok_or_else(|| anyhow::anyhow!("Missing key JobState in Slurm scontrol output"))?;
    let status = match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED" => AllocationExternalStatus::Queued,
        "RUNNING" | "COMPLETING" => AllocationExternalStatus::Running {
            started_at: parse_start_time(&items),
        },
        "COMPLETED" | "TIMEOUT" | "CANCELLED" => AllocationExternalStatus::Finished {
            failed: false,
            info: Some(state.to_string()),
        },
        "FAILED" | "NODE_FAIL" | "BOOT_FAIL" | "OUT_OF_MEMORY" | "DEADLINE" | "PREEMPTED" => {
            AllocationExternalStatus::Finished {
                failed: true,
                info: Some(state.to_string()),
            }
        }
        _ => anyhow::bail!("Unknown Slurm job status {state}"),
    };
    Ok(status)
}
