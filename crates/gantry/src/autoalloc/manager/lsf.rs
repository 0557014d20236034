use std::path::Path;

use crate::Map;
use crate::autoalloc::manager::common::run_command;
use crate::autoalloc::manager::{
    AllocationExternalStatus, AllocationStatusMap, ManagerFuture, ResourceManager,
};
use crate::autoalloc::script::LSF_TEMPLATE;
use crate::autoalloc::BatchJob;
use crate::common::manager::ManagerType;
use crate::common::manager::lsf::{
    LsfJobState, LsfJobStatus, parse_bsub_output, parse_jobstat_output,
};

pub struct LsfManager;

impl ResourceManager for LsfManager {
    fn manager_type(&self) -> ManagerType {
        ManagerType::Lsf
    }

    fn default_template(&self) -> &'static str {
        LSF_TEMPLATE
    }

    fn submit<'a>(
        &'a self,
        allocation: &'a BatchJob,
        script_path: &'a Path,
        workdir: &'a Path,
    ) -> ManagerFuture<'a, String> {
        Box::pin(async move {
            let arguments = bsub_arguments(allocation, script_path);
            let arguments: Vec<&str> = arguments.iter().map(|arg| arg.as_str()).collect();
            let output = run_command(&arguments, workdir).await?;
            log::debug!("Bsub output: {output}");
            parse_bsub_output(&output)
        })
    }

    fn status<'a>(&'a self, scheduler_ids: &'a [String]) -> ManagerFuture<'a, AllocationStatusMap> {
        Box::pin(async move {
            let output = run_command(&["jobstat"], Path::new(".")).await?;
            let jobs = parse_jobstat_output(&output)?;
            Ok(scheduler_ids
                .iter()
                .map(|id| (id.clone(), Ok(lsf_status(jobs.get(id)))))
                .collect::<Map<_, _>>())
        })
    }

    fn cancel<'a>(&'a self, scheduler_id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move {
            run_command(&["bkill", scheduler_id], Path::new(".")).await?;
            Ok(())
        })
    }
}

fn bsub_arguments(allocation: &BatchJob, script_path: &Path) -> Vec<String> {
    let stem = script_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("gantry-{}", allocation.id));
    let mut arguments = vec![
        "bsub".to_string(),
        "-o".to_string(),
        format!("{stem}.output"),
        "-e".to_string(),
        format!("{stem}.error"),
    ];
    if !allocation.project.is_empty() {
        arguments.extend(["-P".to_string(), allocation.project.clone()]);
    }
    arguments.extend([
        "-q".to_string(),
        allocation.queue.clone(),
        "-nnodes".to_string(),
        allocation.nodes.to_string(),
        "-W".to_string(),
        allocation.wall_time_min.to_string(),
        script_path.display().to_string(),
    ]);
    arguments
}

/// Jobs missing in the `jobstat` output have left the system.
fn lsf_status(status: Option<&LsfJobStatus>) -> AllocationExternalStatus {
    match status {
        Some(LsfJobStatus {
            state: LsfJobState::Running,
            ..
        }) => AllocationExternalStatus::Running { started_at: None },
        Some(LsfJobStatus {
            state: LsfJobState::Eligible,
            ..
        }) => AllocationExternalStatus::Queued,
        Some(LsfJobStatus {
            state: LsfJobState::Blocked,
            message,
            ..
        }) => AllocationExternalStatus::Finished {
            failed: true,
            info: Some(message.clone().unwrap_or_else(|| "Blocked by LSF".to_string())),
        },
        None => AllocationExternalStatus::Finished {
            failed: false,
            info: Some("Allocation is no longer known to LSF".to_string()),
        },
    }
}
