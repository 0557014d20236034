use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::Context;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::process::Child;

use crate::Map;
use crate::autoalloc::manager::{
    AllocationExternalStatus, AllocationStatusMap, ManagerFuture, ResourceManager,
};
use crate::autoalloc::script::LOCAL_TEMPLATE;
use crate::autoalloc::{AutoAllocResult, BatchJob};
use crate::common::manager::ManagerType;

/// Runs allocations as background `bash` processes on the current machine.
///
/// The scheduler id of an allocation is the pid of its process, which is the leader of
/// its own process group.
#[derive(Default)]
pub struct LocalManager {
    children: Mutex<Map<String, Child>>,
}

impl LocalManager {
    fn spawn(&self, script_path: &Path, workdir: &Path) -> AutoAllocResult<String> {
        let stem = script_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "allocation".to_string());
        let stdout = std::fs::File::create(workdir.join(format!("{stem}.out")))?;
        let stderr = std::fs::File::create(workdir.join(format!("{stem}.err")))?;

        let mut command = tokio::process::Command::new("bash");
        command
            .arg(script_path)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        let child = command
            .spawn()
            .with_context(|| format!("Cannot start {}", script_path.display()))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Allocation process has no pid"))?
            .to_string();
        self.children
            .lock()
            .map_err(|_| anyhow::anyhow!("Local allocation table is poisoned"))?
            .insert(pid.clone(), child);
        Ok(pid)
    }

    fn check(&self, scheduler_id: &str) -> AutoAllocResult<AllocationExternalStatus> {
        let mut children = self
            .children
            .lock()
            .map_err(|_| anyhow::anyhow!("Local allocation table is poisoned"))?;
        if let Some(child) = children.get_mut(scheduler_id) {
            return match child.try_wait()? {
                None => Ok(AllocationExternalStatus::Running { started_at: None }),
                Some(status) => {
                    children.remove(scheduler_id);
                    Ok(AllocationExternalStatus::Finished {
                        failed: !status.success(),
                        info: Some(format!("Allocation process finished with {status}")),
                    })
                }
            };
        }
        // Allocations started by a previous instance are checked by their pid.
        let pid = parse_pid(scheduler_id)?;
        if kill(pid, None).is_ok() {
            Ok(AllocationExternalStatus::Running { started_at: None })
        } else {
            Ok(AllocationExternalStatus::Finished {
                failed: false,
                info: Some("Allocation process is gone".to_string()),
            })
        }
    }
}

fn parse_pid(scheduler_id: &str) -> AutoAllocResult<Pid> {
    let pid: i32 = scheduler_id
        .parse()
        .with_context(|| format!("Invalid local allocation id `{scheduler_id}`"))?;
    Ok(Pid::from_raw(pid))
}

impl ResourceManager for LocalManager {
    fn manager_type(&self) -> ManagerType {
        ManagerType::Local
    }

    fn default_template(&self) -> &'static str {
        LOCAL_TEMPLATE
    }

    fn submit<'a>(
        &'a self,
        _allocation: &'a BatchJob,
        script_path: &'a Path,
        workdir: &'a Path,
    ) -> ManagerFuture<'a, String> {
        Box::pin(async move { self.spawn(script_path, workdir) })
    }

    fn status<'a>(&'a self, scheduler_ids: &'a [String]) -> ManagerFuture<'a, AllocationStatusMap> {
        Box::pin(async move {
            Ok(scheduler_ids
                .iter()
                .map(|id| (id.clone(), self.check(id)))
                .collect::<Map<_, _>>())
        })
    }

    fn cancel<'a>(&'a self, scheduler_id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move {
            let pid = parse_pid(scheduler_id)?;
            match killpg(pid, Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(error) => Err(anyhow::anyhow!(
                    "Cannot cancel local allocation {scheduler_id}: {error}"
                )),
            }
        })
    }
}
