use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use derive_builder::Builder;

use crate::Map;
use crate::autoalloc::{
    AllocationExternalStatus, AllocationStatusMap, BatchJob, ManagerFuture, ResourceManager,
};
use crate::common::manager::ManagerType;
use crate::job::{JobDescription, JobId, JobState};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct Job {
    #[builder(default)]
    id: Option<JobId>,
    #[builder(default = "\"true\".to_string()", setter(into))]
    command: String,
    #[builder(default = "1")]
    ranks: u32,
    #[builder(default = "1")]
    cores_per_rank: u32,
    #[builder(default)]
    gpus_per_rank: u32,
    #[builder(default)]
    env: Map<String, String>,
    #[builder(default, setter(into))]
    workdir: PathBuf,
    #[builder(default)]
    wall_time_min: Option<u32>,
    #[builder(default)]
    tags: Map<String, String>,
    #[builder(default, setter(strip_option, into))]
    app: Option<String>,
    #[builder(default, setter(strip_option))]
    state: Option<JobState>,
}

impl JobBuilder {
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> JobDescription {
        let Job {
            id,
            command,
            ranks,
            cores_per_rank,
            gpus_per_rank,
            env,
            workdir,
            wall_time_min,
            tags,
            app,
            state,
        } = self.finish().unwrap();
        JobDescription {
            id,
            command,
            ranks,
            cores_per_rank,
            gpus_per_rank,
            env,
            workdir,
            wall_time_min,
            tags,
            app,
            state,
        }
    }

    /// Builds a runnable job without going through a store.
    pub fn build_job(self) -> crate::job::Job {
        let description = self.build();
        let now = chrono::Utc::now();
        crate::job::Job {
            id: description.id.unwrap_or(JobId::new(1)),
            footprint: description.footprint(),
            command: description.command,
            env: description.env,
            workdir: description.workdir,
            state: description.state.unwrap_or(JobState::Preprocessed),
            wall_time_min: description.wall_time_min,
            tags: description.tags,
            app: description.app,
            created_at: now,
            updated_at: now,
            last_error: None,
            num_restarts: 0,
        }
    }
}

#[derive(Default)]
pub struct MockManagerState {
    pub submitted: Vec<BatchJob>,
    pub statuses: Map<String, AllocationExternalStatus>,
    pub cancelled: Vec<String>,
    pub fail_submissions: bool,
    pub fail_status: bool,
    counter: u64,
}

/// Resource manager that only records what it was asked to do.
///
/// Submitted allocations are reported as queued until their status is changed in the
/// shared state.
#[derive(Clone, Default)]
pub struct MockManager {
    pub state: Arc<Mutex<MockManagerState>>,
}

impl MockManager {
    pub fn set_status(&self, scheduler_id: &str, status: AllocationExternalStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(scheduler_id.to_string(), status);
    }

    pub fn submitted(&self) -> Vec<BatchJob> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

impl ResourceManager for MockManager {
    fn manager_type(&self) -> ManagerType {
        ManagerType::Local
    }

    fn default_template(&self) -> &'static str {
        "#!/bin/bash\n# %{ALLOCATION_ID} %{NODES}\n%{LAUNCHER_CMD}\n"
    }

    fn submit<'a>(
        &'a self,
        allocation: &'a BatchJob,
        script_path: &'a Path,
        _workdir: &'a Path,
    ) -> ManagerFuture<'a, String> {
        Box::pin(async move {
            assert!(script_path.is_file());
            let mut state = self.state.lock().unwrap();
            if state.fail_submissions {
                anyhow::bail!("submission rejected");
            }
            state.counter += 1;
            let id = format!("mock-{}", state.counter);
            state.submitted.push(allocation.clone());
            state
                .statuses
                .insert(id.clone(), AllocationExternalStatus::Queued);
            Ok(id)
        })
    }

    fn status<'a>(&'a self, scheduler_ids: &'a [String]) -> ManagerFuture<'a, AllocationStatusMap> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            if state.fail_status {
                anyhow::bail!("status check failed");
            }
            Ok(scheduler_ids
                .iter()
                .map(|id| {
                    let status = state
                        .statuses
                        .get(id)
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("unknown allocation {id}"));
                    (id.clone(), status)
                })
                .collect::<Map<_, _>>())
        })
    }

    fn cancel<'a>(&'a self, scheduler_id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.cancelled.push(scheduler_id.to_string());
            state.statuses.insert(
                scheduler_id.to_string(),
                AllocationExternalStatus::Finished {
                    failed: false,
                    info: Some("CANCELLED".to_string()),
                },
            );
            Ok(())
        })
    }
}
