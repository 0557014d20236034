mod common;
mod local;
mod lsf;
mod slurm;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::Map;
use crate::autoalloc::{AutoAllocResult, BatchJob};
use crate::common::manager::ManagerType;

pub use local::LocalManager;
pub use lsf::LsfManager;
pub use slurm::SlurmManager;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocationExternalStatus {
    Queued,
    Running {
        started_at: Option<DateTime<Utc>>,
    },
    Finished {
        /// The allocation failed or never started.
        failed: bool,
        info: Option<String>,
    },
}

/// Statuses keyed by scheduler ids.
pub type AllocationStatusMap = Map<String, AutoAllocResult<AllocationExternalStatus>>;

pub type ManagerFuture<'a, T> = Pin<Box<dyn Future<Output = AutoAllocResult<T>> + Send + 'a>>;

/// Handler that communicates with a batch scheduler (or a substitute of it).
pub trait ResourceManager: Send + Sync {
    fn manager_type(&self) -> ManagerType;

    /// Template used when the site does not configure its own.
    fn default_template(&self) -> &'static str;

    /// Submits a rendered script and returns the scheduler id of the new allocation.
    fn submit<'a>(
        &'a self,
        allocation: &'a BatchJob,
        script_path: &'a Path,
        workdir: &'a Path,
    ) -> ManagerFuture<'a, String>;

    /// Gets statuses of a set of allocations.
    /// This function takes multiple allocations at once to amortize the query cost.
    fn status<'a>(&'a self, scheduler_ids: &'a [String]) -> ManagerFuture<'a, AllocationStatusMap>;

    /// Removes the allocation, if it still exists.
    fn cancel<'a>(&'a self, scheduler_id: &'a str) -> ManagerFuture<'a, ()>;
}

pub fn create_resource_manager(manager: ManagerType) -> Box<dyn ResourceManager> {
    match manager {
        ManagerType::Slurm => Box::new(SlurmManager),
        ManagerType::Lsf => Box::new(LsfManager),
        ManagerType::Local => Box::new(LocalManager::default()),
    }
}
