//! This module controls the queue service, a background process that submits allocations
//! into Slurm/LSF (or local background processes) in response to the workload of the site,
//! so that enough launchers are available to run the backlog.
//!
//! The term `allocation` represents a batch scheduler job in this module, to distinguish
//! itself from workflow jobs.
mod config;
mod manager;
mod policy;
mod process;
mod script;
mod state;

pub type AutoAllocResult<T> = anyhow::Result<T>;

pub use manager::{
    AllocationExternalStatus, AllocationStatusMap, ManagerFuture, ResourceManager,
    create_resource_manager,
};
pub use policy::{ElasticDecision, elastic_decision, maintainer_deficit};
pub use process::AllocationController;
pub use script::{ScriptContext, render_template};
pub use state::{
    AllocationId, AllocationSource, BatchJob, BatchJobState, ControllerState, RateLimiter,
    RateLimiterStatus,
};
