//! Contract of the upstream Job/Allocation store.
//!
//! The store is the rendezvous of all Gantry processes: launchers claim jobs from it and
//! report their states, the queue service reads the backlog from it and mirrors the
//! allocations it manages into it.
mod memory;
mod rest;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use gantry_exec::resources::IdleResources;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Map;
use crate::autoalloc::{AllocationId, BatchJob};
use crate::common::config::{StoreKind, UpstreamConfig};
use crate::job::{BacklogSummary, Job, JobId, JobState, SessionId, StatusEvent};

pub use memory::MemoryStore;
pub use rest::RestStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or did not answer in time. The request can be retried.
    #[error("Upstream is temporarily unavailable: {0}")]
    Transient(String),
    #[error("Request was rejected by upstream: {0}")]
    Rejected(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Parameters of an atomic claim of runnable jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub max_jobs: usize,
    /// When present, upstream packs the claimed jobs into these resources.
    #[serde(default)]
    pub idle: Option<IdleResources>,
    /// When present, only jobs that fit into these resources on their own are claimed.
    /// Unlike `idle`, the claimed jobs are not packed together.
    #[serde(default)]
    pub capacity: Option<IdleResources>,
    /// Claimed jobs have one of these states. Runnable states are used when empty.
    #[serde(default)]
    pub states: Vec<JobState>,
    /// Only jobs whose declared wall time is below this limit are claimed.
    #[serde(default)]
    pub max_wall_time_min: Option<u32>,
    #[serde(default)]
    pub filter_tags: Map<String, String>,
}

impl ClaimRequest {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            max_jobs,
            ..Default::default()
        }
    }

    pub fn with_max_wall_time(mut self, wall_time: Option<Duration>) -> Self {
        self.max_wall_time_min = wall_time.map(|time| (time.as_secs() / 60) as u32);
        self
    }

    pub fn matches_state(&self, state: JobState) -> bool {
        if self.states.is_empty() {
            state.is_runnable()
        } else {
            self.states.contains(&state)
        }
    }

    /// Checks the static limits of the request, the idle snapshot is not considered.
    pub fn admits(&self, job: &Job) -> bool {
        self.matches_state(job.state)
            && job.matches_tags(&self.filter_tags)
            && job.fits_wall_time(self.max_wall_time())
            && self
                .capacity
                .as_ref()
                .is_none_or(|capacity| capacity.fits(&job.footprint))
    }

    fn max_wall_time(&self) -> Option<Duration> {
        self.max_wall_time_min
            .map(|minutes| Duration::from_secs(minutes as u64 * 60))
    }
}

/// Operations provided by the upstream store.
///
/// Implementations guarantee that a job is handed out by [`JobStore::claim`] to at most one
/// session at a time.
pub trait JobStore: Send + Sync {
    /// Opens a launcher session. Claimed jobs are locked to the session.
    fn open_session(&self, allocation: Option<String>) -> StoreFuture<'_, SessionId>;

    /// Reports that the session is alive and how many of its cores are idle.
    fn tick_session(&self, session: SessionId, idle_cores: u32) -> StoreFuture<'_, ()>;

    /// Closes the session and releases every job that it still holds without running it.
    fn close_session(&self, session: SessionId) -> StoreFuture<'_, ()>;

    /// Atomically locks up to `request.max_jobs` runnable jobs to the session.
    fn claim(&self, session: SessionId, request: ClaimRequest) -> StoreFuture<'_, Vec<Job>>;

    /// Marks claimed jobs as picked up by the launcher.
    fn acknowledge(&self, session: SessionId, jobs: Vec<JobId>) -> StoreFuture<'_, ()>;

    /// Unlocks claimed jobs, so that other sessions can claim them.
    fn release(&self, session: SessionId, jobs: Vec<JobId>) -> StoreFuture<'_, ()>;

    /// Applies a batch of state transitions, in order.
    fn update_status(&self, events: Vec<StatusEvent>) -> StoreFuture<'_, ()>;

    fn backlog(&self, filter_tags: Map<String, String>) -> StoreFuture<'_, BacklogSummary>;

    /// Registers a new allocation, upstream assigns its id.
    fn create_allocation(&self, allocation: BatchJob) -> StoreFuture<'_, BatchJob>;

    fn update_allocation(&self, allocation: BatchJob) -> StoreFuture<'_, ()>;

    /// Lists allocations, optionally only those that are not finished.
    fn list_allocations(&self, active_only: bool) -> StoreFuture<'_, Vec<BatchJob>>;

    fn get_allocation(&self, id: AllocationId) -> StoreFuture<'_, BatchJob>;
}

pub type StoreRef = Arc<dyn JobStore>;

/// Creates the store selected by the `[upstream]` section of the site configuration.
pub fn create_store(config: &UpstreamConfig) -> crate::Result<StoreRef> {
    match config.kind {
        StoreKind::Memory => {
            let store = MemoryStore::new();
            if let Some(path) = &config.jobs_file {
                let count = store.load_jobs_file(path)?;
                log::info!("Loaded {count} job(s) from {}", path.display());
            }
            Ok(Arc::new(store))
        }
        StoreKind::Rest => {
            let url = config.url.as_deref().ok_or_else(|| {
                crate::Error::ConfigError("`upstream.url` is required for the REST store".into())
            })?;
            Ok(Arc::new(RestStore::new(url, config.timeout)?))
        }
    }
}
