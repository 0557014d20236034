//! Sources of runnable jobs for the launcher.
mod prefetch;
mod sync;

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use gantry_exec::resources::IdleResources;

use crate::Map;
use crate::common::config::{FeedConfig, FeedStrategy};
use crate::common::utils::time::now_monotonic;
use crate::job::{Job, JobId, JobState, SessionId};
use crate::store::{ClaimRequest, StoreRef};

pub use prefetch::PrefetchFeed;
pub use sync::SyncFeed;

pub type FeedFuture<'a, T> = Pin<Box<dyn Future<Output = crate::Result<T>> + Send + 'a>>;

/// Supplies jobs that are ready to run.
///
/// Every job returned by [`JobFeed::fetch`] is claimed by the session of the launcher, so
/// no other launcher can get it until it is returned or the session is closed.
pub trait JobFeed: Send {
    /// Returns at most `max_jobs` jobs that fit into `idle`. The call is bounded in time
    /// and may return fewer jobs (or none).
    fn fetch<'a>(
        &'a mut self,
        max_jobs: usize,
        idle: &'a IdleResources,
    ) -> FeedFuture<'a, Vec<Job>>;

    /// Marks jobs as picked up by the launcher.
    fn acknowledge(&mut self, jobs: Vec<JobId>) -> FeedFuture<'_, ()>;

    /// Gives back jobs that could not be started.
    fn return_jobs(&mut self, jobs: Vec<Job>) -> FeedFuture<'_, ()>;

    /// Stops background work and releases jobs that were fetched but never handed out.
    fn close(&mut self) -> FeedFuture<'_, ()>;
}

/// What the feed claims and on behalf of whom.
#[derive(Clone)]
pub struct FeedContext {
    pub store: StoreRef,
    pub session: SessionId,
    pub filter_tags: Map<String, String>,
    /// End of the allocation, jobs with a longer declared wall time are not claimed.
    pub deadline: Option<Instant>,
    /// Resources of the whole allocation, jobs that would not fit even into an empty
    /// allocation are not claimed.
    pub capacity: Option<IdleResources>,
    /// States of claimed jobs, runnable states when empty.
    pub states: Vec<JobState>,
    pub fetch_timeout: Duration,
}

impl FeedContext {
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now_monotonic()))
    }

    fn claim_request(&self, max_jobs: usize) -> ClaimRequest {
        ClaimRequest {
            filter_tags: self.filter_tags.clone(),
            capacity: self.capacity.clone(),
            states: self.states.clone(),
            ..ClaimRequest::new(max_jobs).with_max_wall_time(self.remaining_time())
        }
    }

    /// Returns false for jobs that do not fit into the allocation, however idle it gets.
    fn fits_capacity(&self, job: &Job) -> bool {
        self.capacity
            .as_ref()
            .is_none_or(|capacity| capacity.fits(&job.footprint))
    }
}

pub fn create_feed(config: &FeedConfig, context: FeedContext) -> Box<dyn JobFeed> {
    match config.strategy {
        FeedStrategy::Prefetch => Box::new(PrefetchFeed::start(
            context,
            config.prefetch_depth,
            config.refill_interval,
        )),
        FeedStrategy::Sync => Box::new(SyncFeed::new(context)),
    }
}
