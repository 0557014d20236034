use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Map;
use crate::common::utils::time::now_monotonic;

gantry_exec::define_id_type!(AllocationId, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchJobState {
    /// Recorded, but not yet accepted by the batch scheduler.
    PendingSubmission,
    Queued,
    Running,
    Finished,
}

/// Which part of the queue service created the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationSource {
    Elastic,
    Maintainer,
    /// Created outside of the queue service (e.g. submitted by hand).
    External,
}

/// A batch scheduler allocation (PBS/Slurm/LSF job) that runs a launcher.
///
/// The term `allocation` is used to distinguish it from workflow jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchJob {
    pub id: AllocationId,
    #[serde(default)]
    pub scheduler_id: Option<String>,
    pub nodes: u32,
    pub wall_time_min: u32,
    pub queue: String,
    pub project: String,
    pub state: BatchJobState,
    pub source: AllocationSource,
    #[serde(default)]
    pub status_info: Option<String>,
    /// The allocation ended with an error (or never started).
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// How many status checks have failed in a row.
    #[serde(skip)]
    pub status_error_count: u32,
}

impl BatchJob {
    pub fn new(
        nodes: u32,
        wall_time: Duration,
        queue: String,
        project: String,
        source: AllocationSource,
    ) -> Self {
        Self {
            id: AllocationId::new(0),
            scheduler_id: None,
            nodes,
            wall_time_min: wall_time.as_secs().div_ceil(60) as u32,
            queue,
            project,
            state: BatchJobState::PendingSubmission,
            source,
            status_info: None,
            failed: false,
            script_path: None,
            created_at: Utc::now(),
            submitted_at: None,
            started_at: None,
            finished_at: None,
            status_error_count: 0,
        }
    }

    /// Returns true if the allocation is waiting for submission, queued or running.
    pub fn is_active(&self) -> bool {
        self.state != BatchJobState::Finished
    }

    /// Returns true if the allocation does not provide any nodes yet.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            BatchJobState::PendingSubmission | BatchJobState::Queued
        )
    }

    pub fn mark_queued(&mut self, scheduler_id: String) {
        self.scheduler_id = Some(scheduler_id);
        self.state = BatchJobState::Queued;
        self.submitted_at = Some(Utc::now());
    }

    pub fn mark_running(&mut self, started_at: Option<DateTime<Utc>>) {
        self.state = BatchJobState::Running;
        self.started_at = Some(started_at.unwrap_or_else(Utc::now));
    }

    pub fn mark_finished(&mut self, failed: bool, info: Option<String>) {
        self.state = BatchJobState::Finished;
        self.failed = failed;
        self.finished_at.get_or_insert_with(Utc::now);
        if info.is_some() {
            self.status_info = info;
        }
    }
}

/// Allocations tracked by the queue service.
pub struct ControllerState {
    allocations: Map<AllocationId, BatchJob>,
    rate_limiter: RateLimiter,
    /// When was the last allocation submitted by the elastic policy.
    last_submission: Option<Instant>,
    /// When did the elastic policy last submit or cancel an allocation.
    last_change: Option<Instant>,
}

impl ControllerState {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            allocations: Default::default(),
            rate_limiter,
            last_submission: None,
            last_change: None,
        }
    }

    pub fn add_allocation(&mut self, allocation: BatchJob) {
        if let Some(allocation) = self.allocations.insert(allocation.id, allocation) {
            log::warn!("Duplicate allocation detected: {}", allocation.id);
        }
    }

    pub fn get_allocation(&self, id: AllocationId) -> Option<&BatchJob> {
        self.allocations.get(&id)
    }

    pub fn get_allocation_mut(&mut self, id: AllocationId) -> Option<&mut BatchJob> {
        self.allocations.get_mut(&id)
    }

    /// Forgets allocations that are finished, they are kept upstream.
    pub fn remove_finished(&mut self) -> Vec<BatchJob> {
        let finished: Vec<AllocationId> = self
            .allocations
            .values()
            .filter(|alloc| !alloc.is_active())
            .map(|alloc| alloc.id)
            .collect();
        finished
            .into_iter()
            .filter_map(|id| self.allocations.remove(&id))
            .collect()
    }

    pub fn active_allocations(&self) -> impl Iterator<Item = &BatchJob> {
        self.allocations.values().filter(|alloc| alloc.is_active())
    }

    pub fn queued_allocations(&self) -> impl Iterator<Item = &BatchJob> {
        self.allocations
            .values()
            .filter(|alloc| alloc.state == BatchJobState::Queued)
    }

    pub fn allocation_ids(&self) -> Vec<AllocationId> {
        let mut ids: Vec<_> = self.allocations.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn limiter_mut(&mut self) -> &mut RateLimiter {
        &mut self.rate_limiter
    }

    pub fn last_submission(&self) -> Option<Instant> {
        self.last_submission
    }

    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }

    pub fn on_submitted(&mut self) {
        let now = now_monotonic();
        self.last_submission = Some(now);
        self.last_change = Some(now);
    }

    pub fn on_cancelled(&mut self) {
        self.last_change = Some(now_monotonic());
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RateLimiterStatus {
    Ok,
    Wait,
    TooManyFailedSubmissions,
    TooManyFailedAllocations,
}

/// Limits how often the queue service submits new allocations.
///
/// The limiter uses a Vec of delays which are used to block off submission.
/// When an allocation or a submission fails, the delay is increased, until it reaches the last
/// element of the Vec.
///
/// When the maximum number of (successive) allocation or submission failures is reached, the
/// `status` method will return [`RateLimiterStatus::TooManyFailedSubmissions`] or
/// [`RateLimiterStatus::TooManyFailedAllocations`] and submissions are paused.
pub struct RateLimiter {
    delays: Vec<Duration>,
    /// Index into `delays`.
    current_delay: usize,
    last_check: Instant,
    allocation_fails: u64,
    max_allocation_fails: u64,
    submission_fails: u64,
    max_submission_fails: u64,
}

impl RateLimiter {
    pub fn new(delays: Vec<Duration>, max_submission_fails: u64, max_allocation_fails: u64) -> Self {
        assert!(!delays.is_empty());
        Self {
            delays,
            current_delay: 0,
            last_check: now_monotonic(),
            allocation_fails: 0,
            max_allocation_fails,
            submission_fails: 0,
            max_submission_fails,
        }
    }

    /// An allocation was submitted successfully into the batch scheduler.
    pub fn on_submission_success(&mut self) {
        self.submission_fails = 0;
        if self.allocation_fails == 0 {
            self.current_delay = 0;
        }
    }

    /// An allocation was rejected by the batch scheduler.
    pub fn on_submission_fail(&mut self) {
        self.submission_fails += 1;
        self.increase_delay();
    }

    /// An allocation has finished after it ran.
    pub fn on_allocation_success(&mut self) {
        self.allocation_fails = 0;
        self.current_delay = 0;
    }

    /// An allocation has finished with an error.
    pub fn on_allocation_fail(&mut self) {
        self.allocation_fails += 1;
        self.increase_delay();
    }

    /// Submission will be attempted, reset the limiter timer.
    pub fn on_submission_attempt(&mut self) {
        self.last_check = now_monotonic();
    }

    pub fn status(&self) -> RateLimiterStatus {
        if self.allocation_fails >= self.max_allocation_fails {
            return RateLimiterStatus::TooManyFailedAllocations;
        }
        if self.submission_fails >= self.max_submission_fails {
            return RateLimiterStatus::TooManyFailedSubmissions;
        }
        let duration = now_monotonic().duration_since(self.last_check);
        if duration < self.delays[self.current_delay] {
            RateLimiterStatus::Wait
        } else {
            RateLimiterStatus::Ok
        }
    }

    fn increase_delay(&mut self) {
        if self.current_delay < self.delays.len() - 1 {
            self.current_delay += 1;
        }
    }
}
