use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::autoalloc::{AllocationId, BatchJob};
use crate::common::utils::time::now_monotonic;
use crate::job::{BacklogSummary, Job, JobDescription, JobId, JobState, SessionId, StatusEvent};
use crate::store::{ClaimRequest, JobStore, StoreError, StoreFuture, StoreResult};
use crate::{Map, Set};

/// Sessions that did not tick for this long are considered dead and lose their jobs.
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

struct Session {
    allocation: Option<String>,
    last_tick: Instant,
    idle_cores: u32,
}

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<JobId, Job>,
    locks: Map<JobId, SessionId>,
    acknowledged: Set<JobId>,
    sessions: Map<SessionId, Session>,
    history: Map<JobId, Vec<StatusEvent>>,
    allocations: BTreeMap<AllocationId, BatchJob>,
    job_counter: u64,
    session_counter: u64,
    allocation_counter: u64,
    failures_to_inject: u32,
    status_requests: u32,
}

impl Inner {
    fn take_failure(&mut self) -> StoreResult<()> {
        if self.failures_to_inject > 0 {
            self.failures_to_inject -= 1;
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        Ok(())
    }

    fn check_session(&self, session: SessionId) -> StoreResult<()> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(StoreError::Rejected(format!("Unknown session {session}")))
        }
    }

    fn unlock(&mut self, job_id: JobId) {
        self.locks.remove(&job_id);
        self.acknowledged.remove(&job_id);
    }

    fn release_session_jobs(&mut self, session: SessionId) -> usize {
        let jobs: Vec<JobId> = self
            .locks
            .iter()
            .filter(|(_, owner)| **owner == session)
            .map(|(job_id, _)| *job_id)
            .collect();
        for job_id in &jobs {
            self.unlock(*job_id);
        }
        jobs.len()
    }

    fn expire_sessions(&mut self, timeout: Duration) {
        let now = now_monotonic();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_tick) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for session in expired {
            let released = self.release_session_jobs(session);
            if let Some(session_info) = self.sessions.remove(&session) {
                log::warn!(
                    "Session {session} (allocation {:?}) expired, {released} job(s) released",
                    session_info.allocation
                );
            }
        }
    }

    fn is_locked(&self, job: &Job) -> bool {
        self.locks.contains_key(&job.id)
    }

    fn apply_event(&mut self, event: StatusEvent) {
        let Some(job) = self.jobs.get_mut(&event.job_id) else {
            log::warn!("Status update of unknown job {}", event.job_id);
            return;
        };
        if !job.state.can_transition_to(event.state) {
            log::warn!(
                "Ignoring invalid transition of job {}: {} -> {}",
                job.id,
                job.state,
                event.state
            );
            return;
        }
        job.state = event.state;
        job.updated_at = event.timestamp;
        if event.state == JobState::RestartReady {
            job.num_restarts += 1;
        }
        if event.error.is_some() {
            job.last_error = event.error.clone();
        }
        if event.state != JobState::Running {
            self.unlock(event.job_id);
        }
        self.history.entry(event.job_id).or_default().push(event);
    }
}

/// In-process store, used for local runs and tests.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    session_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_session_timeout(DEFAULT_SESSION_TIMEOUT)
    }

    pub fn with_session_timeout(session_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            session_timeout,
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Transient("store lock is poisoned".to_string()))
    }

    /// Registers a new runnable job.
    pub fn add_job(&self, description: JobDescription) -> StoreResult<JobId> {
        let mut inner = self.lock()?;
        let id = match description.id {
            Some(id) => {
                if inner.jobs.contains_key(&id) {
                    return Err(StoreError::Rejected(format!("Job {id} already exists")));
                }
                inner.job_counter = inner.job_counter.max(id.as_num());
                id
            }
            None => {
                inner.job_counter += 1;
                JobId::new(inner.job_counter)
            }
        };
        let state = description.initial_state().ok_or_else(|| {
            StoreError::Rejected(format!(
                "Job {id} cannot be created in state {:?}",
                description.state
            ))
        })?;
        let now = Utc::now();
        inner.jobs.insert(
            id,
            Job {
                id,
                footprint: description.footprint(),
                command: description.command,
                env: description.env,
                workdir: description.workdir,
                state,
                wall_time_min: description.wall_time_min,
                tags: description.tags,
                app: description.app,
                created_at: now,
                updated_at: now,
                last_error: None,
                num_restarts: 0,
            },
        );
        Ok(id)
    }

    /// Loads a JSON array of job descriptions.
    pub fn load_jobs_file(&self, path: &Path) -> crate::Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let descriptions: Vec<JobDescription> = serde_json::from_str(&content)?;
        let count = descriptions.len();
        for description in descriptions {
            self.add_job(description)?;
        }
        Ok(count)
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.lock().ok()?.jobs.get(&id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lock()
            .map(|inner| inner.jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Applied state transitions of a job, in order.
    pub fn history(&self, id: JobId) -> Vec<StatusEvent> {
        self.lock()
            .ok()
            .and_then(|inner| inner.history.get(&id).cloned())
            .unwrap_or_default()
    }

    pub fn locked_by(&self, id: JobId) -> Option<SessionId> {
        self.lock().ok()?.locks.get(&id).copied()
    }

    pub fn is_acknowledged(&self, id: JobId) -> bool {
        self.lock()
            .map(|inner| inner.acknowledged.contains(&id))
            .unwrap_or(false)
    }

    /// The next `count` requests fail with a transient error.
    pub fn inject_failures(&self, count: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.failures_to_inject = count;
        }
    }

    /// Idle cores last reported by a live session.
    pub fn session_idle_cores(&self, session: SessionId) -> Option<u32> {
        self.lock()
            .ok()?
            .sessions
            .get(&session)
            .map(|state| state.idle_cores)
    }

    /// Number of bulk status updates that were received.
    pub fn status_requests(&self) -> u32 {
        self.lock().map(|inner| inner.status_requests).unwrap_or(0)
    }

    fn open_session_sync(&self, allocation: Option<String>) -> StoreResult<SessionId> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        inner.session_counter += 1;
        let id = SessionId::new(inner.session_counter);
        inner.sessions.insert(
            id,
            Session {
                allocation,
                last_tick: now_monotonic(),
                idle_cores: 0,
            },
        );
        Ok(id)
    }

    fn tick_session_sync(&self, session: SessionId, idle_cores: u32) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        let Some(state) = inner.sessions.get_mut(&session) else {
            return Err(StoreError::NotFound(format!("session {session}")));
        };
        state.last_tick = now_monotonic();
        state.idle_cores = idle_cores;
        Ok(())
    }

    fn close_session_sync(&self, session: SessionId) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        let released = inner.release_session_jobs(session);
        if inner.sessions.remove(&session).is_some() {
            log::debug!("Session {session} closed, {released} job(s) released");
        }
        Ok(())
    }

    fn claim_sync(&self, session: SessionId, request: ClaimRequest) -> StoreResult<Vec<Job>> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        inner.expire_sessions(self.session_timeout);
        inner.check_session(session)?;

        let mut idle = request.idle.clone();
        let mut claimed = Vec::new();
        for job in inner.jobs.values() {
            if claimed.len() >= request.max_jobs {
                break;
            }
            if inner.is_locked(job) || !request.admits(job) {
                continue;
            }
            if let Some(idle) = idle.as_mut() {
                if !idle.consume(&job.footprint) {
                    continue;
                }
            }
            claimed.push(job.clone());
        }
        for job in &claimed {
            inner.locks.insert(job.id, session);
        }
        Ok(claimed)
    }

    fn acknowledge_sync(&self, session: SessionId, jobs: Vec<JobId>) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        for job_id in jobs {
            if inner.locks.get(&job_id) != Some(&session) {
                return Err(StoreError::Rejected(format!(
                    "Job {job_id} is not claimed by session {session}"
                )));
            }
            inner.acknowledged.insert(job_id);
        }
        Ok(())
    }

    fn release_sync(&self, session: SessionId, jobs: Vec<JobId>) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        for job_id in jobs {
            if inner.locks.get(&job_id) == Some(&session) {
                inner.unlock(job_id);
            }
        }
        Ok(())
    }

    fn update_status_sync(&self, events: Vec<StatusEvent>) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        inner.status_requests += 1;
        for event in events {
            inner.apply_event(event);
        }
        Ok(())
    }

    fn backlog_sync(&self, filter_tags: Map<String, String>) -> StoreResult<BacklogSummary> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        inner.expire_sessions(self.session_timeout);
        let mut summary = BacklogSummary::default();
        for job in inner
            .jobs
            .values()
            .filter(|job| {
                job.state.is_runnable() && !inner.is_locked(job) && job.matches_tags(&filter_tags)
            })
        {
            let cores = job.footprint.total_cores();
            summary.runnable_jobs += 1;
            summary.runnable_cores += cores as u64;
            summary.largest_job_cores = summary.largest_job_cores.max(cores);
        }
        summary.idle_cores = inner
            .sessions
            .values()
            .map(|session| session.idle_cores as u64)
            .sum();
        Ok(summary)
    }

    fn create_allocation_sync(&self, mut allocation: BatchJob) -> StoreResult<BatchJob> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        inner.allocation_counter += 1;
        allocation.id = AllocationId::new(inner.allocation_counter);
        inner.allocations.insert(allocation.id, allocation.clone());
        Ok(allocation)
    }

    fn update_allocation_sync(&self, allocation: BatchJob) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        match inner.allocations.get_mut(&allocation.id) {
            Some(stored) => {
                *stored = allocation;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("allocation {}", allocation.id))),
        }
    }

    fn list_allocations_sync(&self, active_only: bool) -> StoreResult<Vec<BatchJob>> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        Ok(inner
            .allocations
            .values()
            .filter(|allocation| !active_only || allocation.is_active())
            .cloned()
            .collect())
    }

    fn get_allocation_sync(&self, id: AllocationId) -> StoreResult<BatchJob> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        inner
            .allocations
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("allocation {id}")))
    }
}

impl JobStore for MemoryStore {
    fn open_session(&self, allocation: Option<String>) -> StoreFuture<'_, SessionId> {
        Box::pin(async move { self.open_session_sync(allocation) })
    }

    fn tick_session(&self, session: SessionId, idle_cores: u32) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.tick_session_sync(session, idle_cores) })
    }

    fn close_session(&self, session: SessionId) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.close_session_sync(session) })
    }

    fn claim(&self, session: SessionId, request: ClaimRequest) -> StoreFuture<'_, Vec<Job>> {
        Box::pin(async move { self.claim_sync(session, request) })
    }

    fn acknowledge(&self, session: SessionId, jobs: Vec<JobId>) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.acknowledge_sync(session, jobs) })
    }

    fn release(&self, session: SessionId, jobs: Vec<JobId>) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.release_sync(session, jobs) })
    }

    fn update_status(&self, events: Vec<StatusEvent>) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.update_status_sync(events) })
    }

    fn backlog(&self, filter_tags: Map<String, String>) -> StoreFuture<'_, BacklogSummary> {
        Box::pin(async move { self.backlog_sync(filter_tags) })
    }

    fn create_allocation(&self, allocation: BatchJob) -> StoreFuture<'_, BatchJob> {
        Box::pin(async move { self.create_allocation_sync(allocation) })
    }

    fn update_allocation(&self, allocation: BatchJob) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.update_allocation_sync(allocation) })
    }

    fn list_allocations(&self, active_only: bool) -> StoreFuture<'_, Vec<BatchJob>> {
        Box::pin(async move { self.list_allocations_sync(active_only) })
    }

    fn get_allocation(&self, id: AllocationId) -> StoreFuture<'_, BatchJob> {
        Box::pin(async move { self.get_allocation_sync(id) })
    }
}
