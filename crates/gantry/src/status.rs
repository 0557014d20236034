//! Batched delivery of job state transitions to the upstream store.
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;

use crate::Set;
use crate::common::config::StatusConfig;
use crate::common::error::GantryError;
use crate::job::{JobId, StatusEvent};
use crate::store::StoreRef;

/// Outcome of the status delivery of a whole launcher run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Events accepted by upstream.
    pub flushed: usize,
    /// Events that were given up on (never enqueued or dropped after retries).
    pub dropped: usize,
    /// Jobs whose status upstream may be stale.
    pub lost_jobs: Vec<JobId>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.dropped == 0
    }

    fn record_lost(&mut self, events: &[StatusEvent]) {
        self.dropped += events.len();
        self.lost_jobs.extend(events.iter().map(|event| event.job_id));
    }

    fn merge(&mut self, other: FlushReport) {
        self.flushed += other.flushed;
        self.dropped += other.dropped;
        self.lost_jobs.extend(other.lost_jobs);
    }

    fn finish(mut self) -> Self {
        let unique: Set<JobId> = self.lost_jobs.drain(..).collect();
        self.lost_jobs = unique.into_iter().collect();
        self.lost_jobs.sort();
        self
    }
}

/// Collects state transitions and writes them upstream in bulk from a background task.
///
/// Events are delivered in the order of submission, so the per-job order is kept across
/// batches.
pub struct StatusAggregator {
    sender: mpsc::Sender<StatusEvent>,
    handle: JoinHandle<FlushReport>,
    enqueue_timeout: Duration,
    not_enqueued: FlushReport,
}

impl StatusAggregator {
    pub fn start(store: StoreRef, config: &StatusConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let handle = tokio::spawn(flush_process(store, config.clone(), receiver));
        Self {
            sender,
            handle,
            enqueue_timeout: config.enqueue_timeout,
            not_enqueued: FlushReport::default(),
        }
    }

    /// Enqueues an event. Returns false if the queue stayed full for the whole enqueue
    /// timeout, the event is then lost.
    pub async fn submit(&mut self, event: StatusEvent) -> bool {
        match self.sender.send_timeout(event, self.enqueue_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(event) | SendTimeoutError::Closed(event)) => {
                log::error!(
                    "{}",
                    GantryError::StatusLost(format!(
                        "{} ({} could not be enqueued)",
                        event.job_id, event.state
                    ))
                );
                self.not_enqueued.record_lost(std::slice::from_ref(&event));
                false
            }
        }
    }

    /// Flushes everything that was submitted and stops the background task.
    pub async fn shutdown(self) -> FlushReport {
        let StatusAggregator {
            sender,
            handle,
            not_enqueued,
            ..
        } = self;
        drop(sender);
        let mut report = match handle.await {
            Ok(report) => report,
            Err(error) => {
                log::error!("Status flush task failed: {error}");
                FlushReport::default()
            }
        };
        report.merge(not_enqueued);
        report.finish()
    }
}

async fn flush_process(
    store: StoreRef,
    config: StatusConfig,
    mut receiver: mpsc::Receiver<StatusEvent>,
) -> FlushReport {
    let mut report = FlushReport::default();
    let mut batch: Vec<StatusEvent> = Vec::with_capacity(config.batch_size);
    let mut interval = tokio::time::interval(config.flush_interval);
    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= config.batch_size {
                        flush(&store, &config, &mut batch, &mut report).await;
                    }
                }
                None => break,
            },
            _ = interval.tick() => {
                if !batch.is_empty() {
                    flush(&store, &config, &mut batch, &mut report).await;
                }
            }
        }
    }
    while !batch.is_empty() {
        flush(&store, &config, &mut batch, &mut report).await;
    }
    log::debug!(
        "Status flush finished: {} flushed, {} dropped",
        report.flushed,
        report.dropped
    );
    report
}

/// Writes up to `batch_size` events of `batch` upstream.
async fn flush(
    store: &StoreRef,
    config: &StatusConfig,
    batch: &mut Vec<StatusEvent>,
    report: &mut FlushReport,
) {
    let count = batch.len().min(config.batch_size);
    let events: Vec<StatusEvent> = batch.drain(..count).collect();
    let mut backoff = config.initial_backoff;
    let mut attempt = 0;
    loop {
        let result =
            tokio::time::timeout(config.request_timeout, store.update_status(events.clone()))
                .await;
        let error = match result {
            Ok(Ok(())) => {
                log::trace!("Flushed {} status event(s)", events.len());
                report.flushed += events.len();
                return;
            }
            Ok(Err(error)) if error.is_transient() => error.to_string(),
            Ok(Err(error)) => {
                log::error!("Status update was rejected: {error}");
                break;
            }
            Err(_) => format!("no answer within {:?}", config.request_timeout),
        };
        if attempt >= config.max_retries {
            log::error!("Status update failed after {} attempt(s): {error}", attempt + 1);
            break;
        }
        attempt += 1;
        let delay = with_jitter(backoff);
        log::warn!("Status update failed: {error}, retrying in {delay:?}");
        tokio::time::sleep(delay).await;
        backoff = (backoff * 2).min(config.max_backoff);
    }

    let jobs: Vec<String> = events.iter().map(|event| event.job_id.to_string()).collect();
    log::error!("{}", GantryError::StatusLost(jobs.join(", ")));
    report.record_lost(&events);
}

/// Adds up to 25% of random delay, so that launchers do not retry in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 4;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::job::JobState;
    use crate::store::MemoryStore;
    use crate::tests::utils::{JobBuilder, init_logging};

    fn config() -> StatusConfig {
        StatusConfig {
            channel_capacity: 16,
            enqueue_timeout: Duration::from_millis(50),
            batch_size: 2,
            flush_interval: Duration::from_secs(3600),
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            request_timeout: Duration::from_secs(1),
        }
    }

    fn store_with_jobs(count: usize) -> (Arc<MemoryStore>, Vec<JobId>) {
        init_logging();
        let store = Arc::new(MemoryStore::new());
        let ids = (0..count)
            .map(|_| store.add_job(JobBuilder::default().build()).unwrap())
            .collect();
        (store, ids)
    }

    #[tokio::test]
    async fn flush_on_batch_size() {
        let (store, jobs) = store_with_jobs(4);
        let mut aggregator = StatusAggregator::start(store.clone(), &config());
        for job in &jobs {
            assert!(aggregator.submit(StatusEvent::new(*job, JobState::Running)).await);
        }
        let report = aggregator.shutdown().await;
        assert_eq!(report.flushed, 4);
        assert!(report.is_complete());
        assert_eq!(store.status_requests(), 2);
    }

    #[tokio::test]
    async fn flush_on_interval() {
        let (store, jobs) = store_with_jobs(1);
        let mut config = config();
        config.batch_size = 100;
        config.flush_interval = Duration::from_millis(20);
        let mut aggregator = StatusAggregator::start(store.clone(), &config);
        aggregator
            .submit(StatusEvent::new(jobs[0], JobState::Running))
            .await;
        for _ in 0..100 {
            if store.status_requests() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.job(jobs[0]).unwrap().state, JobState::Running);
        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn order_is_kept_across_batches() {
        let (store, jobs) = store_with_jobs(2);
        let mut aggregator = StatusAggregator::start(store.clone(), &config());
        for state in [JobState::Running, JobState::RunDone, JobState::Postprocessed] {
            for job in &jobs {
                aggregator.submit(StatusEvent::new(*job, state)).await;
            }
        }
        let report = aggregator.shutdown().await;
        assert_eq!(report.flushed, 6);
        for job in jobs {
            let history: Vec<JobState> =
                store.history(job).into_iter().map(|event| event.state).collect();
            assert_eq!(
                history,
                vec![JobState::Running, JobState::RunDone, JobState::Postprocessed]
            );
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (store, jobs) = store_with_jobs(2);
        store.inject_failures(2);
        let mut aggregator = StatusAggregator::start(store.clone(), &config());
        for job in &jobs {
            aggregator.submit(StatusEvent::new(*job, JobState::Running)).await;
        }
        let report = aggregator.shutdown().await;
        assert_eq!(report.flushed, 2);
        assert!(report.is_complete());
        assert_eq!(store.job(jobs[1]).unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn batch_is_dropped_after_retries() {
        let (store, jobs) = store_with_jobs(3);
        store.inject_failures(4);
        let mut aggregator = StatusAggregator::start(store.clone(), &config());
        for job in &jobs {
            aggregator.submit(StatusEvent::new(*job, JobState::Running)).await;
        }
        let report = aggregator.shutdown().await;
        assert_eq!(report.flushed, 1);
        assert_eq!(report.dropped, 2);
        assert_eq!(report.lost_jobs, vec![jobs[0], jobs[1]]);
        assert_eq!(store.job(jobs[0]).unwrap().state, JobState::Preprocessed);
        assert_eq!(store.job(jobs[2]).unwrap().state, JobState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_loses_events() {
        let (store, jobs) = store_with_jobs(3);
        store.inject_failures(2);
        let mut config = config();
        config.channel_capacity = 1;
        config.batch_size = 1;
        config.initial_backoff = Duration::from_secs(10);
        config.max_backoff = Duration::from_secs(10);
        let mut aggregator = StatusAggregator::start(store.clone(), &config);

        assert!(aggregator.submit(StatusEvent::new(jobs[0], JobState::Running)).await);
        // Let the flush task take the first event and start waiting for a retry.
        tokio::task::yield_now().await;
        assert!(aggregator.submit(StatusEvent::new(jobs[1], JobState::Running)).await);
        assert!(!aggregator.submit(StatusEvent::new(jobs[2], JobState::Running)).await);

        let report = aggregator.shutdown().await;
        assert_eq!(report.flushed, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.lost_jobs, vec![jobs[2]]);
    }
}
