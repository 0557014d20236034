use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_exec::resources::IdleResources;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::feed::{FeedContext, FeedFuture, JobFeed};
use crate::job::{Job, JobId};
use crate::store::StoreResult;

enum FeedCommand {
    Acknowledge(Vec<JobId>),
    Release(Vec<JobId>),
}

type Buffer = Arc<Mutex<VecDeque<Job>>>;

/// Keeps a bounded local buffer of claimed jobs, topped up by a background task.
///
/// Fetching only pops from the buffer, acknowledgements and releases are forwarded to
/// the background task, so the launcher never waits for upstream.
pub struct PrefetchFeed {
    context: FeedContext,
    buffer: Buffer,
    refill: Arc<Notify>,
    commands: mpsc::UnboundedSender<FeedCommand>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchFeed {
    pub fn start(context: FeedContext, depth: usize, refill_interval: Duration) -> Self {
        let buffer: Buffer = Default::default();
        let refill = Arc::new(Notify::new());
        let (commands, receiver) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(prefetch_process(
            context.clone(),
            buffer.clone(),
            refill.clone(),
            receiver,
            stop.clone(),
            depth,
            refill_interval,
        ));
        Self {
            context,
            buffer,
            refill,
            commands,
            stop,
            handle: Some(handle),
        }
    }

    /// Number of jobs waiting in the local buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().map(|buffer| buffer.len()).unwrap_or(0)
    }

    /// Takes up to `max_jobs` buffered jobs in order, regardless of their resources.
    pub fn pop(&self, max_jobs: usize) -> crate::Result<Vec<Job>> {
        let jobs: Vec<Job> = {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| crate::Error::GenericError("Prefetch buffer is poisoned".into()))?;
            let count = max_jobs.min(buffer.len());
            buffer.drain(..count).collect()
        };
        self.refill.notify_one();
        Ok(jobs)
    }

    fn take_fitting(&self, max_jobs: usize, idle: &IdleResources) -> crate::Result<Vec<Job>> {
        let remaining_time = self.context.remaining_time();
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| crate::Error::GenericError("Prefetch buffer is poisoned".into()))?;
        let mut idle = idle.clone();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(buffer.len());
        let mut unusable = Vec::new();
        while let Some(job) = buffer.pop_front() {
            if !job.fits_wall_time(remaining_time) || !self.context.fits_capacity(&job) {
                unusable.push(job.id);
            } else if taken.len() < max_jobs && idle.consume(&job.footprint) {
                taken.push(job);
            } else {
                kept.push_back(job);
            }
        }
        *buffer = kept;
        if !unusable.is_empty() {
            log::debug!(
                "Releasing {} job(s) that no longer fit the allocation",
                unusable.len()
            );
            if self.commands.send(FeedCommand::Release(unusable)).is_err() {
                log::warn!("Prefetch task has stopped, release of unusable jobs was dropped");
            }
        }
        Ok(taken)
    }
}

impl JobFeed for PrefetchFeed {
    fn fetch<'a>(
        &'a mut self,
        max_jobs: usize,
        idle: &'a IdleResources,
    ) -> FeedFuture<'a, Vec<Job>> {
        Box::pin(async move {
            let jobs = self.take_fitting(max_jobs, idle)?;
            self.refill.notify_one();
            Ok(jobs)
        })
    }

    fn acknowledge(&mut self, jobs: Vec<JobId>) -> FeedFuture<'_, ()> {
        Box::pin(async move {
            if !jobs.is_empty() && self.commands.send(FeedCommand::Acknowledge(jobs)).is_err() {
                log::warn!("Prefetch task has stopped, acknowledgement was dropped");
            }
            Ok(())
        })
    }

    fn return_jobs(&mut self, jobs: Vec<Job>) -> FeedFuture<'_, ()> {
        Box::pin(async move {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| crate::Error::GenericError("Prefetch buffer is poisoned".into()))?;
            for job in jobs.into_iter().rev() {
                buffer.push_front(job);
            }
            Ok(())
        })
    }

    fn close(&mut self) -> FeedFuture<'_, ()> {
        Box::pin(async move {
            self.stop.cancel();
            if let Some(handle) = self.handle.take() {
                if let Err(error) = handle.await {
                    log::warn!("Prefetch task failed: {error}");
                }
            }
            let unused: Vec<JobId> = match self.buffer.lock() {
                Ok(mut buffer) => buffer.drain(..).map(|job| job.id).collect(),
                Err(_) => vec![],
            };
            if !unused.is_empty() {
                log::debug!("Releasing {} prefetched job(s)", unused.len());
                with_timeout(
                    &self.context,
                    self.context.store.release(self.context.session, unused),
                )
                .await?;
            }
            Ok(())
        })
    }
}

async fn with_timeout<T>(
    context: &FeedContext,
    future: impl Future<Output = StoreResult<T>>,
) -> crate::Result<T> {
    match tokio::time::timeout(context.fetch_timeout, future).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(crate::Error::StoreError(crate::store::StoreError::Transient(
            format!("no answer within {:?}", context.fetch_timeout),
        ))),
    }
}

async fn prefetch_process(
    context: FeedContext,
    buffer: Buffer,
    refill: Arc<Notify>,
    mut commands: mpsc::UnboundedReceiver<FeedCommand>,
    stop: CancellationToken,
    depth: usize,
    refill_interval: Duration,
) {
    let mut interval = tokio::time::interval(refill_interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                handle_command(&context, command).await;
                continue;
            }
            _ = refill.notified() => {}
            _ = interval.tick() => {}
        }
        let missing = depth.saturating_sub(buffer.lock().map(|b| b.len()).unwrap_or(depth));
        if missing == 0 {
            continue;
        }
        let request = context.claim_request(missing);
        match with_timeout(&context, context.store.claim(context.session, request)).await {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    log::debug!("Prefetched {} job(s)", jobs.len());
                    if let Ok(mut buffer) = buffer.lock() {
                        buffer.extend(jobs);
                    }
                }
            }
            Err(error) => log::warn!("Cannot prefetch jobs: {error}"),
        }
    }
    // Pending acknowledgements still have to reach upstream.
    while let Ok(command) = commands.try_recv() {
        handle_command(&context, command).await;
    }
}

async fn handle_command(context: &FeedContext, command: FeedCommand) {
    let result = match command {
        FeedCommand::Acknowledge(jobs) => {
            with_timeout(context, context.store.acknowledge(context.session, jobs)).await
        }
        FeedCommand::Release(jobs) => {
            with_timeout(context, context.store.release(context.session, jobs)).await
        }
    };
    if let Err(error) = result {
        log::warn!("Feed request failed: {error}");
    }
}
