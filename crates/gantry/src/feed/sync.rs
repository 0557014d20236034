use std::time::Duration;

use gantry_exec::resources::IdleResources;

use crate::feed::{FeedContext, FeedFuture, JobFeed};
use crate::job::{Job, JobId};

/// Claims jobs on demand. Upstream packs the claimed jobs into the idle snapshot that is
/// sent with every request.
pub struct SyncFeed {
    context: FeedContext,
}

impl SyncFeed {
    pub fn new(context: FeedContext) -> Self {
        Self { context }
    }

    fn timeout(&self) -> Duration {
        self.context.fetch_timeout
    }
}

impl JobFeed for SyncFeed {
    fn fetch<'a>(
        &'a mut self,
        max_jobs: usize,
        idle: &'a IdleResources,
    ) -> FeedFuture<'a, Vec<Job>> {
        Box::pin(async move {
            if max_jobs == 0 || idle.is_trivial() {
                return Ok(vec![]);
            }
            let mut request = self.context.claim_request(max_jobs);
            request.idle = Some(idle.clone());
            let claim = self.context.store.claim(self.context.session, request);
            match tokio::time::timeout(self.timeout(), claim).await {
                Ok(Ok(jobs)) => Ok(jobs),
                Ok(Err(error)) if error.is_transient() => {
                    log::warn!("Cannot fetch jobs: {error}");
                    Ok(vec![])
                }
                Ok(Err(error)) => Err(error.into()),
                Err(_) => {
                    log::warn!("Fetching jobs did not finish within {:?}", self.timeout());
                    Ok(vec![])
                }
            }
        })
    }

    fn acknowledge(&mut self, jobs: Vec<JobId>) -> FeedFuture<'_, ()> {
        Box::pin(async move {
            if jobs.is_empty() {
                return Ok(());
            }
            let request = self.context.store.acknowledge(self.context.session, jobs);
            match tokio::time::timeout(self.timeout(), request).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => log::warn!("Cannot acknowledge jobs: {error}"),
                Err(_) => log::warn!("Acknowledgement did not finish in time"),
            }
            Ok(())
        })
    }

    fn return_jobs(&mut self, jobs: Vec<Job>) -> FeedFuture<'_, ()> {
        Box::pin(async move {
            if jobs.is_empty() {
                return Ok(());
            }
            let ids = jobs.iter().map(|job| job.id).collect();
            let request = self.context.store.release(self.context.session, ids);
            match tokio::time::timeout(self.timeout(), request).await {
                Ok(result) => Ok(result?),
                Err(_) => {
                    log::warn!("Returning jobs did not finish in time");
                    Ok(())
                }
            }
        })
    }

    fn close(&mut self) -> FeedFuture<'_, ()> {
        // Jobs are never buffered, closing the session releases everything that is left.
        Box::pin(async move { Ok(()) })
    }
}
