use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::Map;
use crate::autoalloc::config::{MAX_KEPT_SCRIPTS, SUBMISSION_DELAYS, script_name};
use crate::autoalloc::manager::{AllocationExternalStatus, ResourceManager};
use crate::autoalloc::policy::{ElasticDecision, elastic_decision, maintainer_deficit};
use crate::autoalloc::script::{ScriptContext, write_script};
use crate::autoalloc::state::{
    AllocationId, AllocationSource, BatchJob, BatchJobState, ControllerState, RateLimiter,
    RateLimiterStatus,
};
use crate::autoalloc::AutoAllocResult;
use crate::common::config::{AllocationConfig, SiteConfig};
use crate::common::utils::time::now_monotonic;
use crate::store::StoreRef;

/// Keeps the allocations of a site in line with its workload.
///
/// Every period the controller first reconciles its records with the batch scheduler and
/// then lets the configured policy (elastic or maintainer) submit or cancel allocations.
pub struct AllocationController {
    config: AllocationConfig,
    site_dir: PathBuf,
    submit_dir: PathBuf,
    filter_tags: Map<String, String>,
    template: String,
    launcher_cmd: String,
    store: StoreRef,
    manager: Box<dyn ResourceManager>,
    state: ControllerState,
    scripts: VecDeque<PathBuf>,
}

impl AllocationController {
    /// Creates the controller and loads the active allocations of the site from upstream.
    pub async fn new(
        config: &SiteConfig,
        store: StoreRef,
        manager: Box<dyn ResourceManager>,
        launcher_cmd: String,
    ) -> AutoAllocResult<Self> {
        let allocation = config.allocation.clone();
        let template = match &allocation.template {
            Some(path) => {
                let path = config.resolve(path);
                std::fs::read_to_string(&path).with_context(|| {
                    format!("Cannot read submission template {}", path.display())
                })?
            }
            None => manager.default_template().to_string(),
        };
        let limiter = RateLimiter::new(
            SUBMISSION_DELAYS.to_vec(),
            allocation.max_submission_fails,
            allocation.max_allocation_fails,
        );
        let mut controller = Self {
            site_dir: config.site_dir().to_path_buf(),
            submit_dir: config.submit_dir(),
            filter_tags: config.feed.filter_tags.clone(),
            config: allocation,
            template,
            launcher_cmd,
            store,
            manager,
            state: ControllerState::new(limiter),
            scripts: VecDeque::new(),
        };
        controller.recover().await?;
        Ok(controller)
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    async fn recover(&mut self) -> AutoAllocResult<()> {
        let allocations = self
            .store
            .list_allocations(true)
            .await
            .context("Cannot load allocations from upstream")?;
        if !allocations.is_empty() {
            log::info!(
                "Recovered {} active allocation(s) from upstream",
                allocations.len()
            );
        }
        for allocation in allocations {
            self.state.add_allocation(allocation);
        }
        Ok(())
    }

    /// Runs the controller until `stop` is cancelled.
    pub async fn run(&mut self, stop: CancellationToken) {
        log::info!(
            "Queue service started ({} scheduler, period {:?})",
            self.manager.manager_type(),
            self.config.period
        );
        let mut interval = tokio::time::interval(self.config.period);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(error) = self.tick().await {
                log::error!("Queue service iteration failed: {error:?}");
            }
        }
        log::info!("Queue service stopped");
    }

    /// One period of the controller: reconciliation followed by the scaling policy.
    pub async fn tick(&mut self) -> AutoAllocResult<()> {
        self.reconcile().await;
        for allocation in self.state.remove_finished() {
            if let Some(script) = allocation.script_path {
                self.scripts.push_back(script);
            }
        }
        self.prune_scripts();

        if let Some(elastic) = self.config.elastic.clone() {
            let backlog = self
                .store
                .backlog(self.filter_tags.clone())
                .await
                .context("Cannot get backlog summary")?;
            let pending: Vec<&BatchJob> = self
                .state
                .active_allocations()
                .filter(|allocation| allocation.is_pending())
                .collect();
            let pending_cores = pending
                .iter()
                .map(|allocation| allocation.nodes as u64 * elastic.cores_per_node as u64)
                .sum();
            let since_last_change = self
                .state
                .last_change()
                .map(|time| now_monotonic().duration_since(time));
            let decision = elastic_decision(
                &elastic,
                &backlog,
                pending_cores,
                pending.len() as u32,
                since_last_change,
            );
            log::debug!("Elastic decision for {backlog:?}: {decision:?}");
            match decision {
                ElasticDecision::Submit { nodes } => {
                    self.submit(nodes, AllocationSource::Elastic).await?;
                }
                ElasticDecision::ScaleDown => self.scale_down().await,
                ElasticDecision::Wait(reason) => log::debug!("Not scaling: {reason}"),
            }
        } else if let Some(maintainer) = self.config.maintainer.clone() {
            let active = self
                .state
                .active_allocations()
                .filter(|allocation| allocation.source == AllocationSource::Maintainer)
                .count() as u32;
            for _ in 0..maintainer_deficit(&maintainer, active) {
                if !self
                    .submit(maintainer.nodes, AllocationSource::Maintainer)
                    .await?
                {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Updates local records from the batch scheduler.
    async fn reconcile(&mut self) {
        let mut stuck = vec![];
        let mut scheduler_ids: Map<String, AllocationId> = Map::default();
        for allocation in self.state.active_allocations() {
            match &allocation.scheduler_id {
                Some(scheduler_id) => {
                    scheduler_ids.insert(scheduler_id.clone(), allocation.id);
                }
                None => stuck.push(allocation.id),
            }
        }
        // Submission never completed (e.g. the previous instance crashed in between).
        for id in stuck {
            self.finish_allocation(
                id,
                true,
                Some("Submission did not complete".to_string()),
            )
            .await;
        }
        if scheduler_ids.is_empty() {
            return;
        }

        let ids: Vec<String> = scheduler_ids.keys().cloned().collect();
        let statuses = match self.manager.status(&ids).await {
            Ok(statuses) => statuses,
            Err(error) => {
                log::warn!("Cannot get status of allocations: {error:?}");
                let allocations: Vec<AllocationId> = scheduler_ids.values().copied().collect();
                for id in allocations {
                    self.on_status_error(id).await;
                }
                return;
            }
        };

        for (scheduler_id, status) in statuses {
            let Some(id) = scheduler_ids.get(&scheduler_id).copied() else {
                log::warn!("Status of unknown allocation {scheduler_id}");
                continue;
            };
            match status {
                Ok(status) => self.apply_status(id, status).await,
                Err(error) => {
                    log::warn!("Cannot get status of allocation {scheduler_id}: {error:?}");
                    self.on_status_error(id).await;
                }
            }
        }
    }

    async fn apply_status(&mut self, id: AllocationId, status: AllocationExternalStatus) {
        let Some(allocation) = self.state.get_allocation_mut(id) else {
            return;
        };
        allocation.status_error_count = 0;
        let changed = match status {
            AllocationExternalStatus::Queued => {
                if allocation.state != BatchJobState::Queued {
                    log::warn!(
                        "Allocation {id} is queued in the scheduler, but recorded as {:?}",
                        allocation.state
                    );
                    allocation.state = BatchJobState::Queued;
                    true
                } else {
                    false
                }
            }
            AllocationExternalStatus::Running { started_at } => {
                if allocation.state != BatchJobState::Running {
                    log::info!("Allocation {id} has started");
                    allocation.mark_running(started_at);
                    true
                } else {
                    false
                }
            }
            AllocationExternalStatus::Finished { failed, info } => {
                let was_running = allocation.state == BatchJobState::Running;
                log::info!(
                    "Allocation {id} has finished{}: {}",
                    if failed { " with an error" } else { "" },
                    info.as_deref().unwrap_or("no details")
                );
                allocation.mark_finished(failed, info);
                if failed {
                    self.state.limiter_mut().on_allocation_fail();
                } else if was_running {
                    self.state.limiter_mut().on_allocation_success();
                }
                true
            }
        };
        if changed {
            self.mirror(id).await;
        }
    }

    async fn on_status_error(&mut self, id: AllocationId) {
        let max_errors = self.config.max_status_errors;
        let Some(allocation) = self.state.get_allocation_mut(id) else {
            return;
        };
        allocation.status_error_count += 1;
        if allocation.status_error_count >= max_errors {
            log::error!(
                "Status of allocation {id} could not be determined {max_errors} times in a row, considering it finished"
            );
            self.finish_allocation(
                id,
                true,
                Some("Status could not be determined".to_string()),
            )
            .await;
        }
    }

    async fn finish_allocation(&mut self, id: AllocationId, failed: bool, info: Option<String>) {
        if let Some(allocation) = self.state.get_allocation_mut(id) {
            allocation.mark_finished(failed, info);
            self.mirror(id).await;
        }
    }

    /// Writes the local record of an allocation upstream.
    async fn mirror(&self, id: AllocationId) {
        let Some(allocation) = self.state.get_allocation(id) else {
            return;
        };
        if let Err(error) = self.store.update_allocation(allocation.clone()).await {
            log::warn!("Cannot update allocation {id} upstream: {error}");
        }
    }

    /// Submits a new allocation. Returns false if the submission was not attempted or failed.
    async fn submit(&mut self, nodes: u32, source: AllocationSource) -> AutoAllocResult<bool> {
        match self.state.limiter().status() {
            RateLimiterStatus::Ok => {}
            RateLimiterStatus::Wait => {
                log::debug!("Submission is rate limited");
                return Ok(false);
            }
            RateLimiterStatus::TooManyFailedSubmissions => {
                log::error!("Too many failed submissions, submitting is paused");
                return Ok(false);
            }
            RateLimiterStatus::TooManyFailedAllocations => {
                log::error!("Too many failed allocations, submitting is paused");
                return Ok(false);
            }
        }
        self.state.limiter_mut().on_submission_attempt();

        let allocation = BatchJob::new(
            nodes,
            self.config.wall_time,
            self.config.queue.clone(),
            self.config.project.clone(),
            source,
        );
        let mut allocation = self
            .store
            .create_allocation(allocation)
            .await
            .context("Cannot register allocation upstream")?;
        let id = allocation.id;

        let context = ScriptContext::new(
            &allocation,
            &self.config.job_name,
            &self.launcher_cmd,
            &self.site_dir,
        );
        let result = match write_script(&self.template, &context, &self.submit_dir, &script_name(id))
        {
            Ok(path) => {
                allocation.script_path = Some(path.clone());
                self.manager
                    .submit(&allocation, &path, &self.submit_dir)
                    .await
            }
            Err(error) => Err(error),
        };

        let submitted = match result {
            Ok(scheduler_id) => {
                log::info!(
                    "Allocation {id} with {nodes} node(s) was submitted as {scheduler_id}"
                );
                allocation.mark_queued(scheduler_id);
                self.state.limiter_mut().on_submission_success();
                self.state.on_submitted();
                true
            }
            Err(error) => {
                log::error!("Submission of allocation {id} failed: {error:?}");
                allocation.mark_finished(true, Some(format!("{error:#}")));
                self.state.limiter_mut().on_submission_fail();
                false
            }
        };
        self.state.add_allocation(allocation);
        self.mirror(id).await;
        Ok(submitted)
    }

    /// Cancels elastic allocations that did not start yet.
    async fn scale_down(&mut self) {
        let queued: Vec<(AllocationId, String)> = self
            .state
            .queued_allocations()
            .filter(|allocation| allocation.source == AllocationSource::Elastic)
            .filter_map(|allocation| Some((allocation.id, allocation.scheduler_id.clone()?)))
            .collect();
        for (id, scheduler_id) in queued {
            match self.manager.cancel(&scheduler_id).await {
                Ok(()) => {
                    log::info!("Allocation {id} was cancelled, the backlog is empty");
                    self.finish_allocation(
                        id,
                        false,
                        Some("Cancelled by the queue service".to_string()),
                    )
                    .await;
                    self.state.on_cancelled();
                }
                Err(error) => log::warn!("Cannot cancel allocation {id}: {error:?}"),
            }
        }
    }

    fn prune_scripts(&mut self) {
        while self.scripts.len() > MAX_KEPT_SCRIPTS {
            if let Some(script) = self.scripts.pop_front() {
                if let Err(error) = std::fs::remove_file(&script) {
                    log::debug!("Cannot remove {}: {error}", script.display());
                }
            }
        }
    }
}
