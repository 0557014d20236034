use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::config::{ProcessingConfig, SiteConfig, StatusConfig};
use crate::feed::{FeedContext, JobFeed, PrefetchFeed};
use crate::job::{Job, JobId, SessionId, StatusEvent};
use crate::launcher::heartbeat_process;
use crate::processing::{
    HookKind, HookOutcome, PROCESSED_STATES, Step, hook_events, next_step, run_hook,
};
use crate::status::{FlushReport, StatusAggregator};
use crate::store::StoreRef;

pub struct ProcessingParams {
    pub config: ProcessingConfig,
    pub status: StatusConfig,
    pub data_dir: PathBuf,
    pub fetch_timeout: Duration,
    /// Time between SIGTERM and SIGKILL of a hook that ran out of time.
    pub grace_period: Duration,
}

impl ProcessingParams {
    pub fn new(config: &SiteConfig) -> Self {
        Self {
            config: config.processing.clone(),
            status: config.status.clone(),
            data_dir: config.data_dir(),
            fetch_timeout: config.feed.fetch_timeout,
            grace_period: config.launcher.grace_period,
        }
    }
}

#[derive(Debug)]
pub struct ProcessingOutcome {
    /// Jobs whose step was completed and reported.
    pub processed: usize,
    pub status: FlushReport,
}

/// Claims jobs around their runs and executes their hooks with bounded concurrency.
pub struct ProcessingService {
    config: ProcessingConfig,
    data_dir: PathBuf,
    grace_period: Duration,
    store: StoreRef,
    session: SessionId,
    request_timeout: Duration,
    feed: PrefetchFeed,
    status: StatusAggregator,
    processed: usize,
    heartbeat: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ProcessingService {
    pub async fn start(params: ProcessingParams, store: StoreRef) -> crate::Result<Self> {
        let ProcessingParams {
            config,
            status: status_config,
            data_dir,
            fetch_timeout,
            grace_period,
        } = params;
        let session = store.open_session(None).await?;
        log::info!(
            "Processing session {session} opened ({} worker(s))",
            config.num_workers
        );

        let feed = PrefetchFeed::start(
            FeedContext {
                store: store.clone(),
                session,
                filter_tags: config.filter_tags.clone(),
                deadline: None,
                capacity: None,
                states: PROCESSED_STATES.to_vec(),
                fetch_timeout,
            },
            config.prefetch_depth,
            config.refill_interval,
        );
        let status = StatusAggregator::start(store.clone(), &status_config);

        // The service runs no jobs, so it never offers cores.
        let (_, idle_cores) = watch::channel(0);
        let stop_heartbeat = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_process(
            store.clone(),
            session,
            idle_cores,
            config.heartbeat_interval,
            stop_heartbeat.clone(),
        ));

        Ok(Self {
            config,
            data_dir,
            grace_period,
            store,
            session,
            request_timeout: fetch_timeout,
            feed,
            status,
            processed: 0,
            heartbeat: Some((stop_heartbeat, heartbeat)),
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Processes jobs until `stop` is cancelled. Hooks that are still running at that point
    /// are killed and their jobs are released by closing the session.
    pub async fn run(mut self, stop: CancellationToken) -> ProcessingOutcome {
        let mut hooks = FuturesUnordered::new();
        loop {
            while hooks.len() < self.config.num_workers {
                let jobs = match self.feed.pop(self.config.num_workers - hooks.len()) {
                    Ok(jobs) => jobs,
                    Err(error) => {
                        log::error!("Processing is ending: {error}");
                        let abandoned = hooks.len();
                        drop(hooks);
                        return self.shutdown(abandoned).await;
                    }
                };
                if jobs.is_empty() {
                    break;
                }
                let ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
                if let Err(error) = self.feed.acknowledge(ids).await {
                    log::warn!("Cannot acknowledge jobs: {error}");
                }
                for job in jobs {
                    let policy = self.config.policy(job.app.as_deref());
                    match next_step(&job, &policy) {
                        Some(Step::Hook {
                            kind,
                            command: Some(command),
                        }) => hooks.push(hook_task(
                            job,
                            kind,
                            command,
                            self.data_dir.clone(),
                            self.config.hook_timeout,
                            self.grace_period,
                        )),
                        Some(Step::Hook {
                            kind,
                            command: None,
                        }) => {
                            self.report(hook_events(&job, kind, &HookOutcome::Succeeded))
                                .await
                        }
                        Some(Step::Report(event)) => self.report(vec![event]).await,
                        None => log::warn!("Job {} in state {} was skipped", job.id, job.state),
                    }
                }
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                Some((job, kind, outcome)) = hooks.next(), if !hooks.is_empty() => {
                    if let HookOutcome::Failed(error) = &outcome {
                        log::warn!("The {kind} hook of job {} failed: {error}", job.id);
                    }
                    self.report(hook_events(&job, kind, &outcome)).await;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        let abandoned = hooks.len();
        drop(hooks);
        self.shutdown(abandoned).await
    }

    async fn report(&mut self, events: Vec<StatusEvent>) {
        if let Some(event) = events.first() {
            log::debug!("Job {} processed, reporting {}", event.job_id, event.state);
        }
        for event in events {
            self.status.submit(event).await;
        }
        self.processed += 1;
    }

    async fn shutdown(mut self, abandoned: usize) -> ProcessingOutcome {
        if abandoned > 0 {
            log::info!("Killed {abandoned} running hook(s)");
        }
        if let Some((stop, handle)) = self.heartbeat.take() {
            stop.cancel();
            if let Err(error) = handle.await {
                log::warn!("Heartbeat task failed: {error}");
            }
        }
        if let Err(error) = self.feed.close().await {
            log::warn!("Cannot close the job feed: {error}");
        }
        let status = self.status.shutdown().await;
        if !status.is_complete() {
            log::error!(
                "Status of {} job(s) was not delivered: {:?}",
                status.lost_jobs.len(),
                status.lost_jobs
            );
        }
        match tokio::time::timeout(self.request_timeout, self.store.close_session(self.session))
            .await
        {
            Ok(Ok(())) => log::debug!("Session {} closed", self.session),
            Ok(Err(error)) => log::warn!("Cannot close session {}: {error}", self.session),
            Err(_) => log::warn!("Closing session {} did not finish in time", self.session),
        }
        log::info!(
            "Processing finished: {} job(s) processed, {} status update(s) delivered",
            self.processed,
            status.flushed
        );
        ProcessingOutcome {
            processed: self.processed,
            status,
        }
    }
}

async fn hook_task(
    job: Job,
    kind: HookKind,
    command: String,
    data_dir: PathBuf,
    timeout: Duration,
    grace_period: Duration,
) -> (Job, HookKind, HookOutcome) {
    let outcome = run_hook(&job, kind, &command, &data_dir, timeout, grace_period).await;
    (job, kind, outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::Map;
    use crate::common::config::{AppPolicy, RecoveryAction};
    use crate::job::JobState;
    use crate::store::{JobStore, MemoryStore};
    use crate::tests::utils::{JobBuilder, init_logging};

    struct TestEnv {
        store: Arc<MemoryStore>,
        dir: tempfile::TempDir,
    }

    impl TestEnv {
        fn new() -> Self {
            init_logging();
            Self {
                store: Arc::new(MemoryStore::new()),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn add(&self, job: JobBuilder) -> JobId {
            self.store.add_job(job.build()).unwrap()
        }

        /// Moves a job to `states` as if a launcher ran it.
        async fn advance(&self, job: JobId, states: &[JobState]) {
            let events = states
                .iter()
                .map(|state| StatusEvent::new(job, *state))
                .collect();
            self.store.update_status(events).await.unwrap();
        }

        fn params(&self, apps: Map<String, AppPolicy>) -> ProcessingParams {
            ProcessingParams {
                config: ProcessingConfig {
                    num_workers: 2,
                    prefetch_depth: 10,
                    refill_interval: Duration::from_millis(20),
                    hook_timeout: Duration::from_secs(5),
                    heartbeat_interval: Duration::from_millis(50),
                    poll_interval: Duration::from_millis(20),
                    filter_tags: Default::default(),
                    apps,
                },
                status: StatusConfig {
                    batch_size: 10,
                    flush_interval: Duration::from_millis(20),
                    ..Default::default()
                },
                data_dir: self.dir.path().to_path_buf(),
                fetch_timeout: Duration::from_secs(1),
                grace_period: Duration::from_millis(100),
            }
        }

        /// Runs the service until every job reached one of the `expected` states.
        async fn process(&self, apps: Map<String, AppPolicy>, expected: &[(JobId, JobState)]) {
            let service = ProcessingService::start(self.params(apps), self.store.clone())
                .await
                .unwrap();
            let stop = CancellationToken::new();
            let handle = tokio::spawn(service.run(stop.clone()));
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while !expected
                .iter()
                .all(|(job, state)| self.store.job(*job).unwrap().state == *state)
            {
                assert!(tokio::time::Instant::now() < deadline, "Jobs were not processed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            stop.cancel();
            let outcome = handle.await.unwrap();
            assert!(outcome.status.is_complete());
        }

        fn states(&self, job: JobId) -> Vec<JobState> {
            self.store
                .history(job)
                .into_iter()
                .map(|event| event.state)
                .collect()
        }
    }

    fn app(policy: AppPolicy) -> Map<String, AppPolicy> {
        let mut apps = Map::default();
        apps.insert("sim".to_string(), policy);
        apps
    }

    #[tokio::test]
    async fn jobs_without_hooks_are_moved_on() {
        let env = TestEnv::new();
        let staged = env.add(JobBuilder::default().state(JobState::StagedIn));
        let done = env.add(JobBuilder::default());
        let failed = env.add(JobBuilder::default());
        let timed_out = env.add(JobBuilder::default());
        let waiting = env.add(JobBuilder::default());
        env.advance(done, &[JobState::Running, JobState::RunDone]).await;
        env.advance(failed, &[JobState::Running, JobState::RunError]).await;
        env.advance(timed_out, &[JobState::Running, JobState::RunTimeout])
            .await;

        env.process(
            Map::default(),
            &[
                (staged, JobState::Preprocessed),
                (done, JobState::JobFinished),
                (failed, JobState::Failed),
                (timed_out, JobState::RestartReady),
            ],
        )
        .await;

        assert_eq!(env.states(staged), vec![JobState::Preprocessed]);
        assert_eq!(
            env.states(done),
            vec![
                JobState::Running,
                JobState::RunDone,
                JobState::Postprocessed,
                JobState::JobFinished
            ]
        );
        assert_eq!(env.store.job(timed_out).unwrap().num_restarts, 1);
        assert_eq!(env.store.job(waiting).unwrap().state, JobState::Preprocessed);
        assert!(env.states(waiting).is_empty());
        for job in [staged, done, failed, timed_out, waiting] {
            assert_eq!(env.store.locked_by(job), None);
        }
    }

    #[tokio::test]
    async fn hooks_run_in_job_directory() {
        let env = TestEnv::new();
        let staged = env.add(
            JobBuilder::default()
                .app("sim")
                .workdir("staged")
                .state(JobState::StagedIn),
        );
        let done = env.add(JobBuilder::default().app("sim").workdir("done"));
        env.advance(done, &[JobState::Running, JobState::RunDone]).await;

        let policy = AppPolicy {
            preprocess: Some("echo prepared > input.txt".to_string()),
            postprocess: Some("echo $GANTRY_JOB_ID".to_string()),
            ..Default::default()
        };
        env.process(
            app(policy),
            &[(staged, JobState::Preprocessed), (done, JobState::JobFinished)],
        )
        .await;

        let input = std::fs::read_to_string(env.dir.path().join("staged/input.txt")).unwrap();
        assert_eq!(input, "prepared\n");
        let output =
            std::fs::read_to_string(env.dir.path().join("done/postprocess.out")).unwrap();
        assert_eq!(output, format!("{done}\n"));
    }

    #[tokio::test]
    async fn failing_hook_fails_the_job() {
        let env = TestEnv::new();
        let staged = env.add(
            JobBuilder::default()
                .app("sim")
                .workdir("staged")
                .state(JobState::StagedIn),
        );
        let policy = AppPolicy {
            preprocess: Some("echo missing input; exit 2".to_string()),
            ..Default::default()
        };
        env.process(app(policy), &[(staged, JobState::Failed)]).await;

        let error = env.store.job(staged).unwrap().last_error.unwrap();
        assert!(error.contains("preprocess hook failed"));
        assert!(error.contains("code 2"));
        let output =
            std::fs::read_to_string(env.dir.path().join("staged/preprocess.out")).unwrap();
        assert_eq!(output, "missing input\n");
    }

    #[tokio::test]
    async fn restarts_end_in_failure() {
        let env = TestEnv::new();
        let job = env.add(JobBuilder::default().app("sim"));
        let policy = AppPolicy {
            on_error: RecoveryAction::Restart,
            max_restarts: Some(1),
            ..Default::default()
        };

        env.advance(job, &[JobState::Running, JobState::RunError]).await;
        env.process(app(policy.clone()), &[(job, JobState::RestartReady)])
            .await;
        env.advance(job, &[JobState::Running, JobState::RunError]).await;
        env.process(app(policy), &[(job, JobState::Failed)]).await;

        let job = env.store.job(job).unwrap();
        assert_eq!(job.num_restarts, 1);
        assert!(job.last_error.unwrap().contains("1 restart(s)"));
    }

    #[tokio::test]
    async fn slow_hooks_do_not_block_other_jobs() {
        let env = TestEnv::new();
        let slow = env.add(
            JobBuilder::default()
                .app("slow")
                .workdir("slow")
                .state(JobState::StagedIn),
        );
        let fast = env.add(
            JobBuilder::default()
                .app("fast")
                .workdir("fast")
                .state(JobState::StagedIn),
        );
        let mut apps = Map::default();
        apps.insert(
            "slow".to_string(),
            AppPolicy {
                preprocess: Some("sleep 10".to_string()),
                ..Default::default()
            },
        );
        apps.insert(
            "fast".to_string(),
            AppPolicy {
                preprocess: Some("true".to_string()),
                ..Default::default()
            },
        );

        env.process(apps, &[(fast, JobState::Preprocessed)]).await;

        // Stopping the service kills the hook and gives the job back.
        assert_eq!(env.store.job(slow).unwrap().state, JobState::StagedIn);
        assert_eq!(env.store.locked_by(slow), None);
    }
}
