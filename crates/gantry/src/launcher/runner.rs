use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::future::join_all;
use gantry_exec::process::{ProcessRun, RunState};
use gantry_exec::resources::{NodeDescriptor, Reservation, ResourceError, ResourceRegistry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::Map;
use crate::common::config::{FeedConfig, LauncherConfig, SiteConfig, StatusConfig};
use crate::common::utils::time::now_monotonic;
use crate::feed::{FeedContext, JobFeed, create_feed};
use crate::job::{Job, JobId, JobState, SessionId, StatusEvent};
use crate::launcher::launch::build_program;
use crate::launcher::{ExitReason, LauncherOutcome};
use crate::status::StatusAggregator;
use crate::store::StoreRef;

/// Everything a launcher needs besides the upstream store.
pub struct LauncherParams {
    pub config: LauncherConfig,
    pub feed: FeedConfig,
    pub status: StatusConfig,
    pub data_dir: PathBuf,
    pub nodes: Vec<NodeDescriptor>,
    /// Remaining time of the allocation, unbounded when missing.
    pub wall_time: Option<Duration>,
    pub allocation: Option<String>,
}

impl LauncherParams {
    pub fn new(config: &SiteConfig, nodes: Vec<NodeDescriptor>, wall_time: Option<Duration>) -> Self {
        Self {
            config: config.launcher.clone(),
            feed: config.feed.clone(),
            status: config.status.clone(),
            data_dir: config.data_dir(),
            nodes,
            wall_time,
            allocation: None,
        }
    }
}

/// A job whose process is alive.
struct RunHandle {
    job: Job,
    run: ProcessRun,
    reservation: Reservation,
    deadline: Option<Instant>,
}

enum Dispatch {
    Started,
    /// The job was picked up, but it failed before its process could run.
    Failed,
    NoResources(Job),
}

impl Display for ExitReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Idle => f.write_str("launcher became idle"),
            ExitReason::Fatal(error) => write!(f, "launcher failed: {error}"),
            ExitReason::Stopped => f.write_str("launcher was stopped"),
            ExitReason::WallTimeExhausted => f.write_str("allocation wall time is exhausted"),
        }
    }
}

pub struct Launcher {
    config: LauncherConfig,
    data_dir: PathBuf,
    store: StoreRef,
    session: SessionId,
    request_timeout: Duration,
    registry: ResourceRegistry,
    feed: Box<dyn JobFeed>,
    status: StatusAggregator,
    runs: Map<JobId, RunHandle>,
    deadline: Option<Instant>,
    last_activity: Instant,
    jobs_started: usize,
    idle_cores: watch::Sender<u32>,
    heartbeat: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Launcher {
    /// Opens a session upstream and starts the background tasks of the launcher.
    pub async fn start(params: LauncherParams, store: StoreRef) -> crate::Result<Self> {
        let LauncherParams {
            config,
            feed: feed_config,
            status: status_config,
            data_dir,
            nodes,
            wall_time,
            allocation,
        } = params;
        if nodes.is_empty() {
            return Err(crate::Error::ConfigError(
                "The launcher has no nodes to run jobs on".to_string(),
            ));
        }
        let registry = ResourceRegistry::new(&nodes);
        let session = store.open_session(allocation.clone()).await?;
        log::info!(
            "Launcher session {session} opened (allocation {}, {} node(s), mode {})",
            allocation.as_deref().unwrap_or("none"),
            nodes.len(),
            config.job_mode
        );

        let now = now_monotonic();
        let deadline = wall_time.map(|time| now + time);
        let capacity = registry.idle()?;
        let feed = create_feed(
            &feed_config,
            FeedContext {
                store: store.clone(),
                session,
                filter_tags: feed_config.filter_tags.clone(),
                deadline: deadline
                    .map(|deadline| deadline.checked_sub(config.wall_time_margin).unwrap_or(now)),
                capacity: Some(capacity.clone()),
                states: vec![],
                fetch_timeout: feed_config.fetch_timeout,
            },
        );
        let status = StatusAggregator::start(store.clone(), &status_config);

        let (idle_cores, idle_receiver) = watch::channel(capacity.total_free_cores());
        let stop_heartbeat = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_process(
            store.clone(),
            session,
            idle_receiver,
            config.heartbeat_interval,
            stop_heartbeat.clone(),
        ));

        Ok(Self {
            config,
            data_dir,
            store,
            session,
            request_timeout: feed_config.fetch_timeout,
            registry,
            feed,
            status,
            runs: Default::default(),
            deadline,
            last_activity: now,
            jobs_started: 0,
            idle_cores,
            heartbeat: Some((stop_heartbeat, heartbeat)),
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Runs jobs until the launcher is stopped, becomes idle, runs out of wall time or
    /// hits a fatal error. Every job that is still running at that point is terminated.
    pub async fn run(mut self, stop: CancellationToken) -> LauncherOutcome {
        let reason = self.main_loop(&stop).await;
        match &reason {
            ExitReason::Fatal(_) => log::error!("Launcher is ending: {reason}"),
            _ => log::info!("Launcher is ending: {reason}"),
        }
        self.shutdown(reason).await
    }

    async fn main_loop(&mut self, stop: &CancellationToken) -> ExitReason {
        loop {
            if stop.is_cancelled() {
                return ExitReason::Stopped;
            }
            if self.wall_time_exhausted() {
                return ExitReason::WallTimeExhausted;
            }
            let progress = match self.iteration().await {
                Ok(progress) => progress,
                Err(error) if error.is_fatal() => return ExitReason::Fatal(error.to_string()),
                Err(error) => {
                    log::warn!("Launcher iteration failed: {error}");
                    false
                }
            };
            if self.idle_expired() {
                return ExitReason::Idle;
            }
            if progress {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// Reaps finished jobs and fills the freed resources. Returns true if any job
    /// finished or started.
    async fn iteration(&mut self) -> crate::Result<bool> {
        let reaped = self.reap().await?;
        let started = self.refill().await?;
        if !self.runs.is_empty() {
            self.last_activity = now_monotonic();
        }
        self.idle_cores
            .send_replace(self.registry.idle()?.total_free_cores());
        Ok(reaped + started > 0)
    }

    fn wall_time_exhausted(&self) -> bool {
        self.deadline.is_some_and(|deadline| {
            deadline.saturating_duration_since(now_monotonic()) <= self.config.wall_time_margin
        })
    }

    fn idle_expired(&self) -> bool {
        self.runs.is_empty()
            && self.config.idle_ttl.is_some_and(|ttl| {
                now_monotonic().saturating_duration_since(self.last_activity) >= ttl
            })
    }

    async fn reap(&mut self) -> crate::Result<usize> {
        let now = now_monotonic();
        let mut finished = Vec::new();
        let mut expired = Vec::new();
        for (job_id, handle) in self.runs.iter_mut() {
            if handle.run.poll().is_terminal() {
                finished.push(*job_id);
            } else if handle.deadline.is_some_and(|deadline| now >= deadline) {
                expired.push(*job_id);
            }
        }

        let count = finished.len() + expired.len();
        let mut result: crate::Result<()> = Ok(());
        for job_id in finished {
            if let Some(handle) = self.runs.remove(&job_id) {
                let finished = self.finish_run(handle, None).await;
                result = result.and(finished);
            }
        }
        if !expired.is_empty() {
            let mut handles: Vec<RunHandle> = expired
                .iter()
                .filter_map(|job_id| self.runs.remove(job_id))
                .collect();
            let grace_period = self.config.grace_period;
            join_all(handles.iter_mut().map(|handle| {
                log::info!("Job {} exceeded its wall time, terminating it", handle.job.id);
                handle.run.terminate(grace_period)
            }))
            .await;
            for handle in handles {
                let note = format!(
                    "Job exceeded its wall time of {} minute(s)",
                    handle.job.wall_time_min.unwrap_or_default()
                );
                let finished = self.finish_run(handle, Some(&note)).await;
                result = result.and(finished);
            }
        }
        result.map(|_| count)
    }

    /// Reports the end of a run and returns its resources.
    async fn finish_run(&mut self, handle: RunHandle, interrupted: Option<&str>) -> crate::Result<()> {
        let RunHandle {
            job,
            run,
            reservation,
            ..
        } = handle;
        let event = completion_event(job.id, &run, interrupted);
        log::debug!(
            "Job {} finished as {}: {}",
            job.id,
            event.state,
            run.describe_exit()
        );
        self.status.submit(event).await;
        self.release(reservation)
    }

    fn release(&self, reservation: Reservation) -> crate::Result<()> {
        self.registry.release(reservation)?;
        self.registry.check_consistency()?;
        Ok(())
    }

    /// Fetches jobs that fit into the idle resources and starts them.
    async fn refill(&mut self) -> crate::Result<usize> {
        let idle = self.registry.idle()?;
        if idle.is_trivial() {
            return Ok(0);
        }
        let jobs = self.feed.fetch(self.config.max_fetch, &idle).await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        self.last_activity = now_monotonic();

        let mut started = 0;
        let mut picked = Vec::with_capacity(jobs.len());
        let mut returned = Vec::new();
        for job in jobs {
            if self.runs.contains_key(&job.id) {
                log::warn!("Job {} is already running, ignoring it", job.id);
                continue;
            }
            let job_id = job.id;
            match self.dispatch(job).await? {
                Dispatch::Started => {
                    started += 1;
                    picked.push(job_id);
                }
                Dispatch::Failed => picked.push(job_id),
                Dispatch::NoResources(job) => returned.push(job),
            }
        }
        if !returned.is_empty() {
            log::debug!("Returning {} job(s) that do not fit anymore", returned.len());
            if let Err(error) = self.feed.return_jobs(returned).await {
                log::warn!("Cannot return jobs: {error}");
            }
        }
        self.feed.acknowledge(picked).await?;
        Ok(started)
    }

    async fn dispatch(&mut self, mut job: Job) -> crate::Result<Dispatch> {
        let reservation = match self.registry.reserve(&job.footprint) {
            Ok(reservation) => reservation,
            Err(ResourceError::InsufficientResources(_)) => return Ok(Dispatch::NoResources(job)),
            Err(ResourceError::InvalidFootprint(footprint, reason)) => {
                log::warn!("Job {} has an invalid footprint {footprint}: {reason}", job.id);
                let event = StatusEvent::new(job.id, JobState::Failed)
                    .with_error(format!("Invalid resource request {footprint}: {reason}"));
                self.status.submit(event).await;
                return Ok(Dispatch::Failed);
            }
            Err(error) => return Err(error.into()),
        };

        self.status
            .submit(StatusEvent::new(job.id, JobState::Running))
            .await;
        job.state = JobState::Running;

        let run = build_program(
            &job,
            &reservation,
            &self.registry,
            self.config.job_mode,
            &self.data_dir,
        )
        .and_then(|program| {
            std::fs::create_dir_all(&program.cwd)?;
            Ok(ProcessRun::spawn(program)?)
        });
        match run {
            Ok(run) => {
                log::debug!(
                    "Job {} started with pid {:?} on {} node(s)",
                    job.id,
                    run.pid(),
                    reservation.slots().len()
                );
                let deadline = job.wall_time().map(|time| now_monotonic() + time);
                self.jobs_started += 1;
                self.runs.insert(
                    job.id,
                    RunHandle {
                        job,
                        run,
                        reservation,
                        deadline,
                    },
                );
                Ok(Dispatch::Started)
            }
            Err(error) => {
                log::warn!("Cannot start job {}: {error}", job.id);
                let event =
                    StatusEvent::new(job.id, JobState::RunError).with_error(error.to_string());
                self.status.submit(event).await;
                self.release(reservation)?;
                Ok(Dispatch::Failed)
            }
        }
    }

    async fn shutdown(mut self, reason: ExitReason) -> LauncherOutcome {
        if let Some((stop, handle)) = self.heartbeat.take() {
            stop.cancel();
            if let Err(error) = handle.await {
                log::warn!("Heartbeat task failed: {error}");
            }
        }

        let mut handles: Vec<RunHandle> = self.runs.drain().map(|(_, handle)| handle).collect();
        if !handles.is_empty() {
            log::info!("Terminating {} running job(s)", handles.len());
            let grace_period = self.config.grace_period;
            join_all(
                handles
                    .iter_mut()
                    .map(|handle| handle.run.terminate(grace_period)),
            )
            .await;
        }
        let note = format!("Interrupted because the {reason}");
        for handle in handles {
            let job_id = handle.job.id;
            if let Err(error) = self.finish_run(handle, Some(&note)).await {
                log::error!("Cannot finish job {job_id}: {error}");
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
            "Launcher finished: {} job(s) started, {} status update(s) delivered",
            self.jobs_started,
            status.flushed
        );
        LauncherOutcome {
            reason,
            status,
            jobs_started: self.jobs_started,
        }
    }
}

/// Maps how a process ended to the state reported upstream.
fn completion_event(job_id: JobId, run: &ProcessRun, interrupted: Option<&str>) -> StatusEvent {
    let output = run
        .stdout_path()
        .map(|path| format!(", output in {}", path.display()))
        .unwrap_or_default();
    match run.state() {
        RunState::Exited if run.exit_code() == Some(0) => {
            StatusEvent::new(job_id, JobState::RunDone).with_return_code(Some(0))
        }
        RunState::Exited => StatusEvent::new(job_id, JobState::RunError)
            .with_error(format!("{}{output}", run.describe_exit()))
            .with_return_code(run.exit_code()),
        RunState::TimedOut | RunState::Terminated => {
            let reason = interrupted
                .map(|reason| reason.to_string())
                .unwrap_or_else(|| run.describe_exit());
            StatusEvent::new(job_id, JobState::RunTimeout)
                .with_error(format!("{reason}{output}"))
                .with_return_code(run.exit_code())
        }
        RunState::Error | RunState::NotStarted | RunState::Running => {
            StatusEvent::new(job_id, JobState::RunError).with_error(run.describe_exit())
        }
    }
}

/// Periodically reports the idle cores of a session to upstream.
pub(crate) async fn heartbeat_process(
    store: StoreRef,
    session: SessionId,
    idle_cores: watch::Receiver<u32>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let idle = *idle_cores.borrow();
        match tokio::time::timeout(interval, store.tick_session(session, idle)).await {
            Ok(Ok(())) => log::trace!("Heartbeat of session {session}: {idle} idle core(s)"),
            Ok(Err(error)) => log::warn!("Session heartbeat failed: {error}"),
            Err(_) => log::warn!("Session heartbeat did not finish within {interval:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Utc};
    use gantry_exec::resources::{Footprint, IdleResources};

    use super::*;
    use crate::common::config::FeedStrategy;
    use crate::feed::FeedFuture;
    use crate::launcher::LaunchMode;
    use crate::store::MemoryStore;
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

        fn params(&self, cores: u32) -> LauncherParams {
            LauncherParams {
                config: LauncherConfig {
                    job_mode: LaunchMode::Local,
                    poll_interval: Duration::from_millis(20),
                    grace_period: Duration::from_millis(200),
                    idle_ttl: Some(Duration::from_millis(300)),
                    heartbeat_interval: Duration::from_millis(50),
                    ..Default::default()
                },
                feed: FeedConfig {
                    strategy: FeedStrategy::Sync,
                    fetch_timeout: Duration::from_secs(1),
                    ..Default::default()
                },
                status: StatusConfig {
                    batch_size: 10,
                    flush_interval: Duration::from_millis(20),
                    ..Default::default()
                },
                data_dir: self.dir.path().to_path_buf(),
                nodes: vec![NodeDescriptor::new("localhost", cores, 0)],
                wall_time: None,
                allocation: Some("alloc-1".to_string()),
            }
        }

        async fn launcher(&self, cores: u32) -> Launcher {
            Launcher::start(self.params(cores), self.store.clone())
                .await
                .unwrap()
        }

        fn states(&self, job: JobId) -> Vec<JobState> {
            self.store
                .history(job)
                .into_iter()
                .map(|event| event.state)
                .collect()
        }

        fn timestamp(&self, job: JobId, state: JobState) -> DateTime<Utc> {
            self.store
                .history(job)
                .into_iter()
                .find(|event| event.state == state)
                .map(|event| event.timestamp)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn runs_jobs_until_idle() {
        let env = TestEnv::new();
        let ok = env.add(JobBuilder::default().command("echo hello").workdir("ok"));
        let failing = env.add(JobBuilder::default().command("exit 3").workdir("failing"));

        let outcome = env.launcher(4).await.run(CancellationToken::new()).await;
        assert_eq!(outcome.reason, ExitReason::Idle);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.jobs_started, 2);

        assert_eq!(env.states(ok), vec![JobState::Running, JobState::RunDone]);
        let output = std::fs::read_to_string(env.dir.path().join("ok/job.out")).unwrap();
        assert_eq!(output, "hello\n");

        assert_eq!(env.states(failing), vec![JobState::Running, JobState::RunError]);
        let job = env.store.job(failing).unwrap();
        let error = job.last_error.unwrap();
        assert!(error.contains("code 3"));
        assert!(error.contains("job.out"));
        let last = env.store.history(failing).pop().unwrap();
        assert_eq!(last.return_code, Some(3));
    }

    #[tokio::test]
    async fn jobs_are_packed_onto_free_cores() {
        let env = TestEnv::new();
        let jobs: Vec<JobId> = (0..3)
            .map(|index| {
                env.add(
                    JobBuilder::default()
                        .command("sleep 0.3")
                        .cores_per_rank(2)
                        .workdir(format!("job{index}")),
                )
            })
            .collect();

        let outcome = env.launcher(4).await.run(CancellationToken::new()).await;
        assert_eq!(outcome.jobs_started, 3);
        for job in &jobs {
            assert_eq!(env.states(*job), vec![JobState::Running, JobState::RunDone]);
        }

        let mut by_start = jobs.clone();
        by_start.sort_by_key(|job| env.timestamp(*job, JobState::Running));
        let first_done = by_start[..2]
            .iter()
            .map(|job| env.timestamp(*job, JobState::RunDone))
            .min()
            .unwrap();
        // Two jobs run concurrently, the third one starts only after one of them ends.
        assert!(env.timestamp(by_start[1], JobState::Running) < first_done);
        let third_start = env.timestamp(by_start[2], JobState::Running);
        assert!(third_start >= first_done);
        assert!((third_start - first_done).num_milliseconds() < 500);
    }

    #[tokio::test]
    async fn nothing_is_fetched_without_free_cores() {
        let env = TestEnv::new();
        let job = env.add(JobBuilder::default().cores_per_rank(4));
        let mut launcher = env.launcher(4).await;
        let blocker = launcher.registry.reserve(&Footprint::cores(4)).unwrap();

        assert!(!launcher.iteration().await.unwrap());
        assert!(env.store.history(job).is_empty());
        assert_eq!(env.store.locked_by(job), None);

        launcher.registry.release(blocker).unwrap();
        assert!(launcher.iteration().await.unwrap());
        assert!(launcher.runs.contains_key(&job));
        launcher.run(CancellationToken::new()).await;
        assert_eq!(env.states(job), vec![JobState::Running, JobState::RunDone]);
    }

    #[tokio::test]
    async fn multi_node_job_fails_in_local_mode() {
        let env = TestEnv::new();
        let job = env.add(JobBuilder::default().ranks(2).cores_per_rank(4));
        let mut params = env.params(4);
        params.nodes = vec![
            NodeDescriptor::new("nid01", 4, 0),
            NodeDescriptor::new("nid02", 4, 0),
        ];
        let launcher = Launcher::start(params, env.store.clone()).await.unwrap();
        let outcome = launcher.run(CancellationToken::new()).await;
        assert_eq!(outcome.reason, ExitReason::Idle);
        assert_eq!(outcome.jobs_started, 0);
        assert_eq!(env.states(job), vec![JobState::Running, JobState::RunError]);
        let error = env.store.job(job).unwrap().last_error.unwrap();
        assert!(error.contains("multi-node"));
    }

    #[tokio::test]
    async fn stop_terminates_jobs_ignoring_sigterm() {
        let env = TestEnv::new();
        let job = env.add(JobBuilder::default().command("trap '' TERM; sleep 30"));
        let launcher = env.launcher(2).await;
        let stop = CancellationToken::new();

        let store = env.store.clone();
        let canceller = {
            let stop = stop.clone();
            async move {
                while store.history(job).is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                stop.cancel();
            }
        };
        let start = Instant::now();
        let (outcome, _) = tokio::join!(launcher.run(stop), canceller);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.reason, ExitReason::Stopped);
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(env.states(job), vec![JobState::Running, JobState::RunTimeout]);
        let error = env.store.job(job).unwrap().last_error.unwrap();
        assert!(error.contains("stopped"));
        assert_eq!(env.store.locked_by(job), None);
    }

    #[tokio::test]
    async fn job_wall_time_is_enforced() {
        let env = TestEnv::new();
        let job = env.add(JobBuilder::default().command("trap '' TERM; sleep 30"));
        let mut launcher = env.launcher(2).await;
        assert!(launcher.iteration().await.unwrap());
        assert_eq!(launcher.registry.idle().unwrap().total_free_cores(), 1);

        launcher.runs.get_mut(&job).unwrap().deadline = Some(now_monotonic());
        let start = Instant::now();
        assert!(launcher.iteration().await.unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(launcher.runs.is_empty());
        assert_eq!(launcher.registry.live_reservations().unwrap(), 0);
        assert_eq!(launcher.registry.idle().unwrap().total_free_cores(), 2);

        let outcome = launcher.run(CancellationToken::new()).await;
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(env.states(job), vec![JobState::Running, JobState::RunTimeout]);
        let error = env.store.job(job).unwrap().last_error.unwrap();
        assert!(error.contains("wall time"));
    }

    #[tokio::test]
    async fn exhausted_wall_time_ends_the_launcher() {
        let env = TestEnv::new();
        let job = env.add(JobBuilder::default());
        let mut params = env.params(2);
        params.wall_time = Some(Duration::from_secs(30));
        params.config.wall_time_margin = Duration::from_secs(60);
        let launcher = Launcher::start(params, env.store.clone()).await.unwrap();
        let outcome = launcher.run(CancellationToken::new()).await;
        assert_eq!(outcome.reason, ExitReason::WallTimeExhausted);
        assert_eq!(outcome.exit_code(), 3);
        assert!(env.store.history(job).is_empty());
    }

    #[tokio::test]
    async fn heartbeat_reports_idle_cores() {
        let env = TestEnv::new();
        let launcher = env.launcher(3).await;
        let session = launcher.session();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(env.store.session_idle_cores(session), Some(3));
        launcher.run(CancellationToken::new()).await;
        assert_eq!(env.store.session_idle_cores(session), None);
    }

    #[tokio::test]
    async fn crashed_job_ends_with_one_error() {
        let env = TestEnv::new();
        let job = env.add(JobBuilder::default().command("kill -9 $$").cores_per_rank(2));
        let mut launcher = env.launcher(2).await;
        assert!(launcher.iteration().await.unwrap());
        for _ in 0..200 {
            if launcher.runs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            launcher.iteration().await.unwrap();
        }
        assert!(launcher.runs.is_empty());
        assert_eq!(launcher.registry.live_reservations().unwrap(), 0);
        assert_eq!(launcher.registry.idle().unwrap().total_free_cores(), 2);

        let outcome = launcher.run(CancellationToken::new()).await;
        assert_eq!(outcome.jobs_started, 1);
        assert_eq!(env.states(job), vec![JobState::Running, JobState::RunError]);
        let error = env.store.job(job).unwrap().last_error.unwrap();
        assert!(error.contains("signal 9"));
    }

    /// Hands out the same jobs for the first `repeats` fetches.
    struct RepeatingFeed {
        jobs: Vec<Job>,
        repeats: usize,
    }

    impl JobFeed for RepeatingFeed {
        fn fetch<'a>(
            &'a mut self,
            _max_jobs: usize,
            _idle: &'a IdleResources,
        ) -> FeedFuture<'a, Vec<Job>> {
            let jobs = if self.repeats > 0 {
                self.repeats -= 1;
                self.jobs.clone()
            } else {
                vec![]
            };
            Box::pin(async move { Ok(jobs) })
        }

        fn acknowledge(&mut self, _jobs: Vec<JobId>) -> FeedFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn return_jobs(&mut self, _jobs: Vec<Job>) -> FeedFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn close(&mut self) -> FeedFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn running_job_is_not_dispatched_again() {
        let env = TestEnv::new();
        let id = env.add(JobBuilder::default().command("sleep 0.3"));
        let job = env.store.job(id).unwrap();
        let mut launcher = env.launcher(4).await;
        launcher.feed = Box::new(RepeatingFeed {
            jobs: vec![job.clone(), job],
            repeats: 2,
        });

        assert!(launcher.iteration().await.unwrap());
        assert!(!launcher.iteration().await.unwrap());
        assert_eq!(launcher.runs.len(), 1);
        assert_eq!(launcher.registry.idle().unwrap().total_free_cores(), 3);

        let outcome = launcher.run(CancellationToken::new()).await;
        assert_eq!(outcome.jobs_started, 1);
        assert_eq!(env.states(id), vec![JobState::Running, JobState::RunDone]);
    }

    #[tokio::test]
    async fn oversized_jobs_do_not_block_prefetch() {
        let env = TestEnv::new();
        let big = env.add(JobBuilder::default().cores_per_rank(8));
        let small = env.add(JobBuilder::default().workdir("small"));
        let mut params = env.params(4);
        params.feed = FeedConfig {
            strategy: FeedStrategy::Prefetch,
            prefetch_depth: 1,
            refill_interval: Duration::from_millis(20),
            fetch_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let launcher = Launcher::start(params, env.store.clone()).await.unwrap();
        let outcome = launcher.run(CancellationToken::new()).await;

        assert_eq!(outcome.reason, ExitReason::Idle);
        assert_eq!(outcome.jobs_started, 1);
        assert_eq!(env.states(small), vec![JobState::Running, JobState::RunDone]);
        assert!(env.store.history(big).is_empty());
        assert_eq!(env.store.locked_by(big), None);
    }
}
