//! Site configuration, loaded once from a TOML file and passed around by reference.
use std::path::{Path, PathBuf};
use std::time::Duration;

use gantry_exec::resources::NodeDescriptor;
use serde::{Deserialize, Serialize};

use crate::Map;
use crate::common::error::GantryError;
use crate::common::manager::ManagerType;
use crate::common::utils::time::{
    deserialize_human_duration, deserialize_human_duration_opt, serialize_human_duration,
    serialize_human_duration_opt,
};
use crate::launcher::LaunchMode;

pub const GANTRY_LAUNCHER_POLL_MS: &str = "GANTRY_LAUNCHER_POLL_MS";
pub const GANTRY_CONTROLLER_PERIOD_MS: &str = "GANTRY_CONTROLLER_PERIOD_MS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    pub site: SiteSection,
    pub launcher: LauncherConfig,
    pub feed: FeedConfig,
    pub status: StatusConfig,
    pub processing: ProcessingConfig,
    pub allocation: AllocationConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteSection {
    pub name: String,
    /// Root directory of the site. Relative paths of the configuration are resolved
    /// against it.
    pub directory: PathBuf,
    /// Where job working directories live.
    pub data_dir: PathBuf,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            name: "gantry".to_string(),
            directory: PathBuf::from("."),
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    pub job_mode: LaunchMode,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub poll_interval: Duration,
    /// Maximum number of jobs requested from the feed in one iteration.
    pub max_fetch: usize,
    /// The launcher stops when less than this time remains in the allocation.
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub wall_time_margin: Duration,
    /// Time between SIGTERM and SIGKILL when a job is terminated.
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub grace_period: Duration,
    /// Exit when nothing was running or fetched for this long.
    #[serde(
        deserialize_with = "deserialize_human_duration_opt",
        serialize_with = "serialize_human_duration_opt"
    )]
    pub idle_ttl: Option<Duration>,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub heartbeat_interval: Duration,
    /// GPUs of the local host, used when no nodes are listed.
    pub gpus_per_node: u32,
    pub nodes: Vec<NodeDescriptor>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            job_mode: LaunchMode::Local,
            poll_interval: Duration::from_secs(1),
            max_fetch: 32,
            wall_time_margin: Duration::from_secs(60),
            grace_period: Duration::from_secs(10),
            idle_ttl: None,
            heartbeat_interval: Duration::from_secs(30),
            gpus_per_node: 0,
            nodes: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStrategy {
    /// A background task keeps a local buffer of claimed jobs.
    #[default]
    Prefetch,
    /// Every fetch claims jobs packed by upstream into the current idle resources.
    Sync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedConfig {
    pub strategy: FeedStrategy,
    pub prefetch_depth: usize,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub refill_interval: Duration,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub fetch_timeout: Duration,
    pub filter_tags: Map<String, String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            strategy: FeedStrategy::Prefetch,
            prefetch_depth: 64,
            refill_interval: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(10),
            filter_tags: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusConfig {
    pub channel_capacity: usize,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub enqueue_timeout: Duration,
    pub batch_size: usize,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub flush_interval: Duration,
    pub max_retries: u32,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub initial_backoff: Duration,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub max_backoff: Duration,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub request_timeout: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            enqueue_timeout: Duration::from_secs(1),
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// What happens with a job whose run ended with an error or a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Fail,
    Restart,
}

/// Hooks and recovery rules of the jobs of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppPolicy {
    /// Shell command run in the job directory before a `STAGED_IN` job becomes runnable.
    pub preprocess: Option<String>,
    /// Shell command run in the job directory after a successful run.
    pub postprocess: Option<String>,
    pub on_error: RecoveryAction,
    pub on_timeout: RecoveryAction,
    /// Restarts allowed per job, unlimited when missing.
    pub max_restarts: Option<u32>,
}

impl Default for AppPolicy {
    fn default() -> Self {
        Self {
            preprocess: None,
            postprocess: None,
            on_error: RecoveryAction::Fail,
            on_timeout: RecoveryAction::Restart,
            max_restarts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Jobs whose hooks run at the same time.
    pub num_workers: usize,
    pub prefetch_depth: usize,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub refill_interval: Duration,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub hook_timeout: Duration,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub heartbeat_interval: Duration,
    /// Longest wait between two looks into the prefetch buffer.
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub poll_interval: Duration,
    pub filter_tags: Map<String, String>,
    /// Policies by application name. Jobs of other applications use the default policy.
    pub apps: Map<String, AppPolicy>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            num_workers: 5,
            prefetch_depth: 100,
            refill_interval: Duration::from_secs(2),
            hook_timeout: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            filter_tags: Default::default(),
            apps: Default::default(),
        }
    }
}

impl ProcessingConfig {
    pub fn policy(&self, app: Option<&str>) -> AppPolicy {
        app.and_then(|app| self.apps.get(app))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocationConfig {
    pub scheduler: ManagerType,
    pub queue: String,
    pub project: String,
    pub job_name: String,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub wall_time: Duration,
    /// Submission script template. A built-in template of the scheduler is used otherwise.
    pub template: Option<PathBuf>,
    /// Command that starts the launcher inside an allocation.
    pub launcher_cmd: Option<String>,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub period: Duration,
    pub max_submission_fails: u64,
    pub max_allocation_fails: u64,
    /// Failed status checks in a row after which an allocation is considered finished.
    pub max_status_errors: u32,
    pub elastic: Option<ElasticConfig>,
    pub maintainer: Option<MaintainerConfig>,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            scheduler: ManagerType::Local,
            queue: "default".to_string(),
            project: String::new(),
            job_name: "gantry".to_string(),
            wall_time: Duration::from_secs(3600),
            template: None,
            launcher_cmd: None,
            period: Duration::from_secs(60),
            max_submission_fails: 10,
            max_allocation_fails: 3,
            max_status_errors: 10,
            elastic: None,
            maintainer: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ElasticConfig {
    pub cores_per_node: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Maximum number of allocations waiting in the batch queue.
    pub max_queued: u32,
    /// Minimum time between two scaling decisions.
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub submit_interval: Duration,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            cores_per_node: 64,
            min_nodes: 1,
            max_nodes: 16,
            max_queued: 2,
            submit_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintainerConfig {
    pub num_allocations: u32,
    pub nodes: u32,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            num_allocations: 1,
            nodes: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Rest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    pub kind: StoreKind,
    pub url: Option<String>,
    #[serde(
        deserialize_with = "deserialize_human_duration",
        serialize_with = "serialize_human_duration"
    )]
    pub timeout: Duration,
    /// JSON file with job descriptions loaded into the in-memory store.
    pub jobs_file: Option<PathBuf>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            url: None,
            timeout: Duration::from_secs(30),
            jobs_file: None,
        }
    }
}

impl SiteConfig {
    /// Loads the configuration from `path`, resolves relative paths against the directory
    /// of the file and applies environment overrides.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| {
            GantryError::ConfigError(format!(
                "Cannot read configuration file {}: {error}",
                path.display()
            ))
        })?;
        let mut config = Self::parse(&content)?;
        let base = path.parent().unwrap_or(Path::new("."));
        if config.site.directory.is_relative() {
            config.site.directory = base.join(&config.site.directory);
        }
        if let Some(path) = config.upstream.jobs_file.take() {
            config.upstream.jobs_file = Some(config.resolve(&path));
        }
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Overrides a few tuning knobs from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Some(interval) = get_duration_from_env(GANTRY_LAUNCHER_POLL_MS) {
            self.launcher.poll_interval = interval;
        }
        if let Some(period) = get_duration_from_env(GANTRY_CONTROLLER_PERIOD_MS) {
            self.allocation.period = period;
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        let error = |msg: &str| Err(GantryError::ConfigError(msg.to_string()));
        if self.allocation.elastic.is_some() && self.allocation.maintainer.is_some() {
            return error(
                "only one of `allocation.elastic` and `allocation.maintainer` can be enabled",
            );
        }
        if let Some(elastic) = &self.allocation.elastic {
            if elastic.cores_per_node == 0 {
                return error("`allocation.elastic.cores_per_node` must be positive");
            }
            if elastic.min_nodes == 0 || elastic.min_nodes > elastic.max_nodes {
                return error("`allocation.elastic` requires 0 < min_nodes <= max_nodes");
            }
        }
        if let Some(maintainer) = &self.allocation.maintainer {
            if maintainer.nodes == 0 {
                return error("`allocation.maintainer.nodes` must be positive");
            }
        }
        if self.launcher.max_fetch == 0 {
            return error("`launcher.max_fetch` must be positive");
        }
        if self.launcher.poll_interval.is_zero() {
            return error("`launcher.poll_interval` must be positive");
        }
        if self.processing.num_workers == 0 || self.processing.prefetch_depth == 0 {
            return error("`processing.num_workers` and `processing.prefetch_depth` must be positive");
        }
        if self.status.batch_size == 0 || self.status.channel_capacity == 0 {
            return error("`status.batch_size` and `status.channel_capacity` must be positive");
        }
        if self.upstream.kind == StoreKind::Rest && self.upstream.url.is_none() {
            return error("`upstream.url` is required for the REST store");
        }
        for node in &self.launcher.nodes {
            if node.cores == 0 {
                return Err(GantryError::ConfigError(format!(
                    "node {} has no cores",
                    node.hostname
                )));
            }
        }
        Ok(())
    }

    pub fn site_dir(&self) -> &Path {
        &self.site.directory
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.site.data_dir)
    }

    /// Directory into which submission scripts are written.
    pub fn submit_dir(&self) -> PathBuf {
        self.site.directory.join("qsubmit")
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.site.directory.join(path)
        }
    }
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = SiteConfig::parse("").unwrap();
        assert_eq!(config.launcher.poll_interval, Duration::from_secs(1));
        assert_eq!(config.feed.strategy, FeedStrategy::Prefetch);
        assert_eq!(config.upstream.kind, StoreKind::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_full_config() {
        let config = SiteConfig::parse(
            r#"
[site]
name = "theta"
data_dir = "/scratch/data"

[launcher]
job_mode = "mpirun"
poll_interval = "500ms"
idle_ttl = "10m"

[[launcher.nodes]]
hostname = "nid0001"
cores = 64
gpus = 4

[[launcher.nodes]]
hostname = "nid0002"
cores = 64

[feed]
strategy = "sync"
filter_tags = { experiment = "xpcs" }

[allocation]
scheduler = "slurm"
queue = "debug"
wall_time = "30m"

[allocation.elastic]
cores_per_node = 64
max_nodes = 8
submit_interval = "2m"
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.launcher.job_mode, LaunchMode::Mpirun);
        assert_eq!(config.launcher.poll_interval, Duration::from_millis(500));
        assert_eq!(config.launcher.idle_ttl, Some(Duration::from_secs(600)));
        assert_eq!(config.launcher.nodes.len(), 2);
        assert_eq!(config.launcher.nodes[0].gpus, 4);
        assert_eq!(config.launcher.nodes[1].gpus, 0);
        assert_eq!(config.feed.strategy, FeedStrategy::Sync);
        assert_eq!(config.feed.filter_tags["experiment"], "xpcs");
        assert_eq!(config.allocation.scheduler, ManagerType::Slurm);
        let elastic = config.allocation.elastic.as_ref().unwrap();
        assert_eq!(elastic.max_nodes, 8);
        assert_eq!(elastic.min_nodes, 1);
        assert_eq!(elastic.submit_interval, Duration::from_secs(120));
        assert_eq!(config.data_dir(), PathBuf::from("/scratch/data"));
    }

    #[test]
    fn processing_policies() {
        let config = SiteConfig::parse(
            r#"
[processing]
num_workers = 2
hook_timeout = "1m"

[processing.apps.xpcs]
preprocess = "./prepare.sh"
on_error = "restart"
max_restarts = 3
"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.processing.num_workers, 2);
        assert_eq!(config.processing.hook_timeout, Duration::from_secs(60));
        let xpcs = config.processing.policy(Some("xpcs"));
        assert_eq!(xpcs.preprocess.as_deref(), Some("./prepare.sh"));
        assert_eq!(xpcs.on_error, RecoveryAction::Restart);
        assert_eq!(xpcs.on_timeout, RecoveryAction::Restart);
        assert_eq!(xpcs.max_restarts, Some(3));
        assert_eq!(config.processing.policy(Some("other")), AppPolicy::default());
        assert_eq!(config.processing.policy(None).on_error, RecoveryAction::Fail);
    }

    #[test]
    fn elastic_and_maintainer_are_exclusive() {
        let config = SiteConfig::parse(
            r#"
[allocation.elastic]
[allocation.maintainer]
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(GantryError::ConfigError(_))
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(SiteConfig::parse("[launcher]\npoll = 1\n").is_err());
    }

    #[test]
    fn default_config_roundtrip() {
        let text = SiteConfig::default().to_toml().unwrap();
        let config = SiteConfig::parse(&text).unwrap();
        assert_eq!(config.status.max_backoff, Duration::from_secs(30));
        assert_eq!(config.launcher.idle_ttl, None);
    }

    #[test]
    fn load_resolves_site_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.toml");
        std::fs::write(&path, "[site]\nname = \"local\"\n").unwrap();
        let config = SiteConfig::load(&path).unwrap();
        assert_eq!(config.site_dir(), dir.path().join("."));
        assert_eq!(config.submit_dir(), dir.path().join(".").join("qsubmit"));
    }
}
