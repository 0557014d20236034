//! Jobs as they are exchanged with the upstream store.
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gantry_exec::resources::Footprint;
use serde::{Deserialize, Serialize};

use crate::Map;

gantry_exec::define_id_type!(JobId, u64);
gantry_exec::define_id_type!(SessionId, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    StagedIn,
    Preprocessed,
    Running,
    RunDone,
    Postprocessed,
    JobFinished,
    RunError,
    RunTimeout,
    Failed,
    RestartReady,
}

impl JobState {
    /// Jobs in these states can be claimed by a launcher.
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobState::Preprocessed | JobState::RestartReady)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, JobState::JobFinished | JobState::Failed)
    }

    /// Returns true if a job may move from `self` to `next`.
    ///
    /// Transitions are monotonic, the only way back is the restart path
    /// `RUN_ERROR | RUN_TIMEOUT -> RESTART_READY -> STAGED_IN` (or directly `RUNNING`).
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        if next == Failed {
            return !self.is_final();
        }
        matches!(
            (self, next),
            (Created, StagedIn)
                | (StagedIn, Preprocessed)
                | (Preprocessed, Running)
                | (Running, RunDone | RunError | RunTimeout)
                | (RunDone, Postprocessed)
                | (Postprocessed, JobFinished)
                | (RunError | RunTimeout, RestartReady)
                | (RestartReady, StagedIn | Running)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::StagedIn => "STAGED_IN",
            JobState::Preprocessed => "PREPROCESSED",
            JobState::Running => "RUNNING",
            JobState::RunDone => "RUN_DONE",
            JobState::Postprocessed => "POSTPROCESSED",
            JobState::JobFinished => "JOB_FINISHED",
            JobState::RunError => "RUN_ERROR",
            JobState::RunTimeout => "RUN_TIMEOUT",
            JobState::Failed => "FAILED",
            JobState::RestartReady => "RESTART_READY",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Working copy of a job. The upstream store is the system of record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub footprint: Footprint,
    /// Shell command line executed for every rank.
    pub command: String,
    #[serde(default)]
    pub env: Map<String, String>,
    /// Relative paths are resolved against the data directory of the site.
    pub workdir: PathBuf,
    pub state: JobState,
    #[serde(default)]
    pub wall_time_min: Option<u32>,
    #[serde(default)]
    pub tags: Map<String, String>,
    #[serde(default)]
    pub app: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// How many times the job went through `RESTART_READY`.
    #[serde(default)]
    pub num_restarts: u32,
}

impl Job {
    pub fn wall_time(&self) -> Option<Duration> {
        self.wall_time_min
            .map(|minutes| Duration::from_secs(minutes as u64 * 60))
    }

    /// Every tag of the filter has to be present on the job with the same value.
    pub fn matches_tags(&self, filter: &Map<String, String>) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }

    /// Jobs without a declared wall time are assumed to fit.
    pub fn fits_wall_time(&self, max_wall_time: Option<Duration>) -> bool {
        match (self.wall_time(), max_wall_time) {
            (Some(needed), Some(available)) => needed <= available,
            _ => true,
        }
    }
}

/// Describes a new job before it is registered in a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    #[serde(default)]
    pub id: Option<JobId>,
    pub command: String,
    #[serde(default = "default_ranks")]
    pub ranks: u32,
    #[serde(default = "default_cores")]
    pub cores_per_rank: u32,
    #[serde(default)]
    pub gpus_per_rank: u32,
    #[serde(default)]
    pub env: Map<String, String>,
    #[serde(default)]
    pub workdir: PathBuf,
    #[serde(default)]
    pub wall_time_min: Option<u32>,
    #[serde(default)]
    pub tags: Map<String, String>,
    #[serde(default)]
    pub app: Option<String>,
    /// Initial state, `PREPROCESSED` when missing. Jobs that should go through
    /// preprocessing start as `STAGED_IN`.
    #[serde(default)]
    pub state: Option<JobState>,
}

fn default_ranks() -> u32 {
    1
}

fn default_cores() -> u32 {
    1
}

impl JobDescription {
    pub fn footprint(&self) -> Footprint {
        Footprint::new(self.ranks, self.cores_per_rank, self.gpus_per_rank)
    }

    pub fn initial_state(&self) -> Option<JobState> {
        match self.state {
            None => Some(JobState::Preprocessed),
            Some(state @ (JobState::Created | JobState::StagedIn | JobState::Preprocessed)) => {
                Some(state)
            }
            Some(_) => None,
        }
    }
}

/// A single state transition of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub job_id: JobId,
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub return_code: Option<i32>,
}

impl StatusEvent {
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self {
            job_id,
            state,
            timestamp: Utc::now(),
            error: None,
            return_code: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_return_code(mut self, code: Option<i32>) -> Self {
        self.return_code = code;
        self
    }
}

/// Aggregated view of runnable work and idle capacity, the input of elastic scaling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BacklogSummary {
    pub runnable_jobs: u32,
    pub runnable_cores: u64,
    /// Cores of the largest runnable job.
    pub largest_job_cores: u32,
    /// Idle cores reported by live launcher sessions.
    pub idle_cores: u64,
}
