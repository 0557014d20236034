//! The launcher runs inside a batch allocation. It claims jobs from the upstream store,
//! packs them onto the nodes of the allocation, supervises their processes and reports
//! their state changes.
mod launch;
mod nodes;
mod runner;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::status::FlushReport;

pub use launch::{build_program, job_workdir};
pub use nodes::{detect_nodes, detect_wall_time};
pub use runner::{Launcher, LauncherParams};
pub(crate) use runner::heartbeat_process;

pub const GANTRY_JOB_ID: &str = "GANTRY_JOB_ID";
pub const GANTRY_NODES: &str = "GANTRY_NODES";
pub const GANTRY_ALLOCATION_ID: &str = "GANTRY_ALLOCATION_ID";

/// How the processes of a job are started on the reserved nodes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// `sh -c` on the current host. Only single node jobs can be started.
    #[default]
    Local,
    Mpirun,
    Srun,
}

impl Display for LaunchMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Local => f.write_str("local"),
            LaunchMode::Mpirun => f.write_str("mpirun"),
            LaunchMode::Srun => f.write_str("srun"),
        }
    }
}

/// Why the launcher loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Nothing ran and nothing could be fetched for the configured idle time.
    Idle,
    Fatal(String),
    Stopped,
    WallTimeExhausted,
}

#[derive(Debug)]
pub struct LauncherOutcome {
    pub reason: ExitReason,
    pub status: FlushReport,
    /// Jobs whose processes were started during the run.
    pub jobs_started: usize,
}

impl LauncherOutcome {
    pub fn exit_code(&self) -> i32 {
        match &self.reason {
            ExitReason::Idle if !self.status.is_complete() => 4,
            ExitReason::Idle => 0,
            ExitReason::Fatal(_) => 1,
            ExitReason::Stopped => 2,
            ExitReason::WallTimeExhausted => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    #[test]
    fn exit_codes() {
        let outcome = |reason, status| LauncherOutcome {
            reason,
            status,
            jobs_started: 0,
        };
        assert_eq!(outcome(ExitReason::Idle, FlushReport::default()).exit_code(), 0);
        assert_eq!(
            outcome(ExitReason::Fatal("x".into()), FlushReport::default()).exit_code(),
            1
        );
        assert_eq!(outcome(ExitReason::Stopped, FlushReport::default()).exit_code(), 2);
        assert_eq!(
            outcome(ExitReason::WallTimeExhausted, FlushReport::default()).exit_code(),
            3
        );
        let lost = FlushReport {
            flushed: 1,
            dropped: 1,
            lost_jobs: vec![JobId::new(1)],
        };
        assert_eq!(outcome(ExitReason::Idle, lost.clone()).exit_code(), 4);
        assert_eq!(outcome(ExitReason::Stopped, lost).exit_code(), 2);
    }
}
