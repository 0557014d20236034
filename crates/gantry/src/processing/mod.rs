//! The processing service moves jobs through the steps around their runs: preprocessing of
//! staged-in jobs, postprocessing of finished runs and recovery of failed or timed out runs.
//! Hooks are shell commands configured per application and executed in the job directory.
mod hooks;
mod service;

use std::fmt::{Display, Formatter};

use crate::common::config::{AppPolicy, RecoveryAction};
use crate::job::{Job, JobState, StatusEvent};

pub use hooks::{HookOutcome, run_hook};
pub use service::{ProcessingOutcome, ProcessingParams, ProcessingService};

/// States the processing service claims.
pub const PROCESSED_STATES: [JobState; 4] = [
    JobState::StagedIn,
    JobState::RunDone,
    JobState::RunError,
    JobState::RunTimeout,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Preprocess,
    Postprocess,
}

impl HookKind {
    /// States reported, in order, once the hook succeeded.
    pub fn completion_states(&self) -> &'static [JobState] {
        match self {
            HookKind::Preprocess => &[JobState::Preprocessed],
            HookKind::Postprocess => &[JobState::Postprocessed, JobState::JobFinished],
        }
    }

    /// File in the job directory that receives the output of the hook.
    pub fn output_file(&self) -> &'static str {
        match self {
            HookKind::Preprocess => "preprocess.out",
            HookKind::Postprocess => "postprocess.out",
        }
    }
}

impl Display for HookKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HookKind::Preprocess => f.write_str("preprocess"),
            HookKind::Postprocess => f.write_str("postprocess"),
        }
    }
}

/// What has to happen with a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Run the hook (if the application has one), then report its completion states.
    Hook {
        kind: HookKind,
        command: Option<String>,
    },
    Report(StatusEvent),
}

/// Decides the next step of `job`. Returns `None` for states the service does not handle.
pub fn next_step(job: &Job, policy: &AppPolicy) -> Option<Step> {
    match job.state {
        JobState::StagedIn => Some(Step::Hook {
            kind: HookKind::Preprocess,
            command: policy.preprocess.clone(),
        }),
        JobState::RunDone => Some(Step::Hook {
            kind: HookKind::Postprocess,
            command: policy.postprocess.clone(),
        }),
        JobState::RunError => Some(Step::Report(recover(job, policy, policy.on_error))),
        JobState::RunTimeout => Some(Step::Report(recover(job, policy, policy.on_timeout))),
        _ => None,
    }
}

fn recover(job: &Job, policy: &AppPolicy, action: RecoveryAction) -> StatusEvent {
    let cause = job.last_error.as_deref().unwrap_or("no error message");
    match action {
        RecoveryAction::Restart
            if policy
                .max_restarts
                .is_none_or(|max| job.num_restarts < max) =>
        {
            StatusEvent::new(job.id, JobState::RestartReady)
        }
        RecoveryAction::Restart => StatusEvent::new(job.id, JobState::Failed).with_error(format!(
            "Run ended as {} after {} restart(s): {cause}",
            job.state, job.num_restarts
        )),
        RecoveryAction::Fail => StatusEvent::new(job.id, JobState::Failed)
            .with_error(format!("Run ended as {}: {cause}", job.state)),
    }
}

/// Events reported after `kind` ran for `job`.
pub fn hook_events(job: &Job, kind: HookKind, outcome: &HookOutcome) -> Vec<StatusEvent> {
    match outcome {
        HookOutcome::Succeeded => kind
            .completion_states()
            .iter()
            .map(|state| StatusEvent::new(job.id, *state))
            .collect(),
        HookOutcome::Failed(error) => vec![
            StatusEvent::new(job.id, JobState::Failed)
                .with_error(format!("The {kind} hook failed: {error}")),
        ],
    }
}
