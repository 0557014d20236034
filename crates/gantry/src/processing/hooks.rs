use std::path::Path;
use std::time::Duration;

use gantry_exec::process::{ProcessRun, RunState};
use gantry_exec::program::{ProgramDefinition, StdioDef};

use crate::job::Job;
use crate::launcher::{GANTRY_JOB_ID, job_workdir};
use crate::processing::HookKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Succeeded,
    Failed(String),
}

/// Runs `command` of the `kind` hook in the directory of `job`.
///
/// The hook is terminated when it does not finish within `timeout`, which fails it.
pub async fn run_hook(
    job: &Job,
    kind: HookKind,
    command: &str,
    data_dir: &Path,
    timeout: Duration,
    grace_period: Duration,
) -> HookOutcome {
    let cwd = job_workdir(job, data_dir);
    if let Err(error) = std::fs::create_dir_all(&cwd) {
        return HookOutcome::Failed(format!(
            "Cannot create job directory {}: {error}",
            cwd.display()
        ));
    }
    let mut program = ProgramDefinition::shell(command, cwd);
    for (key, value) in &job.env {
        program
            .env
            .insert(key.as_str().into(), value.as_str().into());
    }
    program
        .env
        .insert(GANTRY_JOB_ID.into(), job.id.to_string().into());
    program.stdout = StdioDef::File(kind.output_file().into());
    program.stderr = StdioDef::MergeWithStdout;

    let mut run = match ProcessRun::spawn(program) {
        Ok(run) => run,
        Err(error) => return HookOutcome::Failed(error.to_string()),
    };
    log::debug!("The {kind} hook of job {} started with pid {:?}", job.id, run.pid());
    let output = |run: &ProcessRun| {
        run.stdout_path()
            .map(|path| format!(", output in {}", path.display()))
            .unwrap_or_default()
    };
    match run.wait(timeout).await {
        RunState::Exited if run.exit_code() == Some(0) => HookOutcome::Succeeded,
        RunState::TimedOut => {
            run.terminate(grace_period).await;
            HookOutcome::Failed(format!(
                "Hook did not finish within {}{}",
                humantime::format_duration(timeout),
                output(&run)
            ))
        }
        _ => HookOutcome::Failed(format!("{}{}", run.describe_exit(), output(&run))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::JobBuilder;

    async fn run(command: &str, timeout: Duration) -> (HookOutcome, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut env = crate::Map::default();
        env.insert("INPUT".to_string(), "data.h5".to_string());
        let job = JobBuilder::default()
            .workdir("hook")
            .env(env)
            .build_job();
        let outcome = run_hook(
            &job,
            HookKind::Preprocess,
            command,
            dir.path(),
            timeout,
            Duration::from_millis(100),
        )
        .await;
        (outcome, dir)
    }

    #[tokio::test]
    async fn hook_runs_in_job_directory() {
        let (outcome, dir) = run(
            "echo $INPUT $GANTRY_JOB_ID; pwd",
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome, HookOutcome::Succeeded);
        let output = std::fs::read_to_string(dir.path().join("hook/preprocess.out")).unwrap();
        let mut lines = output.lines();
        assert_eq!(lines.next(), Some("data.h5 1"));
        assert!(lines.next().unwrap().ends_with("hook"));
    }

    #[tokio::test]
    async fn failing_hook() {
        let (outcome, _dir) = run("exit 4", Duration::from_secs(5)).await;
        let HookOutcome::Failed(error) = outcome else {
            panic!("Expected a failure");
        };
        assert!(error.contains("code 4"));
        assert!(error.contains("preprocess.out"));
    }

    #[tokio::test]
    async fn hook_timeout() {
        let (outcome, _dir) = run("sleep 10", Duration::from_millis(100)).await;
        let HookOutcome::Failed(error) = outcome else {
            panic!("Expected a failure");
        };
        assert!(error.contains("did not finish within 100ms"));
    }
}
