use std::path::Path;
use std::process::Output;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::autoalloc::AutoAllocResult;

pub fn create_command(arguments: &[&str], workdir: &Path) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command.current_dir(workdir);
    command
}

pub fn check_command_output(output: Output) -> AutoAllocResult<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Runs a scheduler command and returns its trimmed stdout.
pub async fn run_command(arguments: &[&str], workdir: &Path) -> AutoAllocResult<String> {
    let program = arguments[0];
    log::debug!("Running command `{}`", arguments.join(" "));
    let output = create_command(arguments, workdir)
        .output()
        .await
        .with_context(|| format!("{program} start failed"))?;
    let output =
        check_command_output(output).with_context(|| format!("{program} execution failed"))?;
    let stdout = output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {program} output: {e:?}"))?;
    Ok(stdout.trim().to_string())
}
