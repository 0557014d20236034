use std::time::Duration;

use anyhow::Context;

use crate::Map;
use crate::common::utils::time::parse_hms_time;

const SLURM_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub fn parse_slurm_datetime(datetime: &str) -> anyhow::Result<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(datetime, SLURM_DATETIME_FORMAT)
        .with_context(|| format!("Invalid Slurm datetime `{datetime}`"))
}

/// Parses `[days-]HH:MM:SS`.
fn parse_slurm_duration(value: &str) -> anyhow::Result<Duration> {
    match value.split_once('-') {
        Some((days, time)) => {
            let days: u64 = days.parse()?;
            Ok(parse_hms_time(time)? + Duration::from_secs(days * 24 * 3600))
        }
        None => parse_hms_time(value),
    }
}

fn scontrol_duration(items: &Map<&str, &str>, key: &str) -> anyhow::Result<Duration> {
    let value = items
        .get(key)
        .with_context(|| format!("{key} entry not found in scontrol output"))?;
    parse_slurm_duration(value).with_context(|| format!("Invalid {key} `{value}`"))
}

pub fn parse_remaining_timelimit(output: &str) -> anyhow::Result<Duration> {
    let items = get_scontrol_items(output);
    let run_time = scontrol_duration(&items, "RunTime")?;
    let time_limit = scontrol_duration(&items, "TimeLimit")?;
    time_limit
        .checked_sub(run_time)
        .context("Slurm reports a RunTime longer than the TimeLimit")
}

/// Remaining time of a Slurm job, from `scontrol show job <id>`.
pub async fn get_remaining_timelimit(job_id: &str) -> anyhow::Result<Duration> {
    let result = tokio::process::Command::new("scontrol")
        .args(["show", "job", job_id])
        .output()
        .await
        .context("Cannot run scontrol")?;
    let stdout = String::from_utf8_lossy(&result.stdout);
    if !result.status.success() {
        anyhow::bail!(
            "scontrol exited with {}: {}",
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        );
    }
    log::debug!("scontrol output: {}", stdout.trim());
    parse_remaining_timelimit(&stdout)
}

/// `<key>=<value>` pairs of `scontrol show job` output. Values containing `=` keep only
/// the part before the second `=`.
pub fn get_scontrol_items(output: &str) -> Map<&str, &str> {
    output
        .split_whitespace()
        .filter_map(|item| {
            let (key, value) = item.split_once('=')?;
            Some((key, value.split('=').next().unwrap_or(value)))
        })
        .collect()
}

/// Job id from `Submitted batch job <id>`.
pub fn parse_sbatch_output(output: &str) -> anyhow::Result<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Submitted batch job "))
        .filter_map(|rest| rest.split_whitespace().next())
        .next()
        .map(str::to_string)
        .with_context(|| format!("Missing job id in sbatch output\n{output}"))
}
