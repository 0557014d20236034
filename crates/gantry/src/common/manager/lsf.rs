//! Output of the LSF `bsub` and `jobstat` commands.
use crate::Map;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsfJobState {
    Running,
    Eligible,
    /// The job will never start (e.g. invalid resource request).
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsfJobStatus {
    pub state: LsfJobState,
    pub nodes: u32,
    /// Remaining time for running jobs, requested wall time otherwise.
    pub minutes: u32,
    pub message: Option<String>,
}

/// Parses `[[[DD:]HH:]MM:]SS` into whole minutes.
pub fn parse_clock(value: &str) -> anyhow::Result<u32> {
    let parts = value
        .split(':')
        .map(|part| part.parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| anyhow::anyhow!("Invalid LSF time `{value}`: {error}"))?;
    let (days, hours, minutes, seconds) = match parts.as_slice() {
        [d, h, m, s] => (*d, *h, *m, *s),
        [h, m, s] => (0, *h, *m, *s),
        [m, s] => (0, 0, *m, *s),
        [s] => (0, 0, 0, *s),
        _ => anyhow::bail!("Invalid LSF time `{value}`"),
    };
    Ok(days * 24 * 60 + hours * 60 + minutes + (seconds + 30) / 60)
}

/// Extracts the job id from `Job <id> is submitted to queue <queue>.`
pub fn parse_bsub_output(output: &str) -> anyhow::Result<String> {
    let line = output
        .lines()
        .map(|l| l.trim())
        .find(|l| l.starts_with("Job <"))
        .ok_or_else(|| anyhow::anyhow!("Missing job id in bsub output\n{output}"))?;
    let start = "Job <".len();
    let end = line[start..]
        .find('>')
        .ok_or_else(|| anyhow::anyhow!("Malformed bsub output `{line}`"))?;
    let id = &line[start..start + end];
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        anyhow::bail!("Invalid LSF job id `{id}` in bsub output");
    }
    Ok(id.to_string())
}

/// Parses the sectioned output of `jobstat`.
///
/// ```text
/// ----- Running Jobs: 1 (batch: 4619/4625=99.87%) -----
/// JobID      User       Queue    Project    Nodes Remain     StartTime       JobName
/// 697013     user       batch    CSC388     1     19:35      01/27 16:28:13  Not_Specified
/// ----- Eligible Jobs: 1 -----
/// JobID      User       Queue    Project    Nodes Walltime   QueueTime       Priority JobName
/// 696996     user       batch    CSC388     1     20:00      01/27 16:12:21  504.00   Not_Specified
/// ----- Blocked Jobs: 0 -----
/// ```
///
/// Jobs that are not listed are no longer known to LSF.
pub fn parse_jobstat_output(output: &str) -> anyhow::Result<Map<String, LsfJobStatus>> {
    let mut result = Map::default();
    let mut section: Option<LsfJobState> = None;
    for line in output.lines().map(|l| l.trim()).filter(|l| !l.is_empty()) {
        if line.starts_with("----") {
            section = Some(if line.contains("Running") {
                LsfJobState::Running
            } else if line.contains("Eligible") {
                LsfJobState::Eligible
            } else if line.contains("Blocked") {
                LsfJobState::Blocked
            } else {
                anyhow::bail!("Unknown jobstat section `{line}`");
            });
            continue;
        }
        if line.starts_with("JobID") {
            continue;
        }
        let state = section.ok_or_else(|| anyhow::anyhow!("jobstat line outside of a section"))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            anyhow::bail!("jobstat line has {} columns: `{line}`", fields.len());
        }
        let nodes = match fields[4] {
            "-" => 0,
            n => n.parse()?,
        };
        let status = match state {
            LsfJobState::Running | LsfJobState::Eligible => LsfJobStatus {
                state,
                nodes,
                minutes: parse_clock(fields[5])?,
                message: None,
            },
            LsfJobState::Blocked => LsfJobStatus {
                state,
                nodes,
                minutes: parse_clock(fields[5]).unwrap_or(0),
                message: Some(fields[6..].join(" ")).filter(|m| !m.is_empty()),
            },
        };
        result.insert(fields[0].to_string(), status);
    }
    Ok(result)
}
