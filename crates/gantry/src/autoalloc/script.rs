//! Rendering of allocation submission scripts.
//!
//! Templates contain `%{KEY}` placeholders which are replaced by values of a
//! [`ScriptContext`].
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::autoalloc::{AutoAllocResult, BatchJob};

pub const SLURM_TEMPLATE: &str = r#"#!/bin/bash
#SBATCH --job-name=%{JOB_NAME}
#SBATCH --nodes=%{NODES}
#SBATCH --time=%{WALL_TIME_MIN}
#SBATCH --partition=%{QUEUE}
#SBATCH --account=%{PROJECT}
#SBATCH --output=%{SITE_DIR}/qsubmit/gantry-%{ALLOCATION_ID}.out
#SBATCH --error=%{SITE_DIR}/qsubmit/gantry-%{ALLOCATION_ID}.err

cd %{SITE_DIR}
export GANTRY_ALLOCATION_ID=%{ALLOCATION_ID}
%{LAUNCHER_CMD}
"#;

/// Queue, project, nodes and wall time are passed to `bsub` on the command line.
pub const LSF_TEMPLATE: &str = r#"#!/bin/bash
#BSUB -J %{JOB_NAME}

cd %{SITE_DIR}
export GANTRY_ALLOCATION_ID=%{ALLOCATION_ID}
%{LAUNCHER_CMD}
"#;

pub const LOCAL_TEMPLATE: &str = r#"#!/bin/bash
# Allocation %{ALLOCATION_ID} of %{NODES} node(s) for %{WALL_TIME_MIN} minute(s)
cd %{SITE_DIR}
export GANTRY_ALLOCATION_ID=%{ALLOCATION_ID}
exec %{LAUNCHER_CMD}
"#;

/// Values available to submission script templates.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    pub nodes: u32,
    pub wall_time_min: u32,
    pub queue: String,
    pub project: String,
    pub job_name: String,
    pub launcher_cmd: String,
    pub site_dir: PathBuf,
    pub allocation_id: String,
}

impl ScriptContext {
    pub fn new(
        allocation: &BatchJob,
        job_name: &str,
        launcher_cmd: &str,
        site_dir: &Path,
    ) -> Self {
        Self {
            nodes: allocation.nodes,
            wall_time_min: allocation.wall_time_min,
            queue: allocation.queue.clone(),
            project: allocation.project.clone(),
            job_name: job_name.to_string(),
            launcher_cmd: launcher_cmd.to_string(),
            site_dir: site_dir.to_path_buf(),
            allocation_id: allocation.id.to_string(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "NODES" => self.nodes.to_string(),
            "WALL_TIME_MIN" => self.wall_time_min.to_string(),
            "QUEUE" => self.queue.clone(),
            "PROJECT" => self.project.clone(),
            "JOB_NAME" => self.job_name.clone(),
            "LAUNCHER_CMD" => self.launcher_cmd.clone(),
            "SITE_DIR" => self.site_dir.display().to_string(),
            "ALLOCATION_ID" => self.allocation_id.clone(),
            _ => return None,
        };
        Some(value)
    }
}

/// Replaces every `%{KEY}` placeholder of `template`.
///
/// Unknown keys and unterminated placeholders are errors, a `%` that does not start
/// a placeholder is kept as it is.
pub fn render_template(template: &str, context: &ScriptContext) -> AutoAllocResult<String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("%{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| anyhow::anyhow!("Unterminated placeholder in submission template"))?;
        let key = &after[..end];
        let value = context
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Unknown placeholder `%{{{key}}}` in submission template"))?;
        output.push_str(&value);
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

/// Renders the script of `allocation` and writes it into `directory`.
pub fn write_script(
    template: &str,
    context: &ScriptContext,
    directory: &Path,
    name: &str,
) -> AutoAllocResult<PathBuf> {
    let script = render_template(template, context)?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Cannot create directory {}", directory.display()))?;
    let path = directory.join(name);
    std::fs::write(&path, script)
        .with_context(|| format!("Cannot write script into {}", path.display()))?;
    Ok(path)
}
