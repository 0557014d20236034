use std::path::{Path, PathBuf};

use bstr::BString;
use gantry_exec::program::{ProgramDefinition, StdioDef};
use gantry_exec::resources::{Reservation, ResourceRegistry};

use crate::job::Job;
use crate::launcher::{GANTRY_JOB_ID, GANTRY_NODES, LaunchMode};

pub const JOB_OUTPUT_FILE: &str = "job.out";

/// Working directory of a job, relative paths live in the data directory of the site.
pub fn job_workdir(job: &Job, data_dir: &Path) -> PathBuf {
    if job.workdir.is_absolute() {
        job.workdir.clone()
    } else {
        data_dir.join(&job.workdir)
    }
}

/// Builds the command that runs `job` on the nodes of `reservation`.
pub fn build_program(
    job: &Job,
    reservation: &Reservation,
    registry: &ResourceRegistry,
    mode: LaunchMode,
    data_dir: &Path,
) -> crate::Result<ProgramDefinition> {
    let mut hosts = Vec::with_capacity(reservation.slots().len());
    for slot in reservation.slots() {
        let hostname = registry.hostname(slot.node).ok_or_else(|| {
            crate::Error::GenericError(format!("Reserved node {} is unknown", slot.node))
        })?;
        hosts.push((hostname, slot.ranks));
    }
    let cwd = job_workdir(job, data_dir);
    let footprint = reservation.footprint();

    let mut program = match mode {
        LaunchMode::Local => {
            if !reservation.is_single_node() {
                return Err(crate::Error::GenericError(format!(
                    "Job {} spans {} nodes, multi-node jobs need the `mpirun` or `srun` launch mode",
                    job.id,
                    hosts.len()
                )));
            }
            ProgramDefinition::shell(&job.command, cwd)
        }
        LaunchMode::Mpirun => {
            let host_list = hosts
                .iter()
                .map(|(host, ranks)| format!("{host}:{ranks}"))
                .collect::<Vec<_>>()
                .join(",");
            let mut args: Vec<BString> = vec![
                "mpirun".into(),
                "-n".into(),
                footprint.ranks.to_string().into(),
                "--host".into(),
                host_list.into(),
            ];
            args.extend(shell_args(&job.command));
            ProgramDefinition::new(args, cwd)
        }
        LaunchMode::Srun => {
            let node_list = hosts
                .iter()
                .map(|(host, _)| host.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let mut args: Vec<BString> = vec![
                "srun".into(),
                "-n".into(),
                footprint.ranks.to_string().into(),
                "--nodes".into(),
                hosts.len().to_string().into(),
                "--nodelist".into(),
                node_list.into(),
                "--cpus-per-task".into(),
                footprint.cores_per_rank.to_string().into(),
            ];
            if footprint.gpus_per_rank > 0 {
                args.push("--gpus-per-task".into());
                args.push(footprint.gpus_per_rank.to_string().into());
            }
            args.push("--overlap".into());
            args.extend(shell_args(&job.command));
            ProgramDefinition::new(args, cwd)
        }
    };

    for (key, value) in &job.env {
        program
            .env
            .insert(key.as_str().into(), value.as_str().into());
    }
    program
        .env
        .insert(GANTRY_JOB_ID.into(), job.id.to_string().into());
    let nodes = hosts
        .iter()
        .map(|(host, _)| host.as_str())
        .collect::<Vec<_>>()
        .join(",");
    program.env.insert(GANTRY_NODES.into(), nodes.into());
    program.env.insert(
        "OMP_NUM_THREADS".into(),
        footprint.cores_per_rank.to_string().into(),
    );
    // Device indices are only meaningful when every rank sees the same node.
    if let [slot] = reservation.slots() {
        if !slot.gpus.is_empty() {
            let devices = slot
                .gpus
                .iter()
                .map(|gpu| gpu.to_string())
                .collect::<Vec<_>>()
                .join(",");
            program
                .env
                .insert("CUDA_VISIBLE_DEVICES".into(), devices.into());
        }
    }

    program.stdout = StdioDef::File(PathBuf::from(JOB_OUTPUT_FILE));
    program.stderr = StdioDef::MergeWithStdout;
    Ok(program)
}

fn shell_args(command: &str) -> [BString; 3] {
    ["sh".into(), "-c".into(), command.into()]
}
