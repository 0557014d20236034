use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use bstr::{BString, ByteSlice};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::Map;
use crate::common::error::ExecError;

#[derive(Serialize, Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub enum StdioDef {
    #[default]
    Null,
    File(PathBuf),
    /// Only meaningful for stderr, the stream is written into the stdout file.
    MergeWithStdout,
}

impl StdioDef {
    pub fn path(&self) -> Option<&Path> {
        match self {
            StdioDef::File(path) => Some(path),
            StdioDef::Null | StdioDef::MergeWithStdout => None,
        }
    }
}

/// Everything that is needed to spawn a single external process.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProgramDefinition {
    pub args: Vec<BString>,

    #[serde(default)]
    pub env: Map<BString, BString>,

    #[serde(default)]
    pub stdout: StdioDef,

    #[serde(default)]
    pub stderr: StdioDef,

    #[serde(default)]
    pub cwd: PathBuf,
}

impl ProgramDefinition {
    pub fn new(args: Vec<BString>, cwd: PathBuf) -> Self {
        Self {
            args,
            cwd,
            ..Default::default()
        }
    }

    /// Runs `command_line` through `sh -c`.
    pub fn shell(command_line: &str, cwd: PathBuf) -> Self {
        Self::new(
            vec!["sh".into(), "-c".into(), command_line.into()],
            cwd,
        )
    }

    pub fn display_args(&self) -> String {
        self.args
            .iter()
            .map(|arg| arg.to_str_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Path of the stdout file resolved against the working directory.
    pub fn stdout_path(&self) -> Option<PathBuf> {
        self.stdout.path().map(|path| resolve_path(path, &self.cwd))
    }

    pub fn stderr_path(&self) -> Option<PathBuf> {
        match &self.stderr {
            StdioDef::File(path) => Some(resolve_path(path, &self.cwd)),
            StdioDef::MergeWithStdout => self.stdout_path(),
            StdioDef::Null => None,
        }
    }
}

fn resolve_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_relative() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Create an output stream file on the given path.
/// If the path is relative, the file will be created relative to `cwd`.
fn create_output_file(path: &Path, cwd: &Path) -> crate::Result<File> {
    let path = resolve_path(path, cwd);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            std::fs::create_dir_all(parent).map_err(|error| {
                ExecError::LaunchFailure(format!(
                    "Could not create directory {} for output stream: {error}",
                    parent.display()
                ))
            })?;
        }
    }
    File::create(&path).map_err(|error| {
        ExecError::LaunchFailure(format!(
            "Creating stream file {} failed: {error}",
            path.display()
        ))
    })
}

fn create_stdio(definition: &ProgramDefinition) -> crate::Result<(Stdio, Stdio)> {
    let (stdout, stdout_file) = match &definition.stdout {
        StdioDef::File(path) => {
            let file = create_output_file(path, &definition.cwd)?;
            let clone = file.try_clone()?;
            (Stdio::from(file), Some(clone))
        }
        StdioDef::Null | StdioDef::MergeWithStdout => (Stdio::null(), None),
    };
    let stderr = match &definition.stderr {
        StdioDef::File(path) => Stdio::from(create_output_file(path, &definition.cwd)?),
        StdioDef::MergeWithStdout => match stdout_file {
            Some(file) => Stdio::from(file),
            None => Stdio::null(),
        },
        StdioDef::Null => Stdio::null(),
    };
    Ok((stdout, stderr))
}

pub fn command_from_definition(definition: &ProgramDefinition) -> crate::Result<Command> {
    if definition.args.is_empty() {
        return Err(ExecError::LaunchFailure("No command arguments".to_string()));
    }

    let mut command = Command::new(definition.args[0].to_os_str_lossy());

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            // A separate session (and thus process group) lets us signal the whole
            // process tree without also signalling the daemon itself.
            if let Err(error) = nix::unistd::setsid() {
                log::error!("Cannot set SID for process: {error:?}");
            }
            #[cfg(target_os = "linux")]
            {
                // Send SIGTERM to the process when the daemon dies.
                let ret = nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, nix::libc::SIGTERM);
                if ret != 0 {
                    log::error!("Cannot set PR_SET_PDEATHSIG for process: {ret}");
                }
            }
            Ok(())
        });
    }

    command.kill_on_drop(true);
    command.args(definition.args[1..].iter().map(|x| x.to_os_str_lossy()));

    if !definition.cwd.as_os_str().is_empty() {
        if !definition.cwd.is_dir() {
            std::fs::create_dir_all(&definition.cwd).map_err(|error| {
                ExecError::LaunchFailure(format!(
                    "Could not create working directory {}: {error}",
                    definition.cwd.display()
                ))
            })?;
        }
        command.current_dir(&definition.cwd);
    }

    let (stdout, stderr) = create_stdio(definition)?;
    command.stdout(stdout);
    command.stderr(stderr);
    command.stdin(Stdio::null());

    for (k, v) in definition.env.iter() {
        command.env(k.to_os_str_lossy(), v.to_os_str_lossy());
    }

    Ok(command)
}

/// Provide a more detailed error message when a process fails to be spawned.
pub(crate) fn map_spawn_error(error: std::io::Error, program: &ProgramDefinition) -> ExecError {
    let context = match error.kind() {
        ErrorKind::NotFound => {
            let file = program.args[0].to_str_lossy();
            let mut msg =
                format!("\nThe program that you have tried to execute (`{file}`) was not found.");
            let path = Path::new(file.as_ref());
            if path.components().count() == 1 && program.cwd.join(path).is_file() {
                msg.push_str(&format!(
                    "\nThe file `{}` exists, maybe you have meant `./{}` instead?",
                    program.cwd.join(path).display(),
                    path.display()
                ));
            }
            msg
        }
        ErrorKind::PermissionDenied => {
            let file = program.args[0].to_str_lossy();
            if file.ends_with(".sh") {
                format!(
                    "\nThe script that you have tried to execute (`{file}`) is not executable.
Try making it executable or add a shebang line to it."
                )
            } else {
                String::new()
            }
        }
        _ => String::new(),
    };
    ExecError::LaunchFailure(format!(
        "Cannot execute {:?}: {}{}",
        program.display_args(),
        error,
        context
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_program() {
        let program = ProgramDefinition::shell("echo 1", PathBuf::from("/tmp"));
        assert_eq!(program.display_args(), "sh -c echo 1");
        assert!(program.stdout_path().is_none());
    }

    #[test]
    fn relative_output_paths() {
        let mut program = ProgramDefinition::shell("true", PathBuf::from("/work/job1"));
        program.stdout = StdioDef::File(PathBuf::from("job.out"));
        program.stderr = StdioDef::MergeWithStdout;
        assert_eq!(
            program.stdout_path(),
            Some(PathBuf::from("/work/job1/job.out"))
        );
        assert_eq!(program.stderr_path(), program.stdout_path());

        program.stderr = StdioDef::File(PathBuf::from("/logs/job.err"));
        assert_eq!(program.stderr_path(), Some(PathBuf::from("/logs/job.err")));
    }

    #[test]
    fn empty_args() {
        let program = ProgramDefinition::default();
        assert!(matches!(
            command_from_definition(&program),
            Err(ExecError::LaunchFailure(_))
        ));
    }

    #[test]
    fn not_found_hint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.sh"), "echo").unwrap();
        let program = ProgramDefinition::new(vec!["run.sh".into()], dir.path().to_path_buf());
        let error = map_spawn_error(std::io::Error::from(ErrorKind::NotFound), &program);
        let msg = error.to_string();
        assert!(msg.contains("was not found"));
        assert!(msg.contains("./run.sh"));
    }
}
