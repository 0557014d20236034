use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::common::utils::time::parse_hms_or_human_time;
use crate::launcher::LaunchMode;

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to the site configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = "GANTRY_CONFIG",
        default_value = "gantry.toml",
        help_heading("GLOBAL OPTIONS")
    )]
    pub config: PathBuf,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "GANTRY_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::GANTRY_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Run jobs inside the current allocation
    Launcher(LauncherOpts),
    /// Run preprocessing and postprocessing of jobs and recover failed runs
    Processing(ProcessingOpts),
    /// Keep the number of allocations of the site in line with its workload
    QueueService(QueueServiceOpts),
    /// Inspect the site configuration
    Config(ConfigOpts),
}

#[derive(Parser)]
pub struct LauncherOpts {
    /// Remaining time of the allocation.
    /// Detected from Slurm when missing.
    ///
    /// You can use either the `HH:MM:SS` format or a "humantime" format (e.g. 1h30m).
    #[arg(long, value_parser = parse_hms_or_human_time)]
    pub wall_time: Option<Duration>,

    /// How processes of jobs are started, overrides `launcher.job_mode`
    #[arg(long, value_enum)]
    pub job_mode: Option<LaunchMode>,
}

#[derive(Parser)]
pub struct ProcessingOpts {
    /// Number of hooks that can run at the same time, overrides `processing.num_workers`
    #[arg(long)]
    pub num_workers: Option<usize>,
}

#[derive(Parser)]
pub struct QueueServiceOpts {
    /// Perform a single reconciliation and scaling step and exit
    #[arg(long)]
    pub once: bool,
}

#[derive(Parser)]
pub struct ConfigOpts {
    #[clap(subcommand)]
    pub subcmd: ConfigCommand,
}

#[derive(Parser)]
pub enum ConfigCommand {
    /// Print the default site configuration
    Default,
    /// Load and validate the site configuration
    Check,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        RootOptions::command().debug_assert();
    }

    #[test]
    fn parse_launcher_options() {
        let opts = RootOptions::try_parse_from([
            "gantry",
            "--config",
            "site.toml",
            "launcher",
            "--wall-time",
            "01:30:00",
            "--job-mode",
            "srun",
        ])
        .unwrap();
        assert_eq!(opts.common.config, PathBuf::from("site.toml"));
        let SubCommand::Launcher(launcher) = opts.subcmd else {
            panic!("Expected the launcher command");
        };
        assert_eq!(launcher.wall_time, Some(Duration::from_secs(5400)));
        assert_eq!(launcher.job_mode, Some(LaunchMode::Srun));
    }

    #[test]
    fn parse_processing_options() {
        let opts =
            RootOptions::try_parse_from(["gantry", "processing", "--num-workers", "8"]).unwrap();
        let SubCommand::Processing(processing) = opts.subcmd else {
            panic!("Expected the processing command");
        };
        assert_eq!(processing.num_workers, Some(8));
    }

    #[test]
    fn parse_config_command() {
        let opts = RootOptions::try_parse_from(["gantry", "config", "default"]).unwrap();
        assert!(matches!(
            opts.subcmd,
            SubCommand::Config(ConfigOpts {
                subcmd: ConfigCommand::Default
            })
        ));
    }
}
