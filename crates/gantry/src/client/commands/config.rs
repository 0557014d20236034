use std::path::Path;

use crate::common::cli::{ConfigCommand, ConfigOpts};
use crate::common::config::SiteConfig;

pub fn command_config(config_path: &Path, opts: ConfigOpts) -> anyhow::Result<()> {
    match opts.subcmd {
        ConfigCommand::Default => {
            print!("{}", SiteConfig::default().to_toml()?);
        }
        ConfigCommand::Check => {
            let config = SiteConfig::load(config_path)?;
            let policy = match (&config.allocation.elastic, &config.allocation.maintainer) {
                (Some(_), _) => "elastic",
                (_, Some(_)) => "maintainer",
                (None, None) => "none",
            };
            println!(
                "Configuration of site `{}` is valid ({} launcher node(s), {} scheduler, {policy} scaling policy)",
                config.site.name,
                config.launcher.nodes.len(),
                config.allocation.scheduler
            );
        }
    }
    Ok(())
}
