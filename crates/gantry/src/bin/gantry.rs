use clap::{CommandFactory, FromArgMatches};
use tokio_util::sync::CancellationToken;

use gantry::client::cancel_on_signals;
use gantry::client::commands::config::command_config;
use gantry::client::commands::launcher::command_launcher;
use gantry::client::commands::processing::command_processing;
use gantry::client::commands::queue_service::command_queue_service;
use gantry::common::cli::{RootOptions, SubCommand};
use gantry::common::setup::setup_logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> gantry::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let config = top_opts.common.config;
    let stop = CancellationToken::new();
    let result = match cancel_on_signals(stop.clone()) {
        Ok(()) => match top_opts.subcmd {
            SubCommand::Launcher(opts) => command_launcher(&config, opts, stop).await,
            SubCommand::Processing(opts) => command_processing(&config, opts, stop)
                .await
                .map(|()| 0),
            SubCommand::QueueService(opts) => command_queue_service(&config, opts, stop)
                .await
                .map(|()| 0),
            SubCommand::Config(opts) => command_config(&config, opts).map(|()| 0),
        },
        Err(error) => Err(error),
    };

    match result {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(error) => {
            log::error!("{error:?}");
            std::process::exit(1);
        }
    }
}
