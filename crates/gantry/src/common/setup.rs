use std::io::Write;

use env_logger::DEFAULT_FILTER_ENV;
use log::LevelFilter;

/// HTTP client internals that are too chatty at `debug`.
const QUIET_MODULES: &[&str] = &["hyper_util", "reqwest", "rustls"];

/// Initializes `env_logger`. `RUST_LOG` takes precedence over `debug`.
pub fn setup_logging(debug: bool) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    for module in QUIET_MODULES {
        builder.filter_module(module, LevelFilter::Info);
    }

    let env_debug = std::env::var(DEFAULT_FILTER_ENV).is_ok_and(|v| v.contains("debug"));
    if debug || env_debug {
        builder.format_timestamp_millis();
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            let time_style = env_logger::fmt::style::AnsiColor::BrightBlack.on_default();
            writeln!(
                buf,
                "{time_style}{}{time_style:#} {level_style}{:<5}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    builder.parse_default_env();
    builder.init();
}
