use std::{path::Path, sync::Once};

use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

pub const DEFAULT_CONFIG_FILE: &str = "logging_config.yaml";

static LOGGER_INIT: Once = Once::new();

/// Initializes the `log4rs` logger using `logging_config.yaml`.
pub fn init() {
    init_from(DEFAULT_CONFIG_FILE);
}

/// Initializes the `log4rs` logger from `path`, falling back to a console
/// logger when the file is missing or invalid. Only the first call in a
/// process has any effect.
pub fn init_from(path: impl AsRef<Path>) {
    let path = path.as_ref();
    LOGGER_INIT.call_once(|| {
        match log4rs::init_file(path, Default::default()) {
            Ok(_) => {
                log::info!(
                    "privacy-ledger logging initialized from {}.",
                    path.display()
                );
            }
            Err(e) => {
                // Logging not set up, stderr
                eprintln!(
                    "ERROR: Failed to initialize logger from {}: {}",
                    path.display(),
                    e
                );
                init_fallback(LevelFilter::Debug);
            }
        }
    });
}

fn init_fallback(level: LevelFilter) {
    match fallback_config(level) {
        Ok(config) => {
            if let Err(init_err) = log4rs::init_config(config) {
                eprintln!("ERROR: Failed to initialize fallback logger: {}. No logging will be available.", init_err);
            } else {
                log::warn!(
                    "privacy-ledger logging initialized using basic fallback (stdout, {level} level)."
                );
            }
        }
        Err(build_err) => {
            eprintln!("ERROR: Failed to build fallback logging configuration: {}. No logging will be available.", build_err);
        }
    }
}

/// Console-only configuration logging everything at `level` and above.
pub fn fallback_config(
    level: LevelFilter,
) -> Result<Config, log4rs::config::runtime::ConfigErrors> {
    let stdout_appender = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{h({d(%Y-%m-%d %H:%M:%S)(utc)} - {l} - {t}: {m}{n})}",
        )))
        .build();

    Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout_appender)))
        .build(Root::builder().appender("stdout").build(level))
}
