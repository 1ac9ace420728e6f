use std::path::PathBuf;

use chrono::{Datelike, Timelike};
// Re-export logging functions for convenience.
pub use log::*;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    Config,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Describes where logs go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Messages below this level are discarded.
    pub filter: LevelFilter,
    /// Directory log files are written to. `None` disables logging to a file.
    pub directory: Option<PathBuf>,
    /// Also write messages to stdout.
    pub console: bool,
}

#[derive(Debug, Error)]
pub enum LogInitError {
    #[error("unable to open log file: {0}")]
    File(std::io::Error),
    #[error("invalid logging configuration: {0}")]
    Config(#[from] log4rs::config::runtime::ConfigErrors),
    #[error("a logger has already been installed: {0}")]
    AlreadyInitialized(#[from] SetLoggerError),
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: LevelFilter::Info,
            directory: Some(PathBuf::from("./logs")),
            console: true,
        }
    }
}

/// Initializes logging. Should be called before any other logging functions. Provided
/// `LevelFilter` will remove all logs below the provided level.
pub fn init(filter: LevelFilter) {
    init_with(&LogSettings {
        filter,
        ..Default::default()
    })
    .expect("unable to initialize logging");
}

/// Initializes logging with the provided settings and installs a panic hook that logs panics.
pub fn init_with(settings: &LogSettings) -> Result<(), LogInitError> {
    let mut config = Config::builder();
    let mut root = Root::builder();

    if settings.console {
        let stdout = ConsoleAppender::builder().build();
        config = config.appender(Appender::builder().build("stdout", Box::new(stdout)));
        root = root.appender("stdout");
    }

    if let Some(directory) = &settings.directory {
        // Name of the file is based on the current time.
        let now = chrono::Utc::now();
        let path = directory.join(format!(
            "{} {} {} {} {} {}.txt",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        ));

        let log_file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{d} - {l} - {m}{n}")))
            .build(path)
            .map_err(LogInitError::File)?;

        config = config.appender(Appender::builder().build("log_file", Box::new(log_file)));
        root = root.appender("log_file");
    }

    let config = config.build(root.build(settings.filter))?;
    log4rs::init_config(config)?;

    log_panics::init();

    Ok(())
}
