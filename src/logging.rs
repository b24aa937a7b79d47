use fern::colors::{Color, ColoredLevelConfig};
use log::SetLoggerError;

use crate::config::LogConfig;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file: {0}")]
    File(#[from] std::io::Error),
    #[error(transparent)]
    SetLogger(#[from] SetLoggerError),
}

/// Installs the global logger: stdout, plus a plain-text file when one is configured.
pub fn setup_logger(config: &LogConfig) -> Result<(), LoggingError> {
    let colors = ColoredLevelConfig::default()
        .info(Color::Green)
        .debug(Color::Blue);
    let colored = config.colored;

    let stdout = fern::Dispatch::new()
        .format(move |out, message, record| {
            let level = if colored {
                colors.color(record.level()).to_string()
            } else {
                record.level().to_string()
            };
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level,
                record.target(),
                message
            ))
        })
        .chain(std::io::stdout());

    let mut dispatch = fern::Dispatch::new().level(config.level).chain(stdout);

    if let Some(path) = &config.file {
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}][{}][{}] {}",
                    chrono::Utc::now().to_rfc3339(),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(fern::log_file(path)?);
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}
