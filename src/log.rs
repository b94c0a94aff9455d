use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

/// Initialise terminal + file logging.
///
/// Both sinks are created wide open and the effective verbosity is governed
/// by the global [`log::max_level`], so the CLI `log <LEVEL>` command can
/// retune it at runtime through [`set_level`].
pub fn setup_logger() -> Result<()> {
    let log_dir = Path::new("logs");
    std::fs::create_dir_all(log_dir).context("failed to create log directory")?;
    let log_file =
        File::create(log_dir.join("peerchat.log")).context("failed to create log file")?;

    let config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Debug)
        .set_target_level(LevelFilter::Error)
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        LevelFilter::Trace,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));
    loggers.push(WriteLogger::new(LevelFilter::Trace, config, log_file));

    CombinedLogger::init(loggers).context("failed to initialise logging")?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

/// Retune the global log verbosity (backs the CLI `log <LEVEL>` command).
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
