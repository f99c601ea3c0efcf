/*
 * SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tracing::{debug, level_filters::LevelFilter};

use crate::{
    cli::{avb, package, slot, vela},
    config::{self, Config},
    error::VerifyError,
};

/// Exit status when verification failed or any other error occurred.
pub const EXIT_FAILURE: u8 = 1;
/// Exit status when the command line could not be parsed.
pub const EXIT_USAGE: u8 = 10;
/// Exit status when a required value was given neither on the command line nor
/// in the config file.
pub const EXIT_MISSING_ARGS: u8 = 100;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid command line")]
    Usage(#[source] clap::Error),
    #[error("Missing required argument: {0}")]
    MissingArgument(&'static str),
}

/// Compute the process exit status for an error returned by [`main`].
pub fn exit_code(error: &anyhow::Error) -> u8 {
    for e in error.chain() {
        if let Some(e) = e.downcast_ref::<CliError>() {
            return match e {
                // --help and --version.
                CliError::Usage(e) if !e.use_stderr() => 0,
                CliError::Usage(_) => EXIT_USAGE,
                CliError::MissingArgument(_) => EXIT_MISSING_ARGS,
            };
        } else if e.downcast_ref::<VerifyError>().is_some() {
            return EXIT_FAILURE;
        }
    }

    EXIT_FAILURE
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Level and message only.
    Short,
    /// Also include the module that emitted the message.
    Medium,
    /// Also include the timestamp, thread, and source location.
    Long,
}

/// Install the global logger. All log messages go to stderr so that stdout
/// only contains command output.
pub fn init_logging(log_level: LogLevel, log_format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(LevelFilter::from(log_level));

    match log_format {
        LogFormat::Short => builder.without_time().with_target(false).init(),
        LogFormat::Medium => builder.without_time().with_target(true).init(),
        LogFormat::Long => builder
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    VerifyPackage(package::VerifyPackageCli),
    VerifySlot(slot::VerifySlotCli),
    SlotInfo(slot::SlotInfoCli),
    VelaVerify(vela::VelaVerifyCli),
    Avb(avb::AvbCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Output format for log messages.
    #[arg(long, global = true, value_name = "FORMAT", value_enum, default_value_t = LogFormat::Short)]
    pub log_format: LogFormat,

    /// Path to config file with defaults for command line options.
    #[arg(long, global = true, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::try_parse().map_err(CliError::Usage)?;

    init_logging(cli.log_level, cli.log_format);
    logging_initialized.store(true, Ordering::SeqCst);

    let config = match &cli.config {
        Some(path) => {
            let config = config::load_config(path)?;
            debug!("Loaded config: {config:?}");
            config
        }
        None => Config::default(),
    };

    match cli.command {
        Command::VerifyPackage(c) => package::verify_package_main(&c, &config),
        Command::VerifySlot(c) => slot::verify_slot_main(&c, &config),
        Command::SlotInfo(c) => slot::slot_info_main(&c),
        Command::VelaVerify(c) => vela::vela_verify_main(&c, &config),
        Command::Avb(c) => avb::avb_main(&c),
    }
    .context("Command failed")
}
