// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Diagnostic logging for projfs binaries
//!
//! Installs a process-wide `tracing` subscriber. `RUST_LOG` wins when set;
//! otherwise the filter is `<level>,<component>=<level>`. This is separate
//! from the mount's event log, which records dispatched operations.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

/// Logging flags flattened into every binary's clap parser
#[derive(Clone, Debug, Default, clap::Args)]
pub struct CliLoggingArgs {
    /// Diagnostic verbosity (default: info)
    #[arg(long, value_enum)]
    pub log_level: Option<CliLogLevel>,

    /// Diagnostic output format (default: plaintext)
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Append diagnostics to this file instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl CliLoggingArgs {
    /// Install the subscriber described by the flags
    pub fn init(self, component: &str) -> anyhow::Result<()> {
        let level = Level::from(self.log_level.unwrap_or_default());
        let format = self.log_format.unwrap_or_default();
        match &self.log_file {
            Some(path) => install(component, level, format, open_log_file(path)?),
            None => install(component, level, format, io::stdout),
        }
    }
}

/// Open `path` for appending, creating missing parent directories
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)
}

fn install<W>(component: &str, level: Level, format: LogFormat, writer: W) -> anyhow::Result<()>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(component, level)));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_file(cfg!(debug_assertions))
        .with_line_number(cfg!(debug_assertions));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(layer.json()).try_init()?,
        LogFormat::Plaintext => registry.with(layer).try_init()?,
    }
    Ok(())
}

/// Filter used when `RUST_LOG` is unset. Crate targets use underscores.
fn default_directive(component: &str, level: Level) -> String {
    format!("{},{}={}", level, component.replace('-', "_"), level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_level_maps_to_tracing_level() {
        assert_eq!(Level::from(CliLogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(CliLogLevel::Trace), Level::TRACE);
        assert_eq!(CliLogLevel::default(), CliLogLevel::Info);
    }

    #[test]
    fn default_directive_targets_component_crate() {
        assert_eq!(
            default_directive("projfs-mount", Level::DEBUG),
            "DEBUG,projfs_mount=DEBUG"
        );
        assert!(EnvFilter::try_new(default_directive("projfs-core", Level::INFO)).is_ok());
    }

    #[test]
    fn file_logging_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("projfs.log");
        let args = CliLoggingArgs {
            log_format: Some(LogFormat::Json),
            log_file: Some(path.clone()),
            ..Default::default()
        };
        // only one global subscriber per test process; the file must exist
        // whether or not this call won the race to install it
        let _ = args.init("projfs-logging");
        assert!(path.exists());
    }
}
