// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! projfs-mount: mounts a lower directory with a fixed-result provider
//!
//! Every permission event is answered with `--retval`, which makes the
//! binary useful for exercising allow/deny paths end to end.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use projfs_core::result_code::symbol_names;
use projfs_core::{Convention, DispatchMode, ProjfsConfig};
use projfs_fuse_host::{fixed_result_registry, MountHandle};
use projfs_logging::CliLoggingArgs;
use std::io::{self, BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "projfs-mount", about = "Mount a projected view of a lower directory")]
struct Args {
    /// Directory holding the real files
    lower: Option<PathBuf>,

    /// Mount point
    mount: Option<PathBuf>,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Result every handler returns, e.g. allow, deny, eperm or a
    /// PrjFS_Result_* name
    #[arg(long, default_value = "allow")]
    retval: String,

    /// Result code convention (posix or provider_api)
    #[arg(long)]
    convention: Option<Convention>,

    /// Run handlers on a pool of this many threads
    #[arg(long)]
    pool_threads: Option<usize>,

    /// Threads serving deletions and renames while a handler decides
    #[arg(long)]
    request_threads: Option<usize>,

    /// Append one line per dispatched operation to this file
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// Mark the lower directory as an empty projection root
    #[arg(long)]
    initial: bool,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

fn build_config(args: &Args) -> Result<ProjfsConfig> {
    let mut config = ProjfsConfig::load(args.config.as_deref())
        .with_context(|| "failed to load configuration")?;
    if let Some(lower) = &args.lower {
        config.lower_root = Some(lower.clone());
    }
    if let Some(mount) = &args.mount {
        config.mount_root = Some(mount.clone());
    }
    if let Some(convention) = args.convention {
        config.convention = convention;
    }
    if let Some(threads) = args.pool_threads {
        config.dispatch = DispatchMode::Pooled { threads };
    }
    if let Some(threads) = args.request_threads {
        config.mount.request_threads = threads;
    }
    if args.event_log.is_some() {
        config.event_log = args.event_log.clone();
    }
    config.initial |= args.initial;
    config.mount.allow_other |= args.allow_other;
    config.mount.auto_unmount |= args.auto_unmount;
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.logging.clone().init("projfs-mount")?;

    let config = build_config(&args)?;
    debug!(config = %serde_json::to_string(&config)?, "configuration resolved");
    let lower = config
        .lower_root
        .clone()
        .ok_or_else(|| anyhow!("no lower directory given"))?;
    let mount = config
        .mount_root
        .clone()
        .ok_or_else(|| anyhow!("no mount point given"))?;

    let registry = fixed_result_registry(&args.retval, config.convention).with_context(|| {
        format!(
            "invalid --retval {}; expected one of: {}",
            args.retval,
            symbol_names(config.convention).join(", ")
        )
    })?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<&'static str>(2);
    let on_signal = stop_tx.clone();
    ctrlc::set_handler(move || {
        let _ = on_signal.try_send("termination signal");
    })?;

    let handle = MountHandle::start(&lower, &mount, Arc::new(registry), &config)?;
    info!(
        lower = %lower.display(),
        mount = %handle.mount_root().display(),
        retval = %args.retval,
        "projfs-mount running"
    );

    if io::stdin().is_terminal() {
        println!("Mounted at {}. Press Enter to unmount.", handle.mount_root().display());
        thread::spawn(move || {
            let mut line = String::new();
            if io::stdin().lock().read_line(&mut line).is_ok() {
                let _ = stop_tx.try_send("enter pressed");
            }
        });
    } else {
        drop(stop_tx);
    }
    let reason = stop_rx.recv().unwrap_or("signal channel closed");
    info!(reason, "unmounting");

    let state = handle.stop();
    info!(
        abandoned = state.abandoned,
        events = state.events_logged,
        executed = state.pool.map(|p| p.executed).unwrap_or_default(),
        "unmounted"
    );
    Ok(())
}
