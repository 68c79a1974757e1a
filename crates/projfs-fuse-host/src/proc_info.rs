// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Caller identity from procfs

use tracing::debug;

/// Thread group id of `pid`, or `pid` itself if procfs can't tell us.
///
/// FUSE requests carry the id of the calling thread; handlers care about
/// the process it belongs to.
pub fn thread_group_id(pid: u32) -> u32 {
    if pid == 0 {
        return 0;
    }
    let status_path = format!("/proc/{pid}/status");
    match std::fs::read_to_string(&status_path) {
        Ok(contents) => parse_tgid(&contents).unwrap_or(pid),
        Err(err) => {
            debug!(pid, %status_path, %err, "failed to read process status; using raw pid");
            pid
        }
    }
}

/// Value of the `Tgid:` line in a `/proc/<pid>/status` dump
pub fn parse_tgid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|rest| rest.trim().parse().ok())
}
