// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Append-only record of dispatched operations
//!
//! One line per operation in completion order, e.g.
//! `delete_file path=target/f1.txt decision=deny(permission_denied)`.
//! The pid is kept on the record but left out of the line so that runs
//! can be diffed against an expected sequence. Paths are percent-escaped
//! so a file name can never span lines or add tokens.

use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::result_code::Decision;
use crate::types::OperationKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: OperationKind,
    pub path: PathBuf,
    pub target: Option<PathBuf>,
    pub pid: u32,
    pub decision: Decision,
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} path={}", self.kind, escape_path(&self.path))?;
        if let Some(target) = &self.target {
            write!(f, " target={}", escape_path(target))?;
        }
        write!(f, " decision={}", self.decision)
    }
}

/// `%XX` for whitespace, control bytes, `%` itself and bytes that are
/// not valid UTF-8
fn escape_path(path: &Path) -> String {
    let bytes = path.as_os_str().as_bytes();
    let utf8 = std::str::from_utf8(bytes).is_ok();
    let mut out = String::with_capacity(bytes.len());
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        let escape = b <= b' ' || b == 0x7f || b == b'%' || (!utf8 && b >= 0x80);
        if escape {
            out.push_str(&String::from_utf8_lossy(&bytes[start..i]));
            out.push_str(&format!("%{b:02X}"));
            start = i + 1;
        }
    }
    out.push_str(&String::from_utf8_lossy(&bytes[start..]));
    out
}

#[derive(Default)]
struct Inner {
    records: Vec<EventRecord>,
    sink: Option<File>,
}

/// Shared event log; a single lock covers both the records and the sink
#[derive(Default)]
pub struct EventLog {
    inner: Mutex<Inner>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log that also appends each line to `path`
    pub fn with_file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                records: Vec::new(),
                sink: Some(file),
            }),
        })
    }

    pub fn append(&self, record: EventRecord) {
        let mut inner = self.inner.lock();
        if let Some(sink) = inner.sink.as_mut() {
            if let Err(err) = writeln!(sink, "{record}") {
                warn!(error = %err, "failed to write event log line");
            }
        }
        inner.records.push(record);
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.inner.lock().records.clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().records.iter().map(ToString::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
