//! Portable event source built on process-table polling
//!
//! Each poll snapshots the process table and diffs it against the previous
//! snapshot. Vanished processes become Exit events, new ones become Exec
//! events. Processes that start and exit between two polls are never seen.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::constants::{AUE_EXECVE, AUE_EXIT};
use crate::error::{ProcInfoError, Result};
use crate::models::{Pid, RawEvent};
use crate::process_table::{ProcessEntry, ProcessTable};
use crate::source::EventSource;

/// Changes between two consecutive snapshots, each list ordered by pid
#[derive(Debug, Default, PartialEq)]
pub struct SnapshotDiff {
    pub exited: Vec<ProcessEntry>,
    pub started: Vec<ProcessEntry>,
}

/// Manages process state tracking between polling cycles
#[derive(Debug, Default)]
pub struct ProcessTracker {
    /// Keyed by (pid, start_time) so that pid reuse shows up as exit + start
    current: Option<HashMap<(Pid, u64), ProcessEntry>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `snapshot` with the previous one. The first snapshot is a
    /// baseline and reports nothing, to avoid flooding on startup.
    pub fn detect_changes(&mut self, snapshot: Vec<ProcessEntry>) -> SnapshotDiff {
        let next: HashMap<(Pid, u64), ProcessEntry> = snapshot
            .into_iter()
            .map(|entry| ((entry.pid, entry.start_time), entry))
            .collect();

        let diff = match &self.current {
            None => SnapshotDiff::default(),
            Some(previous) => {
                let mut exited: Vec<ProcessEntry> = previous
                    .iter()
                    .filter(|(key, _)| !next.contains_key(*key))
                    .map(|(_, entry)| entry.clone())
                    .collect();
                let mut started: Vec<ProcessEntry> = next
                    .iter()
                    .filter(|(key, _)| !previous.contains_key(*key))
                    .map(|(_, entry)| entry.clone())
                    .collect();
                exited.sort_unstable_by_key(|entry| entry.pid);
                started.sort_unstable_by_key(|entry| entry.pid);
                SnapshotDiff { exited, started }
            }
        };

        self.current = Some(next);
        diff
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Event source that synthesizes lifecycle events from table diffs
pub struct PollingSource {
    table: Arc<dyn ProcessTable>,
    interval: Duration,
    tracker: ProcessTracker,
    pending: VecDeque<RawEvent>,
    next_poll: Instant,
    subscribed: bool,
}

impl PollingSource {
    pub fn new(table: Arc<dyn ProcessTable>, interval: Duration) -> Self {
        Self {
            table,
            interval,
            tracker: ProcessTracker::new(),
            pending: VecDeque::new(),
            next_poll: Instant::now(),
            subscribed: false,
        }
    }

    fn poll(&mut self) {
        let diff = self.tracker.detect_changes(self.table.snapshot());
        let timestamp = SystemTime::now();

        // Exits first, so a reused pid reads as exit followed by exec
        for entry in diff.exited {
            self.pending.push_back(event_for(entry, AUE_EXIT, timestamp));
        }
        for entry in diff.started {
            self.pending.push_back(event_for(entry, AUE_EXECVE, timestamp));
        }

        self.next_poll = Instant::now() + self.interval;
    }
}

fn event_for(entry: ProcessEntry, code: u16, timestamp: SystemTime) -> RawEvent {
    let mut event = RawEvent::new(entry.pid, code)
        .with_uid(entry.uid.unwrap_or(0))
        .with_timestamp(timestamp);
    event.ppid = entry.ppid;
    event.path = entry.path;
    if code != AUE_EXIT {
        event.arguments = entry.arguments;
    }
    event
}

impl EventSource for PollingSource {
    fn subscribe(&mut self) -> Result<()> {
        self.tracker.reset();
        self.pending.clear();
        // Baseline now, so processes started after subscribe() are reported
        self.poll();
        self.subscribed = true;
        log::debug!(
            "polling source subscribed (interval: {:.1}s)",
            self.interval.as_secs_f64()
        );
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<RawEvent>> {
        if !self.subscribed {
            return Err(ProcInfoError::Source("not subscribed".to_string()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= self.next_poll {
                self.poll();
                continue;
            }
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.next_poll.min(deadline) - now);
        }
    }

    fn unsubscribe(&mut self) {
        self.subscribed = false;
        self.pending.clear();
        self.tracker.reset();
    }
}
