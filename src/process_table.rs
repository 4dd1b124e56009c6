//! Host process-table access
//!
//! The enrichment pipeline only talks to the process table through the
//! [`ProcessTable`] trait so that the racy host view (processes exit while
//! they are being inspected) can be replaced by a fixed table in tests or
//! when replaying recorded trees.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use sysinfo::{Pid as SysPid, PidExt, ProcessExt, System, SystemExt};

use crate::models::Pid;

/// One row of a process-table snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub uid: Option<u32>,
    pub path: Option<PathBuf>,
    pub arguments: Vec<String>,
    /// Start time in seconds since the epoch, 0 when unknown
    pub start_time: u64,
}

impl ProcessEntry {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            ppid: None,
            uid: None,
            path: None,
            arguments: Vec::new(),
            start_time: 0,
        }
    }
}

/// Queries against the live process table. Every lookup may fail because
/// the process has already exited.
pub trait ProcessTable: Send + Sync {
    fn list_live_pids(&self) -> Vec<Pid>;

    fn path_of(&self, pid: Pid) -> Option<PathBuf>;

    fn parent_of(&self, pid: Pid) -> Option<Pid>;

    fn uid_of(&self, pid: Pid) -> Option<u32>;

    fn arguments_of(&self, pid: Pid) -> Vec<String>;

    fn start_time_of(&self, _pid: Pid) -> Option<u64> {
        None
    }

    /// Full snapshot of the table. The default composes per-pid lookups.
    fn snapshot(&self) -> Vec<ProcessEntry> {
        self.list_live_pids()
            .into_iter()
            .map(|pid| ProcessEntry {
                pid,
                ppid: self.parent_of(pid),
                uid: self.uid_of(pid),
                path: self.path_of(pid),
                arguments: self.arguments_of(pid),
                start_time: self.start_time_of(pid).unwrap_or(0),
            })
            .collect()
    }
}

/// Process table backed by the host via `sysinfo`
pub struct SysinfoProcessTable {
    system: Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Refresh a single pid and read from it. Returns None once the pid is gone.
    fn with_process<T>(&self, pid: Pid, read: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let pid = to_sys_pid(pid)?;
        let mut system = self.system.lock().ok()?;
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(read)
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn list_live_pids(&self) -> Vec<Pid> {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(_) => return Vec::new(),
        };
        system.refresh_processes();

        let mut pids: Vec<Pid> = system
            .processes()
            .keys()
            .map(|pid| pid.as_u32() as Pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    fn path_of(&self, pid: Pid) -> Option<PathBuf> {
        self.with_process(pid, |process| exe_path(process)).flatten()
    }

    fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.with_process(pid, |process| process.parent().map(|ppid| ppid.as_u32() as Pid))
            .flatten()
    }

    fn uid_of(&self, pid: Pid) -> Option<u32> {
        self.with_process(pid, |process| process.user_id().map(|uid| **uid))
            .flatten()
    }

    fn arguments_of(&self, pid: Pid) -> Vec<String> {
        self.with_process(pid, |process| process.cmd().to_vec())
            .unwrap_or_default()
    }

    fn start_time_of(&self, pid: Pid) -> Option<u64> {
        self.with_process(pid, |process| process.start_time())
    }

    fn snapshot(&self) -> Vec<ProcessEntry> {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(_) => return Vec::new(),
        };
        system.refresh_processes();

        let mut entries: Vec<ProcessEntry> = system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32() as Pid,
                ppid: process.parent().map(|ppid| ppid.as_u32() as Pid),
                uid: process.user_id().map(|uid| **uid),
                path: exe_path(process),
                arguments: process.cmd().to_vec(),
                start_time: process.start_time(),
            })
            .collect();
        entries.sort_unstable_by_key(|entry| entry.pid);
        entries
    }
}

fn to_sys_pid(pid: Pid) -> Option<SysPid> {
    u32::try_from(pid).ok().map(SysPid::from_u32)
}

fn exe_path(process: &sysinfo::Process) -> Option<PathBuf> {
    let exe = process.exe();
    if exe.as_os_str().is_empty() {
        None
    } else {
        Some(exe.to_path_buf())
    }
}

/// Fixed in-memory process table
#[derive(Debug, Default)]
pub struct StaticProcessTable {
    entries: Mutex<HashMap<Pid, ProcessEntry>>,
}

impl StaticProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ProcessEntry>) -> Self {
        let table = Self::new();
        for entry in entries {
            table.insert(entry);
        }
        table
    }

    /// Convenience for the common (pid, ppid, path) case
    pub fn with_process(self, pid: Pid, ppid: Pid, path: impl Into<PathBuf>) -> Self {
        let mut entry = ProcessEntry::new(pid);
        entry.ppid = Some(ppid);
        entry.path = Some(path.into());
        self.insert(entry);
        self
    }

    pub fn insert(&self, entry: ProcessEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(entry.pid, entry);
        }
    }

    /// Simulate a process exiting
    pub fn remove(&self, pid: Pid) -> Option<ProcessEntry> {
        self.entries.lock().ok()?.remove(&pid)
    }

    fn get(&self, pid: Pid) -> Option<ProcessEntry> {
        self.entries.lock().ok()?.get(&pid).cloned()
    }
}

impl ProcessTable for StaticProcessTable {
    fn list_live_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = match self.entries.lock() {
            Ok(entries) => entries.keys().copied().collect(),
            Err(_) => Vec::new(),
        };
        pids.sort_unstable();
        pids
    }

    fn path_of(&self, pid: Pid) -> Option<PathBuf> {
        self.get(pid)?.path
    }

    fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.get(pid)?.ppid
    }

    fn uid_of(&self, pid: Pid) -> Option<u32> {
        self.get(pid)?.uid
    }

    fn arguments_of(&self, pid: Pid) -> Vec<String> {
        self.get(pid).map(|entry| entry.arguments).unwrap_or_default()
    }

    fn start_time_of(&self, pid: Pid) -> Option<u64> {
        self.get(pid).map(|entry| entry.start_time)
    }
}
