//! Process record assembly
//!
//! Turns a raw lifecycle event, or a bare pid from a snapshot, into a fully
//! populated [`Process`]. Only an unrecognized event code fails; anything
//! that cannot be looked up is left empty.

use std::sync::Arc;
use std::time::SystemTime;

use crate::ancestry::AncestryResolver;
use crate::binary::BinaryIdentityResolver;
use crate::error::{ProcInfoError, Result};
use crate::models::{EnrichmentMode, EventType, Pid, Process, RawEvent};
use crate::process_table::ProcessTable;
use crate::source;

pub struct ProcessRecordBuilder {
    table: Arc<dyn ProcessTable>,
    ancestry: AncestryResolver,
    binaries: Arc<BinaryIdentityResolver>,
}

impl ProcessRecordBuilder {
    pub fn new(table: Arc<dyn ProcessTable>, binaries: Arc<BinaryIdentityResolver>) -> Self {
        Self {
            ancestry: AncestryResolver::new(Arc::clone(&table)),
            table,
            binaries,
        }
    }

    pub fn binaries(&self) -> &BinaryIdentityResolver {
        &self.binaries
    }

    /// Build the record for a lifecycle event.
    ///
    /// Event-supplied fields win over process-table lookups, since an exited
    /// process is usually gone from the table by the time it is enriched.
    pub fn build_from_event(&self, raw: &RawEvent, mode: EnrichmentMode) -> Result<Process> {
        let event_type = source::decode(raw)?;

        let path = raw
            .path
            .clone()
            .or_else(|| self.table.path_of(raw.pid))
            .unwrap_or_default();
        let arguments = if raw.arguments.is_empty() {
            self.table.arguments_of(raw.pid)
        } else {
            raw.arguments.clone()
        };
        let ppid = raw
            .ppid
            .or_else(|| self.table.parent_of(raw.pid))
            .unwrap_or(0);
        let ancestors = self.ancestry.resolve_from_parent(raw.pid, raw.ppid);
        let exit_code = match event_type {
            EventType::Exit => raw.exit_status,
            _ => None,
        };

        Ok(Process {
            pid: raw.pid,
            ppid,
            uid: raw.uid,
            event_type: Some(event_type),
            exit_code,
            binary: self.binaries.resolve(&path, mode),
            path,
            arguments,
            ancestors,
            timestamp: raw.timestamp,
        })
    }

    /// Build a snapshot record for a live pid. A pid that vanished since it
    /// was listed still yields a record, with whatever could be read.
    pub fn build_from_pid(&self, pid: Pid, mode: EnrichmentMode) -> Process {
        let path = match self.table.path_of(pid) {
            Some(path) => path,
            None => {
                log::debug!("{}", ProcInfoError::ProcessVanished(pid));
                Default::default()
            }
        };

        Process {
            pid,
            ppid: self.table.parent_of(pid).unwrap_or(0),
            uid: self.table.uid_of(pid).unwrap_or(0),
            event_type: None,
            exit_code: None,
            binary: self.binaries.resolve(&path, mode),
            arguments: self.table.arguments_of(pid),
            ancestors: self.ancestry.resolve(pid),
            path,
            timestamp: SystemTime::now(),
        }
    }
}
