//! Ancestor-chain reconstruction
//!
//! Walks parent pids through the process table. Ancestry is best-effort:
//! a lookup failure simply ends the chain. The walk never revisits a pid,
//! so a pid reused mid-walk cannot make it loop.

use std::collections::HashSet;
use std::sync::Arc;

use crate::constants::MAX_ANCESTRY_DEPTH;
use crate::models::Pid;
use crate::process_table::ProcessTable;

pub struct AncestryResolver {
    table: Arc<dyn ProcessTable>,
}

impl AncestryResolver {
    pub fn new(table: Arc<dyn ProcessTable>) -> Self {
        Self { table }
    }

    /// Ancestors of `pid`, nearest parent first
    pub fn resolve(&self, pid: Pid) -> Vec<Pid> {
        self.walk(pid, self.table.parent_of(pid))
    }

    /// Ancestors of `pid` when the immediate parent is already known, e.g.
    /// from the event that reported the process. Falls back to a table
    /// lookup when `ppid` is None.
    pub fn resolve_from_parent(&self, pid: Pid, ppid: Option<Pid>) -> Vec<Pid> {
        let first = ppid.or_else(|| self.table.parent_of(pid));
        self.walk(pid, first)
    }

    fn walk(&self, pid: Pid, first_parent: Option<Pid>) -> Vec<Pid> {
        let mut ancestors = Vec::new();
        let mut seen = HashSet::from([pid]);
        let mut next = first_parent;

        while let Some(parent) = next {
            if parent <= 0 || ancestors.len() >= MAX_ANCESTRY_DEPTH {
                break;
            }
            if !seen.insert(parent) {
                log::debug!("ancestry of pid {} revisits pid {}, stopping", pid, parent);
                break;
            }
            ancestors.push(parent);
            next = self.table.parent_of(parent);
        }

        ancestors
    }
}
