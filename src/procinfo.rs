//! Monitoring coordinator
//!
//! [`ProcInfo`] owns the event source and the record builder. While
//! monitoring, one named worker thread receives raw events, enriches them
//! and hands each record to the registered callback, strictly in order.
//! Snapshots are served from any thread, independently of monitoring.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rayon::prelude::*;

use crate::binary::{BinaryIdentityResolver, CodesignEvaluator, TrustEvaluator};
use crate::builder::ProcessRecordBuilder;
use crate::config::ProcInfoConfig;
use crate::error::{ProcInfoError, Result};
use crate::models::{EnrichmentMode, Process};
use crate::process_table::{ProcessTable, SysinfoProcessTable};
use crate::source::{self, EventSource};

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the coordinator whose worker runs on this thread, if any
    static WORKER_OF: Cell<Option<u64>> = const { Cell::new(None) };
}

type SharedSource = Arc<Mutex<Box<dyn EventSource>>>;

struct Session {
    mode: EnrichmentMode,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    /// Worker told to stop from its own callback, joined on the next start
    stopping: Option<JoinHandle<()>>,
}

/// Process lifecycle monitor and snapshot provider
pub struct ProcInfo {
    id: u64,
    table: Arc<dyn ProcessTable>,
    builder: Arc<ProcessRecordBuilder>,
    source: SharedSource,
    default_mode: EnrichmentMode,
    receive_timeout: Duration,
    /// Serializes start() and stop()
    lifecycle: Mutex<()>,
    state: Mutex<State>,
}

impl ProcInfo {
    /// Coordinator over the host process table, the `codesign` trust
    /// evaluator and the configured event source
    pub fn new(config: &ProcInfoConfig) -> Result<Self> {
        let table: Arc<dyn ProcessTable> = Arc::new(SysinfoProcessTable::new());
        let evaluator = Arc::new(CodesignEvaluator::new(config.signing_timeout()));
        let source = source::open(config, Arc::clone(&table))?;
        Ok(Self::with_components(table, evaluator, source, config))
    }

    /// Coordinator over explicit collaborators
    pub fn with_components(
        table: Arc<dyn ProcessTable>,
        evaluator: Arc<dyn TrustEvaluator>,
        source: Box<dyn EventSource>,
        config: &ProcInfoConfig,
    ) -> Self {
        let binaries = BinaryIdentityResolver::new(evaluator)
            .with_signing_timeout(config.signing_timeout())
            .with_cache_ttl(config.cache_ttl())
            .with_spotlight_metadata(config.binary.spotlight_metadata);
        let builder = ProcessRecordBuilder::new(Arc::clone(&table), Arc::new(binaries));

        Self {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            table,
            builder: Arc::new(builder),
            source: Arc::new(Mutex::new(source)),
            default_mode: config.monitor.mode,
            receive_timeout: config.receive_timeout(),
            lifecycle: Mutex::new(()),
            state: Mutex::new(State::default()),
        }
    }

    pub fn binaries(&self) -> &BinaryIdentityResolver {
        self.builder.binaries()
    }

    /// Begin monitoring. `callback` runs on the worker thread once per
    /// enriched record. Subscription errors are returned here.
    pub fn start<F>(&self, mode: EnrichmentMode, callback: F) -> Result<()>
    where
        F: FnMut(Process) + Send + 'static,
    {
        if self.on_own_worker() {
            return Err(ProcInfoError::AlreadyMonitoring);
        }
        let _lifecycle = lock(&self.lifecycle);

        let stopping = {
            let mut state = lock(&self.state);
            if state.session.is_some() {
                return Err(ProcInfoError::AlreadyMonitoring);
            }
            state.stopping.take()
        };
        if let Some(worker) = stopping {
            join_worker(worker);
        }

        lock(&self.source).subscribe()?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            coordinator: self.id,
            source: Arc::clone(&self.source),
            builder: Arc::clone(&self.builder),
            mode,
            stop: Arc::clone(&stop),
            receive_timeout: self.receive_timeout,
        };
        let handle = thread::Builder::new()
            .name("procinfo-monitor".to_string())
            .spawn(move || worker.run(callback))
            .map_err(|e| {
                lock(&self.source).unsubscribe();
                ProcInfoError::Source(format!("cannot start monitor thread: {}", e))
            })?;

        lock(&self.state).session = Some(Session {
            mode,
            stop,
            worker: handle,
        });
        log::info!("process monitoring started ({:?} enrichment)", mode);
        Ok(())
    }

    /// Stop monitoring. Once this returns no further callback runs, except
    /// when called from inside the callback, where it only signals the worker.
    pub fn stop(&self) -> Result<()> {
        if self.on_own_worker() {
            let mut state = lock(&self.state);
            let session = state.session.take().ok_or(ProcInfoError::NotMonitoring)?;
            session.stop.store(true, Ordering::SeqCst);
            state.stopping = Some(session.worker);
            return Ok(());
        }

        let _lifecycle = lock(&self.lifecycle);
        let session = lock(&self.state)
            .session
            .take()
            .ok_or(ProcInfoError::NotMonitoring)?;
        session.stop.store(true, Ordering::SeqCst);
        join_worker(session.worker);
        log::info!("process monitoring stopped");
        Ok(())
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.state).session.is_some()
    }

    /// Snapshot of all live processes, enriched with the active session's
    /// mode, or the configured default mode when idle
    pub fn current_processes(&self) -> Vec<Process> {
        let mode = lock(&self.state)
            .session
            .as_ref()
            .map(|session| session.mode)
            .unwrap_or(self.default_mode);
        self.snapshot(mode)
    }

    /// Snapshot of all live processes, ordered by pid
    pub fn snapshot(&self, mode: EnrichmentMode) -> Vec<Process> {
        let pids = self.table.list_live_pids();
        let mut processes: Vec<Process> = pids
            .par_iter()
            .map(|&pid| self.builder.build_from_pid(pid, mode))
            .collect();
        processes.sort_by_key(|process| process.pid);
        processes
    }

    fn on_own_worker(&self) -> bool {
        WORKER_OF.with(|worker| worker.get() == Some(self.id))
    }
}

impl Drop for ProcInfo {
    fn drop(&mut self) {
        if self.on_own_worker() {
            return;
        }
        if self.is_monitoring() {
            let _ = self.stop();
        }
        let stopping = lock(&self.state).stopping.take();
        if let Some(worker) = stopping {
            join_worker(worker);
        }
    }
}

struct Worker {
    coordinator: u64,
    source: SharedSource,
    builder: Arc<ProcessRecordBuilder>,
    mode: EnrichmentMode,
    stop: Arc<AtomicBool>,
    receive_timeout: Duration,
}

impl Worker {
    fn run<F>(self, mut callback: F)
    where
        F: FnMut(Process),
    {
        WORKER_OF.with(|worker| worker.set(Some(self.coordinator)));
        let mut last_delivered = UNIX_EPOCH;
        let mut health = SourceHealth::default();

        while !self.stop.load(Ordering::SeqCst) {
            let received = lock(&self.source).receive(self.receive_timeout);
            let raw = match received {
                Ok(Some(raw)) => {
                    health.record_success();
                    raw
                }
                Ok(None) => continue,
                Err(e) => {
                    health.record_failure(&e);
                    thread::sleep(self.receive_timeout);
                    continue;
                }
            };

            let mut process = match self.builder.build_from_event(&raw, self.mode) {
                Ok(process) => process,
                Err(e) => {
                    log::debug!("discarding event for pid {}: {}", raw.pid, e);
                    continue;
                }
            };

            // Delivery order is authoritative; never let time run backwards
            process.timestamp = clamp_timestamp(process.timestamp, &mut last_delivered);

            let pid = process.pid;
            if panic::catch_unwind(AssertUnwindSafe(|| callback(process))).is_err() {
                log::error!("monitor callback panicked on record for pid {}", pid);
            }
        }

        lock(&self.source).unsubscribe();
        // The callback may own the last handle to the coordinator
        drop(callback);
        WORKER_OF.with(|worker| worker.set(None));
    }
}

/// Tracks consecutive source failures so a dead feed is reported once
/// rather than on every receive attempt
#[derive(Debug, Default)]
struct SourceHealth {
    failures: u64,
}

impl SourceHealth {
    /// Returns true when this failure starts a new failing streak
    fn record_failure(&mut self, error: &ProcInfoError) -> bool {
        self.failures += 1;
        if self.failures == 1 {
            log::error!("event source error: {}", error);
            true
        } else {
            log::debug!("event source still failing ({} attempts): {}", self.failures, error);
            false
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            log::info!("event source recovered after {} failed attempts", self.failures);
            self.failures = 0;
        }
    }
}

fn clamp_timestamp(timestamp: SystemTime, last_delivered: &mut SystemTime) -> SystemTime {
    if timestamp < *last_delivered {
        *last_delivered
    } else {
        *last_delivered = timestamp;
        timestamp
    }
}

fn join_worker(worker: JoinHandle<()>) {
    if worker.join().is_err() {
        log::error!("monitor thread terminated abnormally");
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
