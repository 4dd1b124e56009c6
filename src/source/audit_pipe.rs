//! Event source reading BSM records from the audit pipe
//!
//! The pipe only delivers the event classes selected in the host audit
//! configuration; process lifecycle events belong to the `pc` class.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::constants::AUDIT_QUEUE_CAPACITY;
use crate::error::{ProcInfoError, Result};
use crate::models::RawEvent;
use crate::source::bsm::{parse_record, RecordReader};
use crate::source::EventSource;

pub struct AuditPipeSource {
    path: PathBuf,
    rx: Option<Receiver<RawEvent>>,
    running: Arc<AtomicBool>,
    queue_capacity: usize,
}

impl AuditPipeSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            rx: None,
            running: Arc::new(AtomicBool::new(false)),
            queue_capacity: AUDIT_QUEUE_CAPACITY,
        }
    }

    /// Bound on decoded events waiting for the consumer
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    fn open_pipe(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| {
            let denied = e.kind() == io::ErrorKind::PermissionDenied;
            let hint = if denied && !nix::unistd::geteuid().is_root() {
                " (reading the audit pipe requires root)"
            } else {
                ""
            };
            ProcInfoError::Source(format!("cannot open {}: {}{}", self.path.display(), e, hint))
        })
    }
}

impl EventSource for AuditPipeSource {
    fn subscribe(&mut self) -> Result<()> {
        if self.rx.is_some() {
            return Ok(());
        }

        let pipe = self.open_pipe()?;
        let (tx, rx) = mpsc::sync_channel(self.queue_capacity);
        // Fresh flag per subscription so a lingering reader from an earlier
        // one cannot be revived
        self.running = Arc::new(AtomicBool::new(true));
        let running = Arc::clone(&self.running);
        let path = self.path.clone();

        thread::Builder::new()
            .name("procinfo-auditpipe".to_string())
            .spawn(move || read_loop(pipe, &path, tx, running))
            .map_err(|e| ProcInfoError::Source(format!("cannot start audit pipe reader: {}", e)))?;

        self.rx = Some(rx);
        log::debug!("subscribed to {}", self.path.display());
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<RawEvent>> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| ProcInfoError::Source("not subscribed".to_string()))?;

        match rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ProcInfoError::Source(format!(
                "audit pipe reader for {} stopped",
                self.path.display()
            ))),
        }
    }

    fn unsubscribe(&mut self) {
        // The reader may be blocked in read(); it exits on its next record
        self.running.store(false, Ordering::SeqCst);
        self.rx = None;
    }
}

/// Decode records until unsubscribed, the stream ends, or the pipe fails.
/// Malformed records are skipped; a full queue blocks the reader.
fn read_loop<R: Read>(pipe: R, path: &Path, tx: SyncSender<RawEvent>, running: Arc<AtomicBool>) {
    let mut reader = RecordReader::new(pipe);

    while running.load(Ordering::SeqCst) {
        let bytes = match reader.next_record() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                log::debug!("end of audit stream on {}", path.display());
                break;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    log::error!("failed to read audit record from {}: {}", path.display(), e);
                }
                break;
            }
        };

        let record = match parse_record(&bytes) {
            Ok(record) => record,
            Err(e) => {
                log::debug!("skipping malformed audit record: {}", e);
                continue;
            }
        };

        if let Some(event) = record.to_raw_event() {
            if tx.send(event).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{AUE_EXECVE, AUE_EXIT, AUE_FORK};
    use crate::source::bsm::encode::RecordBuilder;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn audit_trail(records: &[Vec<u8>]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        for record in records {
            tmp.write_all(record).unwrap();
        }
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn test_missing_pipe_fails_subscription() {
        let mut source = AuditPipeSource::new("/nonexistent/auditpipe");
        assert!(matches!(source.subscribe(), Err(ProcInfoError::Source(_))));
    }

    #[test]
    fn test_receive_before_subscribe_fails() {
        let mut source = AuditPipeSource::new("/nonexistent/auditpipe");
        assert!(source.receive(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_lifecycle_records_delivered_in_order() {
        let trail = audit_trail(&[
            RecordBuilder::default()
                .arg32(0, 4300, "child PID")
                .subject32(4242, 501)
                .return32(0, 4300)
                .finish(AUE_FORK, 1_700_000_000, 0),
            // open(2): not a lifecycle record
            RecordBuilder::default()
                .path("/etc/hosts")
                .subject32(4300, 501)
                .return32(0, 3)
                .finish(72, 1_700_000_000, 1),
            RecordBuilder::default()
                .exec_args(&["/bin/ls"])
                .path("/bin/ls")
                .subject32(4300, 501)
                .return32(0, 0)
                .finish(AUE_EXECVE, 1_700_000_000, 2),
            RecordBuilder::default()
                .exit(0)
                .subject32(4300, 501)
                .return32(0, 0)
                .finish(AUE_EXIT, 1_700_000_000, 3),
        ]);

        let mut source = AuditPipeSource::new(trail.path());
        source.subscribe().unwrap();

        let timeout = Duration::from_secs(2);
        let codes: Vec<(i32, u16)> = (0..3)
            .map(|_| {
                let event = source.receive(timeout).unwrap().expect("event");
                (event.pid, event.event_code)
            })
            .collect();
        assert_eq!(codes, vec![(4300, AUE_FORK), (4300, AUE_EXECVE), (4300, AUE_EXIT)]);

        // End of the trail: the reader has stopped
        assert!(source.receive(timeout).is_err());
        source.unsubscribe();
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let mut bad = RecordBuilder::default()
            .subject32(1, 0)
            .finish(AUE_EXIT, 1, 0);
        // Corrupt the subject token id into an address-typed token with a bad type
        bad[18] = 0x7a;
        bad[18 + 1 + 32] = 0xff;

        let good = RecordBuilder::default()
            .exit(1)
            .subject32(77, 0)
            .finish(AUE_EXIT, 2, 0);

        let trail = audit_trail(&[bad, good]);
        let mut source = AuditPipeSource::new(trail.path());
        source.subscribe().unwrap();

        let event = source.receive(Duration::from_secs(2)).unwrap().expect("event");
        assert_eq!(event.pid, 77);
        assert_eq!(event.exit_status, Some(1));
    }

    #[test]
    fn test_bad_frame_does_not_stop_reader() {
        let mut bad = RecordBuilder::default()
            .exit(0)
            .subject32(66, 0)
            .finish(AUE_EXIT, 1, 0);
        bad[1..5].copy_from_slice(&3u32.to_be_bytes());
        let good = RecordBuilder::default()
            .exit(0)
            .subject32(77, 0)
            .finish(AUE_EXIT, 2, 0);

        let trail = audit_trail(&[bad, good]);
        let mut source = AuditPipeSource::new(trail.path());
        source.subscribe().unwrap();

        let event = source.receive(Duration::from_secs(2)).unwrap().expect("event");
        assert_eq!(event.pid, 77);
    }

    #[test]
    fn test_out_of_range_timestamp_does_not_stop_reader() {
        let bad = RecordBuilder::default()
            .exit(0)
            .subject32(66, 0)
            .finish64(AUE_EXIT, u64::MAX, 0);
        let good = RecordBuilder::default()
            .exit(0)
            .subject32(77, 0)
            .finish(AUE_EXIT, 2, 0);

        let trail = audit_trail(&[bad, good]);
        let mut source = AuditPipeSource::new(trail.path());
        source.subscribe().unwrap();

        let event = source.receive(Duration::from_secs(2)).unwrap().expect("event");
        assert_eq!(event.pid, 77);
    }

    #[test]
    fn test_reader_waits_when_queue_is_full() {
        let records: Vec<Vec<u8>> = (1..=5)
            .map(|pid| {
                RecordBuilder::default()
                    .exit(0)
                    .subject32(pid, 0)
                    .finish(AUE_EXIT, pid, 0)
            })
            .collect();
        let stream = Cursor::new(records.concat());
        let (tx, rx) = mpsc::sync_channel(2);
        let running = Arc::new(AtomicBool::new(true));

        let reader = {
            let running = Arc::clone(&running);
            thread::spawn(move || read_loop(stream, Path::new("trail"), tx, running))
        };

        thread::sleep(Duration::from_millis(200));
        assert!(!reader.is_finished(), "reader should block on the full queue");

        let pids: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().pid)
            .collect();
        assert_eq!(pids, vec![1, 2, 3, 4, 5]);
        reader.join().unwrap();
    }

    #[test]
    fn test_queue_capacity_is_at_least_one() {
        let source = AuditPipeSource::new("/dev/null").with_queue_capacity(0);
        assert_eq!(source.queue_capacity, 1);
    }
}
