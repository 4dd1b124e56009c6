//! Kernel event sources
//!
//! An [`EventSource`] delivers raw lifecycle events with a bounded blocking
//! receive. Implementations:
//! - [`ChannelSource`]: events pushed in-process through an [`EventSender`]
//! - [`PollingSource`]: synthesized from process-table diffs
//! - [`AuditPipeSource`]: BSM audit records from the audit pipe device

pub mod audit_pipe;
pub mod bsm;
pub mod polling;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ProcInfoConfig, SourceKind};
use crate::error::{ProcInfoError, Result};
use crate::models::{EventType, RawEvent};
use crate::process_table::ProcessTable;

pub use audit_pipe::AuditPipeSource;
pub use polling::PollingSource;

/// A subscription to process lifecycle notifications
pub trait EventSource: Send {
    /// Start delivering events. Fails if the feed cannot be opened.
    fn subscribe(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next event. `Ok(None)` means nothing
    /// arrived in time.
    fn receive(&mut self, timeout: Duration) -> Result<Option<RawEvent>>;

    /// Stop delivering events and release the feed
    fn unsubscribe(&mut self);
}

/// Decode the event type of a raw event
pub fn decode(raw: &RawEvent) -> Result<EventType> {
    EventType::from_code(raw.event_code)
}

/// Open the source selected by configuration
pub fn open(config: &ProcInfoConfig, table: Arc<dyn ProcessTable>) -> Result<Box<dyn EventSource>> {
    match config.monitor.source {
        SourceKind::Polling => Ok(Box::new(PollingSource::new(table, config.polling_interval()))),
        SourceKind::AuditPipe => Ok(Box::new(AuditPipeSource::new(
            &config.monitor.audit_pipe_path,
        ))),
        SourceKind::Channel => Err(ProcInfoError::Source(
            "a channel source has no kernel feed; create it with ChannelSource::new".to_string(),
        )),
    }
}

/// Handle for pushing events into a [`ChannelSource`]
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<RawEvent>,
}

impl EventSender {
    pub fn send(&self, event: RawEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| ProcInfoError::Source("channel source was dropped".to_string()))
    }
}

/// Event source fed in-process. Events sent while unsubscribed are held
/// until the next subscription.
pub struct ChannelSource {
    rx: Receiver<RawEvent>,
    subscribed: bool,
}

impl ChannelSource {
    pub fn new() -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                rx,
                subscribed: false,
            },
            EventSender { tx },
        )
    }
}

impl EventSource for ChannelSource {
    fn subscribe(&mut self) -> Result<()> {
        self.subscribed = true;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<RawEvent>> {
        if !self.subscribed {
            return Err(ProcInfoError::Source("not subscribed".to_string()));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                // All senders gone: behave like an idle feed
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn unsubscribe(&mut self) {
        self.subscribed = false;
    }
}
