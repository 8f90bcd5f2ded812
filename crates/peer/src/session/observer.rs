//! Progress, completion and error callbacks.

use protocol::ErrorKind;
use tokio::sync::mpsc;

/// Callbacks fired by a running session.
///
/// Progress is reported per file: `on_file_started` resets it and every
/// `on_progress` carries the bytes of the current file so far.
pub trait TransferObserver: Send + Sync {
    fn on_file_started(&self, _name: &str, _size: u64) {}

    fn on_progress(&self, _bytes_so_far: u64, _total: u64) {}

    fn on_complete(&self) {}

    fn on_error(&self, _kind: ErrorKind, _message: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// A session callback as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    FileStarted { name: String, size: u64 },
    Progress { bytes_so_far: u64, total: u64 },
    Complete,
    Error { kind: ErrorKind, message: String },
}

/// Forwards callbacks into a channel.
///
/// The channel is unbounded so callbacks never block the session.
#[derive(Debug, Clone)]
pub struct EventObserver {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl EventObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: TransferEvent) {
        // Receiver dropped: nobody is listening.
        let _ = self.tx.send(event);
    }
}

impl TransferObserver for EventObserver {
    fn on_file_started(&self, name: &str, size: u64) {
        self.emit(TransferEvent::FileStarted {
            name: name.to_string(),
            size,
        });
    }

    fn on_progress(&self, bytes_so_far: u64, total: u64) {
        self.emit(TransferEvent::Progress {
            bytes_so_far,
            total,
        });
    }

    fn on_complete(&self) {
        self.emit(TransferEvent::Complete);
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.emit(TransferEvent::Error {
            kind,
            message: message.to_string(),
        });
    }
}
