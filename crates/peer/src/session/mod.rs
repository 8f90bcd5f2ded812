//! Transfer session module.
//!
//! This module provides the sequential send and receive loops, the deferred
//! decryption of received `.crypt` files and the callback contracts the UI
//! layer implements. Only one session runs per process: [`SessionSlot`]
//! cancels the previous session when a new one begins.

pub mod decrypt;
pub mod observer;
pub mod receiver;
pub mod sender;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;

use protocol::{ProtocolError, Result};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use decrypt::{DecryptOutcome, PendingDecryption};
pub use observer::{EventObserver, NoopObserver, TransferEvent, TransferObserver};
pub use receiver::{receive, ReceiveOptions, ReceiveOutcome};
pub use sender::{send, SendOptions, TransferSummary};

/// Errors building a transfer request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Nothing to send.
    #[error("transfer request is empty")]
    Empty,

    /// A requested path does not exist.
    #[error("path not found: {0}")]
    NotFound(PathBuf),
}

/// Ordered list of files and directories to send. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    paths: Vec<PathBuf>,
}

impl TransferRequest {
    pub fn new(paths: Vec<PathBuf>) -> std::result::Result<Self, RequestError> {
        if paths.is_empty() {
            return Err(RequestError::Empty);
        }
        if let Some(missing) = paths.iter().find(|p| !p.exists()) {
            return Err(RequestError::NotFound(missing.clone()));
        }
        // `.` and `..` carry no name to send under.
        let paths = paths
            .into_iter()
            .map(|path| match path.file_name() {
                Some(_) => Ok(path),
                None => path.canonicalize().map_err(|_| RequestError::NotFound(path)),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Whether folder metadata has to be sent.
    pub fn contains_directory(&self) -> bool {
        self.paths.iter().any(|p| p.is_dir())
    }
}

/// Supplies the password for received encrypted files.
///
/// Returning `None` gives up; the encrypted files stay on disk.
pub trait PasswordProvider: Send {
    fn password(&mut self) -> Option<String>;
}

impl<F> PasswordProvider for F
where
    F: FnMut() -> Option<String> + Send,
{
    fn password(&mut self) -> Option<String> {
        self()
    }
}

/// Supplies the default directory for received files.
pub trait SaveDirProvider {
    fn save_dir(&self) -> PathBuf;
}

/// Holds the cancellation token of the running session.
#[derive(Debug, Default)]
pub struct SessionSlot {
    parent: Option<CancellationToken>,
    current: Mutex<Option<CancellationToken>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions begun in this slot are also cancelled when `parent` is.
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            parent: Some(parent),
            current: Mutex::new(None),
        }
    }

    /// Start a new session, cancelling the one before it.
    pub fn begin(&self) -> CancellationToken {
        let token = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = current.replace(token.clone()) {
            if !previous.is_cancelled() {
                debug!("Cancelling previous session");
                previous.cancel();
            }
        }
        token
    }

    /// Cancel the running session, if any.
    pub fn cancel_current(&self) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = current.take() {
            token.cancel();
        }
    }

    /// Whether a session is running.
    pub fn is_active(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

/// Race `operation` against `cancel`. A cancelled session reads as a closed
/// connection.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            Err(ProtocolError::ConnectionClosed("session cancelled".to_string()))
        }
        result = operation => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_request_validation() {
        assert_eq!(TransferRequest::new(vec![]), Err(RequestError::Empty));

        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.txt");
        assert_eq!(
            TransferRequest::new(vec![dir.path().to_path_buf(), missing.clone()]),
            Err(RequestError::NotFound(missing))
        );

        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"a").unwrap();
        let request = TransferRequest::new(vec![file.clone()]).unwrap();
        assert!(!request.contains_directory());
        assert_eq!(request.paths(), &[file]);

        let request = TransferRequest::new(vec![dir.path().to_path_buf()]).unwrap();
        assert!(request.contains_directory());
    }

    #[test]
    fn test_request_names_parent_references() {
        let dir = TempDir::new().unwrap();
        let inner = dir.path().join("project").join("src");
        std::fs::create_dir_all(&inner).unwrap();

        let request = TransferRequest::new(vec![inner.join("..")]).unwrap();
        let path = &request.paths()[0];
        assert_eq!(path.file_name().unwrap(), "project");
        assert!(path.is_dir());
    }

    #[test]
    fn test_session_slot_cancels_previous() {
        let slot = SessionSlot::new();
        assert!(!slot.is_active());

        let first = slot.begin();
        assert!(slot.is_active());
        let second = slot.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        slot.cancel_current();
        assert!(second.is_cancelled());
        assert!(!slot.is_active());
    }

    #[test]
    fn test_session_slot_follows_parent() {
        let shutdown = CancellationToken::new();
        let slot = SessionSlot::with_parent(shutdown.clone());
        let session = slot.begin();

        shutdown.cancel();
        assert!(session.is_cancelled());
        assert!(!slot.is_active());
    }

    #[test]
    fn test_closure_password_provider() {
        let mut answers = vec!["second".to_string(), "first".to_string()];
        let mut provider = move || answers.pop();
        assert_eq!(provider.password().as_deref(), Some("first"));
        assert_eq!(provider.password().as_deref(), Some("second"));
        assert_eq!(provider.password(), None);
    }

    #[tokio::test]
    async fn test_cancelled_read_surfaces_connection_closed() {
        let cancel = CancellationToken::new();
        let pending = cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = pending.await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
    }
}
