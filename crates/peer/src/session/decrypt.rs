//! Deferred decryption of received `.crypt` files.
//!
//! Encrypted frames are written to disk as-is during the session. Once the
//! session is over the user is asked for the password; every pending file is
//! decrypted with it. A wrong password counts one attempt. When the attempts
//! run out the encrypted files are deleted.

use std::fs;
use std::path::PathBuf;

use protocol::{crypto, ProtocolError, Result};
use tracing::{debug, info, warn};

use super::PasswordProvider;

/// Result of a decryption attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// Everything decrypted; the `.crypt` files are gone.
    Decrypted(Vec<PathBuf>),
    /// The password did not fit. Nothing was written.
    WrongPassword { remaining_attempts: u32 },
    /// No attempts left; the encrypted files were deleted.
    AttemptsExhausted { deleted: Vec<PathBuf> },
    /// The provider gave up; the encrypted files stay on disk.
    Abandoned { kept: Vec<PathBuf> },
}

/// Received encrypted files awaiting a password.
#[derive(Debug)]
pub struct PendingDecryption {
    files: Vec<PathBuf>,
    attempts: u32,
    max_attempts: u32,
}

impl PendingDecryption {
    pub fn new(files: Vec<PathBuf>, max_attempts: u32) -> Self {
        Self {
            files,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Decrypt every pending file with `password`.
    ///
    /// All or nothing: if any file fails to decrypt, outputs written in this
    /// attempt are removed again. This is CPU bound; call it off the async
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns filesystem errors. A wrong password is not an error but an
    /// outcome.
    pub fn try_password(&mut self, password: &str) -> Result<DecryptOutcome> {
        if self.files.is_empty() {
            return Ok(DecryptOutcome::Decrypted(Vec::new()));
        }
        if self.remaining_attempts() == 0 {
            return Ok(self.exhaust());
        }

        let mut outputs = Vec::with_capacity(self.files.len());
        let mut failure = None;
        for path in &self.files {
            match crypto::decrypt_file(path, password) {
                Ok(output) => {
                    debug!("Decrypted {} -> {}", path.display(), output.display());
                    outputs.push(output);
                }
                Err(e) => {
                    debug!("Decryption of {} failed: {}", path.display(), e);
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            remove_all(&outputs);
            if !matches!(e, ProtocolError::Decryption(_)) {
                return Err(e);
            }

            self.attempts += 1;
            if self.remaining_attempts() == 0 {
                return Ok(self.exhaust());
            }
            warn!(
                "Wrong password, {} attempt(s) left",
                self.remaining_attempts()
            );
            return Ok(DecryptOutcome::WrongPassword {
                remaining_attempts: self.remaining_attempts(),
            });
        }

        remove_all(&self.files);
        self.files.clear();
        info!("Decrypted {} file(s)", outputs.len());
        Ok(DecryptOutcome::Decrypted(outputs))
    }

    /// Ask `provider` for passwords until decryption succeeds, the provider
    /// gives up, or the attempts run out.
    pub fn run_with(&mut self, provider: &mut dyn PasswordProvider) -> Result<DecryptOutcome> {
        loop {
            if self.files.is_empty() {
                return Ok(DecryptOutcome::Decrypted(Vec::new()));
            }
            let Some(password) = provider.password() else {
                info!(
                    "Password prompt abandoned, keeping {} encrypted file(s)",
                    self.files.len()
                );
                return Ok(DecryptOutcome::Abandoned {
                    kept: self.files.clone(),
                });
            };

            match self.try_password(&password)? {
                DecryptOutcome::WrongPassword { .. } => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    fn exhaust(&mut self) -> DecryptOutcome {
        warn!(
            "Password attempts exhausted, deleting {} encrypted file(s)",
            self.files.len()
        );
        remove_all(&self.files);
        DecryptOutcome::AttemptsExhausted {
            deleted: std::mem::take(&mut self.files),
        }
    }
}

fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
