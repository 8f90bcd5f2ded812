//! Plain-text transfer output for the `dashdrop` binary.

use std::io::{self, Write};
use std::sync::Mutex;

use protocol::ErrorKind;

use crate::session::TransferObserver;

/// Prints a line when a file starts and when it is done.
pub struct ConsoleObserver<W = io::Stdout> {
    verb: &'static str,
    out: Mutex<W>,
}

impl ConsoleObserver {
    pub fn sending() -> Self {
        Self::with_writer("Sending", io::stdout())
    }

    pub fn receiving() -> Self {
        Self::with_writer("Receiving", io::stdout())
    }
}

impl<W: Write> ConsoleObserver<W> {
    pub fn with_writer(verb: &'static str, out: W) -> Self {
        Self {
            verb,
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn line(&self, message: std::fmt::Arguments<'_>) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        // Output is best effort; a closed stdout must not abort the transfer.
        let _ = writeln!(out, "{}", message);
        let _ = out.flush();
    }
}

impl<W: Write + Send> TransferObserver for ConsoleObserver<W> {
    fn on_file_started(&self, name: &str, size: u64) {
        self.line(format_args!("{} {} ({} bytes)", self.verb, name, size));
    }

    fn on_progress(&self, bytes_so_far: u64, total: u64) {
        if bytes_so_far == total {
            self.line(format_args!("  done"));
        }
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.line(format_args!("Error ({}): {}", kind, message));
    }
}
