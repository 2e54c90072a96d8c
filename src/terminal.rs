use std::io::{self, stdin, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;
use tracing::debug;

use crate::SessionError;

/// Set while a [`RawModeGuard`] holds the terminal in raw mode
static RAW_MODE: AtomicBool = AtomicBool::new(false);

pub fn raw_mode_active() -> bool {
    RAW_MODE.load(Ordering::Relaxed)
}

/// Keeps the terminal in raw mode (no echo, no line buffering) while alive.
///
/// Dropping the guard restores the previous mode, so every way out of a
/// session (return, `?`, panic unwinding) leaves the terminal usable.
#[derive(Debug)]
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    /// Set the terminal in raw mode if stdin is a terminal.
    ///
    /// When input is piped there is nothing to switch, and the guard is inert.
    pub fn acquire() -> Result<Self, SessionError> {
        if !stdin().is_tty() {
            debug!("stdin is not a terminal, raw mode skipped");
            return Ok(RawModeGuard { active: false });
        }

        enable_raw_mode().map_err(SessionError::RawMode)?;
        RAW_MODE.store(true, Ordering::Relaxed);
        Ok(RawModeGuard { active: true })
    }

    /// Whether raw mode was actually enabled.
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            restore_terminal();
            self.active = false;
        }
    }
}

pub fn restore_terminal() {
    RAW_MODE.store(false, Ordering::Relaxed);

    match disable_raw_mode() {
        Ok(_) => {}
        Err(_) => eprintln!("{}", "failed to restore terminal".red()),
    }
}

/// Writer for diagnostics that share the terminal with a session.
///
/// While raw mode is on, every bare '\n' gets a '\r' in front so log lines
/// start at the left margin.
pub struct DiagnosticWriter<W> {
    inner: W,
    translate: bool,
}

impl DiagnosticWriter<io::Stderr> {
    /// Stderr, translated only if raw mode is active right now. Meant to be
    /// handed to the log subscriber, which calls it for every event.
    pub fn stderr() -> Self {
        DiagnosticWriter::new(io::stderr(), raw_mode_active())
    }
}

impl<W: Write> DiagnosticWriter<W> {
    pub fn new(inner: W, translate: bool) -> Self {
        DiagnosticWriter { inner, translate }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for DiagnosticWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.translate {
            return self.inner.write(buf);
        }

        let mut translated = Vec::with_capacity(buf.len() + 8);
        let mut previous = None;
        for &byte in buf {
            if byte == b'\n' && previous != Some(b'\r') {
                translated.push(b'\r');
            }
            translated.push(byte);
            previous = Some(byte);
        }

        self.inner.write_all(&translated)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Restore the terminal and exit once `signum` is received.
///
/// Raw mode turns Ctrl-C into a plain byte, but a SIGTERM or SIGHUP still ends
/// the process without running destructors.
#[cfg(unix)]
pub async fn end_on_signal(signum: tokio::signal::unix::SignalKind) -> Result<(), SessionError> {
    let mut sig = tokio::signal::unix::signal(signum).map_err(SessionError::Signal)?;

    sig.recv().await;
    restore_terminal();

    std::process::exit(128 + signum.as_raw_value());
}
