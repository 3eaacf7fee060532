//! Local terminal access: stdio streams, raw mode, size and resize events.
//!
//! Wraps crossterm's terminal operations behind the [`Console`] trait so the
//! orchestrator can run against a scripted console in tests.

use std::io::IsTerminal;

use crossterm::terminal;
use tokio::sync::mpsc;
use tracing::debug;
use tssh_core::{BoxReader, BoxWriter, TsshError, TsshResult};

/// RAII guard that restores the terminal to cooked mode on drop.
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    /// Enter raw terminal mode.
    pub fn enter() -> TsshResult<Self> {
        terminal::enable_raw_mode()
            .map_err(|e| TsshError::Terminal(format!("failed to enable raw mode: {e}")))?;
        debug!("entered raw mode");
        Ok(Self { active: true })
    }

    /// A guard that restores nothing, for consoles without a real terminal.
    pub fn inactive() -> Self {
        Self { active: false }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            // Nothing useful to do on failure here.
            let _ = terminal::disable_raw_mode();
            debug!("restored terminal mode");
        }
    }
}

/// The local side of a session.
pub trait Console: Send + Sync {
    /// Whether stdin is an interactive terminal.
    fn is_terminal(&self) -> bool;

    /// Current terminal size as `(columns, rows)`.
    fn size(&self) -> std::io::Result<(u16, u16)>;

    fn enter_raw_mode(&self) -> TsshResult<RawModeGuard>;

    fn stdin(&self) -> BoxReader;

    fn stdout(&self) -> BoxWriter;

    fn stderr(&self) -> BoxWriter;

    /// A stream of `(columns, rows)` terminal resize events.
    fn resize_events(&self) -> mpsc::Receiver<(u16, u16)>;
}

/// The process's own stdio and controlling terminal.
#[derive(Debug, Clone, Copy)]
pub struct StdConsole {
    interactive: bool,
}

impl StdConsole {
    pub fn new() -> Self {
        Self {
            interactive: std::io::stdin().is_terminal(),
        }
    }
}

impl Default for StdConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for StdConsole {
    fn is_terminal(&self) -> bool {
        self.interactive
    }

    fn size(&self) -> std::io::Result<(u16, u16)> {
        terminal::size()
    }

    fn enter_raw_mode(&self) -> TsshResult<RawModeGuard> {
        RawModeGuard::enter()
    }

    fn stdin(&self) -> BoxReader {
        Box::new(tokio::io::stdin())
    }

    fn stdout(&self) -> BoxWriter {
        Box::new(tokio::io::stdout())
    }

    fn stderr(&self) -> BoxWriter {
        Box::new(tokio::io::stderr())
    }

    #[cfg(unix)]
    fn resize_events(&self) -> mpsc::Receiver<(u16, u16)> {
        use tokio::signal::unix::{signal, SignalKind};

        let (tx, rx) = mpsc::channel(8);
        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to listen for SIGWINCH: {e}");
                return rx;
            }
        };
        tokio::spawn(async move {
            while sigwinch.recv().await.is_some() {
                if let Ok(size) = terminal::size() {
                    if tx.send(size).await.is_err() {
                        break;
                    }
                }
            }
        });
        rx
    }

    #[cfg(not(unix))]
    fn resize_events(&self) -> mpsc::Receiver<(u16, u16)> {
        // No resize signal on this platform; poll for changes.
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut last = terminal::size().ok();
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(200));
            loop {
                tick.tick().await;
                let current = terminal::size().ok();
                if current != last {
                    last = current;
                    if let Some(size) = current {
                        if tx.send(size).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Make sure the console understands ANSI escape sequences.
#[cfg(windows)]
pub fn setup_virtual_terminal() -> TsshResult<()> {
    if crossterm::ansi_support::supports_ansi() {
        Ok(())
    } else {
        Err(TsshError::Terminal(
            "virtual terminal processing is not supported by this console".into(),
        ))
    }
}

/// Make sure the console understands ANSI escape sequences.
#[cfg(not(windows))]
pub fn setup_virtual_terminal() -> TsshResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_guard_drops_quietly() {
        let guard = RawModeGuard::inactive();
        drop(guard);
    }

    #[test]
    fn virtual_terminal_setup_is_noop_off_windows() {
        if !cfg!(windows) {
            assert!(setup_virtual_terminal().is_ok());
        }
    }
}
