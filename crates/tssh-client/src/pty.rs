//! Local pseudo-terminal for the interactive `ssh` channel, via portable-pty.
//!
//! The child sees a real terminal, so the remote side gets a pty as if
//! `ssh` had been run from the user's shell. The master's blocking reader
//! and writer are bridged to tokio channels on dedicated threads.

use std::io::{Read, Write};
use std::sync::Mutex;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tssh_core::{TsshError, TsshResult};

const CHUNK_SIZE: usize = 32 * 1024;

/// A process running inside a local pseudo-terminal.
pub struct PtyProcess {
    /// Kept for resizing; `MasterPty` is not `Sync`.
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: watch::Receiver<Option<u32>>,
}

/// The byte channels of a [`PtyProcess`]: chunks written by the child and
/// a sender for chunks to type into it.
pub struct PtyIo {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub input: mpsc::Sender<Vec<u8>>,
}

impl PtyProcess {
    /// Spawn `program args...` in a new pty of `cols` x `rows`.
    pub fn spawn(
        program: &str,
        args: &[String],
        cols: u16,
        rows: u16,
    ) -> TsshResult<(Self, PtyIo)> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| TsshError::Session(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TsshError::Session(format!("failed to spawn {program}: {e}")))?;
        // The child holds its own copy; ours would keep the pty open.
        drop(pair.slave);
        info!(cols, rows, pid = child.process_id(), "pty child spawned");

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TsshError::Session(format!("failed to clone pty reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| TsshError::Session(format!("failed to take pty writer: {e}")))?;
        let killer = child.clone_killer();

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(16);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("pty read ended: {e}");
                        break;
                    }
                }
            }
        });

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(16);
        std::thread::spawn(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                    warn!("pty write failed: {e}");
                    break;
                }
            }
        });

        let (exit_tx, exited) = watch::channel(None);
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code(),
                Err(e) => {
                    warn!("waiting for pty child failed: {e}");
                    u32::MAX
                }
            };
            info!(code, "pty child exited");
            let _ = exit_tx.send(Some(code));
        });

        Ok((
            Self {
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
                exited,
            },
            PtyIo {
                output: output_rx,
                input: input_tx,
            },
        ))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> TsshResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| TsshError::Other("pty master lock poisoned".into()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| TsshError::Terminal(format!("pty resize failed: {e}")))?;
        debug!(cols, rows, "pty resized");
        Ok(())
    }

    /// Wait for the child to exit and return its exit code.
    pub async fn wait(&self) -> u32 {
        let mut exited = self.exited.clone();
        let code = match exited.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(u32::MAX),
            // The waiter thread is gone, so is the child.
            Err(_) => u32::MAX,
        };
        code
    }

    pub fn kill(&self) -> TsshResult<()> {
        if self.exited.borrow().is_some() {
            return Ok(());
        }
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| TsshError::Other("pty killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| TsshError::Session(format!("kill failed: {e}")))
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
