//! Byte pumps between the local stdio and the remote streams.
//!
//! Each direction runs as its own task and lives until its source reaches
//! end-of-input or an I/O error occurs. Errors end only that direction.

use std::borrow::Cow;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tssh_core::{BoxReader, BoxWriter};

use crate::console::Console;

const BUFFER_SIZE: usize = 32 * 1024;

/// Sent instead of closing the remote input when a Windows console reports
/// end-of-input on a pty session.
const CTRL_Z: u8 = 0x1A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local input to the remote side.
    Input,
    /// Remote output to the local terminal.
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOptions {
    /// Running on the Windows console subsystem.
    pub native_console: bool,
    /// The session allocated a remote pty.
    pub tty: bool,
    pub direction: Direction,
}

impl PumpOptions {
    pub fn new(tty: bool, direction: Direction) -> Self {
        Self {
            native_console: cfg!(windows),
            tty,
            direction,
        }
    }

    fn translate_newlines(&self) -> bool {
        self.native_console && !self.tty
    }

    fn soft_eof(&self) -> bool {
        self.native_console && self.tty && self.direction == Direction::Input
    }
}

/// Newline conversion between the Windows console and a pty-less remote
/// side: `\r\n` becomes `\n` on input, a bare `\n` becomes `\r\n` on output.
/// State is carried across chunks so pairs split by a read still match.
#[derive(Debug)]
pub struct LineTranslator {
    direction: Direction,
    /// Input: a trailing `\r` held back until the next chunk.
    /// Output: the previous chunk ended with `\r`.
    pending_cr: bool,
}

impl LineTranslator {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            pending_cr: false,
        }
    }

    pub fn translate<'a>(&mut self, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        match self.direction {
            Direction::Input => self.strip_cr(chunk),
            Direction::Output => self.add_cr(chunk),
        }
    }

    /// Bytes still held back at end-of-input.
    pub fn finish(&mut self) -> Option<u8> {
        let held = self.direction == Direction::Input && self.pending_cr;
        self.pending_cr = false;
        held.then_some(b'\r')
    }

    fn strip_cr<'a>(&mut self, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        if !self.pending_cr && !chunk.contains(&b'\r') {
            return Cow::Borrowed(chunk);
        }
        let mut out = Vec::with_capacity(chunk.len() + 1);
        let mut bytes = chunk.iter().copied().peekable();
        if std::mem::take(&mut self.pending_cr) && bytes.peek() != Some(&b'\n') {
            out.push(b'\r');
        }
        while let Some(b) = bytes.next() {
            if b == b'\r' {
                match bytes.peek() {
                    Some(b'\n') => continue,
                    None => {
                        self.pending_cr = true;
                        continue;
                    }
                    Some(_) => {}
                }
            }
            out.push(b);
        }
        Cow::Owned(out)
    }

    fn add_cr<'a>(&mut self, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        let prev_cr = self.pending_cr;
        if let Some(&last) = chunk.last() {
            self.pending_cr = last == b'\r';
        }
        if !chunk.contains(&b'\n') {
            return Cow::Borrowed(chunk);
        }
        let mut out = Vec::with_capacity(chunk.len() + chunk.len() / 8);
        let mut before = prev_cr;
        for &b in chunk {
            if b == b'\n' && !before {
                out.push(b'\r');
            }
            out.push(b);
            before = b == b'\r';
        }
        Cow::Owned(out)
    }
}

/// Copy `reader` into `writer` until end-of-input or an error, then close
/// the writer once.
pub async fn forward<R, W>(mut reader: R, mut writer: W, options: PumpOptions)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut translator = options
        .translate_newlines()
        .then(|| LineTranslator::new(options.direction));

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) if options.soft_eof() => {
                // The console's end-of-input is Ctrl+Z: pass it on, keep reading.
                if let Err(e) = write_chunk(&mut writer, &[CTRL_Z]).await {
                    warn!("wrap stdio write failed: {e}");
                    break;
                }
                continue;
            }
            Ok(0) => {
                if let Some(held) = translator.as_mut().and_then(LineTranslator::finish) {
                    if let Err(e) = write_chunk(&mut writer, &[held]).await {
                        warn!("wrap stdio write failed: {e}");
                    }
                }
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("wrap stdio read failed: {e}");
                break;
            }
        };

        let chunk = match translator.as_mut() {
            Some(t) => t.translate(&buffer[..n]),
            None => Cow::Borrowed(&buffer[..n]),
        };
        if let Err(e) = write_chunk(&mut writer, &chunk).await {
            warn!("wrap stdio write failed: {e}");
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("closing pump sink failed: {e}");
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    writer.write_all(data).await?;
    writer.flush().await
}

/// Start plain pumps for whichever remote streams are present: local stdin
/// to `server_in`, `server_out` to local stdout, `server_err` to local
/// stderr. The returned handles are informational; callers do not join them.
pub fn wrap_stdio(
    console: &dyn Console,
    server_in: Option<BoxWriter>,
    server_out: Option<BoxReader>,
    server_err: Option<BoxReader>,
    tty: bool,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::with_capacity(3);
    if let Some(server_in) = server_in {
        let stdin = console.stdin();
        tasks.push(tokio::spawn(forward(
            stdin,
            server_in,
            PumpOptions::new(tty, Direction::Input),
        )));
    }
    if let Some(server_out) = server_out {
        let stdout = console.stdout();
        tasks.push(tokio::spawn(forward(
            server_out,
            stdout,
            PumpOptions::new(tty, Direction::Output),
        )));
    }
    if let Some(server_err) = server_err {
        let stderr = console.stderr();
        tasks.push(tokio::spawn(forward(
            server_err,
            stderr,
            PumpOptions::new(tty, Direction::Output),
        )));
    }
    tasks
}
