//! Contracts for the login layer.
//!
//! The engine never performs the handshake itself: a [`LoginProvider`]
//! hands back a connected [`Login`] whose byte streams are then wired by the
//! orchestrator. Traits use boxed futures so they stay object-safe and can be
//! shared as `Arc<dyn ...>` between the orchestrator and spawned pump tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::cleanup::Cleanups;
use crate::error::TsshResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Readable half of a remote or local stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable, closable half of a remote or local stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional byte stream (e.g. a tunnelled TCP connection).
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxStream = Box<dyn ByteStream>;

/// The live connection to the remote host after authentication.
pub trait LoginHandle: Send + Sync {
    /// Open a new channel to `addr` (`host:port`) through the existing
    /// connection. `None` means no timeout.
    fn dial<'a>(
        &'a self,
        addr: &'a str,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, TsshResult<BoxStream>>;

    /// Resolve once the connection is gone.
    fn wait(&self) -> BoxFuture<'_, TsshResult<()>>;

    /// Tear the connection down.
    fn close(&self) -> BoxFuture<'_, TsshResult<()>>;
}

/// The interactive sub-channel of a login.
pub trait RemoteSession: Send + Sync {
    /// Run `command` on the remote side.
    fn start<'a>(&'a self, command: &'a str) -> BoxFuture<'a, TsshResult<()>>;

    /// Start the remote login shell.
    fn shell(&self) -> BoxFuture<'_, TsshResult<()>>;

    /// Notify the remote pty of a new size.
    fn window_change(&self, rows: u16, cols: u16) -> TsshResult<()>;

    /// Resolve once the remote command or shell has ended.
    fn wait(&self) -> BoxFuture<'_, TsshResult<()>>;

    fn close(&self) -> BoxFuture<'_, TsshResult<()>>;
}

/// What the orchestrator asks of a login provider.
#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    /// Resolved destination (alias or `[user@]host`).
    pub destination: String,
    /// Whether the interactive channel should allocate a pseudo-terminal.
    pub tty: bool,
    /// Skip the interactive channel entirely (`-N` / `-W`).
    pub no_session: bool,
    /// Environment variables to send to the remote side.
    pub env: Vec<(String, String)>,
}

/// A successful login: the handle, the optional interactive channel and its
/// three byte streams.
pub struct Login {
    pub handle: Arc<dyn LoginHandle>,
    pub session: Option<Arc<dyn RemoteSession>>,
    pub stdin: Option<BoxWriter>,
    pub stdout: Option<BoxReader>,
    pub stderr: Option<BoxReader>,
}

/// Establishes a [`Login`] to a destination.
///
/// Providers may stage resources on `cleanups`: `after_login` entries are
/// released once stdio wiring is committed, `on_exit` entries at process exit.
pub trait LoginProvider: Send + Sync {
    fn login<'a>(
        &'a self,
        request: &'a LoginRequest,
        cleanups: &'a mut Cleanups,
    ) -> BoxFuture<'a, TsshResult<Login>>;
}
