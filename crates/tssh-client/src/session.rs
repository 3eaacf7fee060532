//! A logged-in session as owned by the orchestrator.
//!
//! The three byte streams are claimed (taken out) by exactly one wiring
//! strategy. The channel and the login handle stay here until [`Session::close`].

use std::sync::Arc;

use tracing::debug;
use tssh_core::{BoxReader, BoxWriter, Login, LoginHandle, RemoteSession};

pub struct Session {
    /// The live connection; shared with pumps, filters and the tunnel
    /// connector, closed only by the orchestrator.
    pub handle: Arc<dyn LoginHandle>,
    /// The interactive sub-channel, absent for `-N` and `-W`.
    pub channel: Option<Arc<dyn RemoteSession>>,
    pub stdin: Option<BoxWriter>,
    pub stdout: Option<BoxReader>,
    pub stderr: Option<BoxReader>,
    /// Whether a remote pty was requested.
    pub tty: bool,
}

/// The streams of a session, moved out for wiring.
pub struct SessionStreams {
    pub stdin: Option<BoxWriter>,
    pub stdout: Option<BoxReader>,
    pub stderr: Option<BoxReader>,
}

impl Session {
    pub fn new(login: Login, tty: bool) -> Self {
        Self {
            handle: login.handle,
            channel: login.session,
            stdin: login.stdin,
            stdout: login.stdout,
            stderr: login.stderr,
            tty,
        }
    }

    /// Move the streams out. Later calls get nothing.
    pub fn take_streams(&mut self) -> SessionStreams {
        SessionStreams {
            stdin: self.stdin.take(),
            stdout: self.stdout.take(),
            stderr: self.stderr.take(),
        }
    }

    /// Release the channel, any unclaimed streams, then the handle.
    pub async fn close(&mut self) {
        self.take_streams();
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!("closing session channel failed: {e}");
            }
        }
        if let Err(e) = self.handle.close().await {
            debug!("closing login handle failed: {e}");
        }
    }
}
