//! Contract for the stdio filter that can intercept embedded file transfers.
//!
//! ```text
//!   stdin   ┌────────┐   client_in   ┌──────────────┐   server_in   ┌────────┐
//! ─────────►│        ├──────────────►│              ├──────────────►│        │
//!           │ Client │               │ StreamFilter │               │ Server │
//! ◄─────────│        │◄──────────────┤              │◄──────────────┤        │
//!   stdout  └────────┘   client_out  └──────────────┘   server_out  └────────┘
//! ```

use std::sync::Arc;

use crate::transport::{BoxFuture, BoxReader, BoxStream, BoxWriter};

/// Opens a connection to `127.0.0.1:<port>` through the live login, or
/// `None` when no tunnel is available.
pub type TunnelConnector = Arc<dyn Fn(u16) -> BoxFuture<'static, Option<BoxStream>> + Send + Sync>;

/// Behaviour switches handed to a filter at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOptions {
    pub terminal_columns: i32,
    pub detect_drag_file: bool,
    pub detect_trace_log: bool,
    pub enable_zmodem: bool,
    pub affected_by_windows: bool,
}

/// The four streams a filter takes ownership of.
pub struct FilterStreams {
    /// Local terminal input.
    pub client_in: BoxReader,
    /// Local terminal output.
    pub client_out: BoxWriter,
    /// Input to the remote side.
    pub server_in: BoxWriter,
    /// Output from the remote side.
    pub server_out: BoxReader,
}

/// A running filter. Forwarding happens on tasks it spawned itself.
pub trait StreamFilter: Send + Sync {
    fn set_terminal_columns(&self, columns: i32);

    fn set_default_upload_path(&self, path: &str);

    fn set_default_download_path(&self, path: &str);

    fn set_tunnel_connector(&self, connector: TunnelConnector);
}

/// Builds filters in either of the two wiring variants.
pub trait FilterFactory: Send + Sync {
    /// Full filter for a local interactive terminal.
    fn filter(&self, streams: FilterStreams, options: FilterOptions) -> Arc<dyn StreamFilter>;

    /// Pass-through relay that still watches for transfer sequences, used on
    /// jump hosts and machines without a GUI.
    fn relay(&self, streams: FilterStreams, options: FilterOptions) -> Arc<dyn StreamFilter>;
}
