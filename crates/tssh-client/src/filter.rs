//! Built-in stdio filter.
//!
//! Forwards both directions unchanged while watching the server output for
//! the start sequences of embedded file transfers (trzsz, and ZMODEM when
//! enabled) and trace-log toggles, and the local input for dragged-in file
//! paths. The transfer protocols themselves are not spoken here; detected
//! requests are logged and the bytes pass through to the terminal.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, trace, warn};
use tssh_core::{
    BoxReader, BoxWriter, FilterFactory, FilterOptions, FilterStreams, StreamFilter,
    TunnelConnector,
};

const BUFFER_SIZE: usize = 32 * 1024;

const TRZSZ_MAGIC: &[u8] = b"::TRZSZ:TRANSFER:";
const ZMODEM_MAGIC: &[u8] = b"**\x18B0";
const TRACE_ON_MAGIC: &[u8] = b"<ENABLE_TRZSZ_TRACE_LOG\x1b[8n>";
const TRACE_OFF_MAGIC: &[u8] = b"<DISABLE_TRZSZ_TRACE_LOG\x1b[8n>";

/// A control sequence recognised in the server output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Trzsz,
    Zmodem,
    TraceOn,
    TraceOff,
}

impl Marker {
    fn pattern(self) -> &'static [u8] {
        match self {
            Marker::Trzsz => TRZSZ_MAGIC,
            Marker::Zmodem => ZMODEM_MAGIC,
            Marker::TraceOn => TRACE_ON_MAGIC,
            Marker::TraceOff => TRACE_OFF_MAGIC,
        }
    }
}

/// Finds markers in a byte stream, including ones split across reads.
#[derive(Debug)]
pub struct MarkerScanner {
    markers: Vec<Marker>,
    tail: Vec<u8>,
    keep: usize,
}

impl MarkerScanner {
    pub fn new(markers: &[Marker]) -> Self {
        let longest = markers.iter().map(|m| m.pattern().len()).max().unwrap_or(1);
        Self {
            markers: markers.to_vec(),
            tail: Vec::new(),
            keep: longest - 1,
        }
    }

    /// Markers completed by `chunk`, in stream order.
    pub fn scan(&mut self, chunk: &[u8]) -> Vec<Marker> {
        let seen = self.tail.len();
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);

        let mut found: Vec<(usize, Marker)> = Vec::new();
        for &marker in &self.markers {
            let pattern = marker.pattern();
            found.extend(
                window
                    .windows(pattern.len())
                    .enumerate()
                    .filter(|(i, w)| i + pattern.len() > seen && *w == pattern)
                    .map(|(i, _)| (i, marker)),
            );
        }
        found.sort_by_key(|(pos, _)| *pos);

        let start = window.len().saturating_sub(self.keep);
        self.tail = window.split_off(start);
        found.into_iter().map(|(_, marker)| marker).collect()
    }
}

/// Absolute paths of existing files if `chunk` looks like a drag-and-drop
/// paste, i.e. nothing but one or more such paths.
pub fn dropped_paths(chunk: &[u8]) -> Vec<PathBuf> {
    let Ok(text) = std::str::from_utf8(chunk) else {
        return Vec::new();
    };
    let paths: Vec<PathBuf> = text
        .split_whitespace()
        .map(|word| PathBuf::from(word.trim_matches(|c| c == '\'' || c == '"')))
        .collect();
    if !paths.is_empty() && paths.iter().all(|p| p.is_absolute() && p.exists()) {
        paths
    } else {
        Vec::new()
    }
}

struct FilterState {
    relay: bool,
    options: FilterOptions,
    columns: AtomicI32,
    trace: AtomicBool,
    upload_path: Mutex<String>,
    download_path: Mutex<String>,
    connector: Mutex<Option<TunnelConnector>>,
}

impl FilterState {
    fn on_transfer(&self, marker: Marker) {
        let upload = self.upload_path.lock().map(|p| p.clone()).unwrap_or_default();
        let download = self.download_path.lock().map(|p| p.clone()).unwrap_or_default();
        let tunnel = self.connector.lock().map(|c| c.is_some()).unwrap_or(false);
        info!(
            ?marker,
            relay = self.relay,
            columns = self.columns.load(Ordering::Relaxed),
            upload = %upload,
            download = %download,
            tunnel,
            "file transfer requested by remote side, passing through"
        );
    }
}

/// A running pass-through filter.
pub struct TransferFilter {
    state: Arc<FilterState>,
}

impl TransferFilter {
    /// Take ownership of `streams` and start forwarding.
    pub fn spawn(streams: FilterStreams, options: FilterOptions, relay: bool) -> Arc<Self> {
        let state = Arc::new(FilterState {
            relay,
            columns: AtomicI32::new(options.terminal_columns),
            trace: AtomicBool::new(false),
            upload_path: Mutex::new(String::new()),
            download_path: Mutex::new(String::new()),
            connector: Mutex::new(None),
            options,
        });

        tokio::spawn(upstream(streams.client_in, streams.server_in, state.clone()));
        tokio::spawn(downstream(streams.server_out, streams.client_out, state.clone()));

        Arc::new(Self { state })
    }

    pub fn columns(&self) -> i32 {
        self.state.columns.load(Ordering::Relaxed)
    }

    pub fn upload_path(&self) -> String {
        self.state.upload_path.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn download_path(&self) -> String {
        self.state.download_path.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn tunnel_connector(&self) -> Option<TunnelConnector> {
        self.state.connector.lock().ok().and_then(|c| c.clone())
    }
}

impl StreamFilter for TransferFilter {
    fn set_terminal_columns(&self, columns: i32) {
        self.state.columns.store(columns, Ordering::Relaxed);
    }

    fn set_default_upload_path(&self, path: &str) {
        if let Ok(mut p) = self.state.upload_path.lock() {
            *p = path.to_string();
        }
    }

    fn set_default_download_path(&self, path: &str) {
        if let Ok(mut p) = self.state.download_path.lock() {
            *p = path.to_string();
        }
    }

    fn set_tunnel_connector(&self, connector: TunnelConnector) {
        if let Ok(mut c) = self.state.connector.lock() {
            *c = Some(connector);
        }
    }
}

/// Local input to the server.
async fn upstream(mut client_in: BoxReader, mut server_in: BoxWriter, state: Arc<FilterState>) {
    let detect_drag = state.options.detect_drag_file && !state.relay;
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match client_in.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("filter read from terminal failed: {e}");
                break;
            }
        };
        if detect_drag {
            let paths = dropped_paths(&buffer[..n]);
            if !paths.is_empty() {
                info!(?paths, "dragged files detected, passing through as text");
            }
        }
        if let Err(e) = write_flush(&mut server_in, &buffer[..n]).await {
            warn!("filter write to server failed: {e}");
            break;
        }
    }
    if let Err(e) = server_in.shutdown().await {
        debug!("closing server input failed: {e}");
    }
}

/// Server output to the local terminal.
async fn downstream(mut server_out: BoxReader, mut client_out: BoxWriter, state: Arc<FilterState>) {
    let mut markers = vec![Marker::Trzsz];
    if state.options.enable_zmodem && !state.relay {
        markers.push(Marker::Zmodem);
    }
    if state.options.detect_trace_log {
        markers.extend([Marker::TraceOn, Marker::TraceOff]);
    }
    let mut scanner = MarkerScanner::new(&markers);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match server_out.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("filter read from server failed: {e}");
                break;
            }
        };
        for marker in scanner.scan(&buffer[..n]) {
            match marker {
                Marker::TraceOn => state.trace.store(true, Ordering::Relaxed),
                Marker::TraceOff => state.trace.store(false, Ordering::Relaxed),
                Marker::Trzsz | Marker::Zmodem => state.on_transfer(marker),
            }
        }
        if state.trace.load(Ordering::Relaxed) {
            trace!(data = %String::from_utf8_lossy(&buffer[..n]).escape_debug(), "server output");
        }
        if let Err(e) = write_flush(&mut client_out, &buffer[..n]).await {
            warn!("filter write to terminal failed: {e}");
            break;
        }
    }
    if let Err(e) = client_out.shutdown().await {
        debug!("closing terminal output failed: {e}");
    }
}

async fn write_flush(writer: &mut BoxWriter, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

/// Builds [`TransferFilter`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferFilterFactory;

impl FilterFactory for TransferFilterFactory {
    fn filter(&self, streams: FilterStreams, options: FilterOptions) -> Arc<dyn StreamFilter> {
        TransferFilter::spawn(streams, options, false)
    }

    fn relay(&self, streams: FilterStreams, options: FilterOptions) -> Arc<dyn StreamFilter> {
        TransferFilter::spawn(streams, options, true)
    }
}
