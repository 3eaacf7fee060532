//! Scripted collaborators for unit tests: a login provider whose remote side
//! is a set of in-memory pipes, a console and a filter factory that record
//! what the engine did to them.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{duplex, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tssh_core::{
    BoxFuture, BoxReader, BoxStream, BoxWriter, Cleanups, FilterFactory, FilterOptions,
    FilterStreams, Login, LoginHandle, LoginProvider, LoginRequest, RemoteSession, StreamFilter,
    TsshError, TsshResult, TunnelConnector,
};

use crate::console::{Console, RawModeGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialMode {
    Echo,
    Fail,
    Hang,
}

struct MockState {
    dial_mode: DialMode,
    start_fails: bool,
    events: Mutex<Vec<String>>,
    dialed: Mutex<Vec<String>>,
    window_changes: Mutex<Vec<(u16, u16)>>,
    window_changed: Notify,
    /// Remote ends of the session pipes, kept open for the test's lifetime.
    remote_ends: Mutex<Vec<DuplexStream>>,
}

impl MockState {
    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

/// The remote side of a fake login.
#[derive(Clone)]
pub struct MockLogin {
    state: Arc<MockState>,
}

impl MockLogin {
    pub fn new() -> Self {
        Self::with_state(DialMode::Echo, false)
    }

    fn with_state(dial_mode: DialMode, start_fails: bool) -> Self {
        Self {
            state: Arc::new(MockState {
                dial_mode,
                start_fails,
                events: Mutex::new(Vec::new()),
                dialed: Mutex::new(Vec::new()),
                window_changes: Mutex::new(Vec::new()),
                window_changed: Notify::new(),
                remote_ends: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_dial_failure(self) -> Self {
        Self::with_state(DialMode::Fail, self.state.start_fails)
    }

    pub fn with_hanging_dial(self) -> Self {
        Self::with_state(DialMode::Hang, self.state.start_fails)
    }

    pub fn with_start_failure(self) -> Self {
        Self::with_state(self.state.dial_mode, true)
    }

    pub fn handle(&self) -> Arc<dyn LoginHandle> {
        Arc::new(MockHandle {
            state: self.state.clone(),
        })
    }

    fn pipe(&self) -> DuplexStream {
        let (local, remote) = duplex(4096);
        self.state.remote_ends.lock().unwrap().push(remote);
        local
    }

    /// A login with an interactive channel and all three streams.
    pub fn login(&self) -> Login {
        Login {
            handle: self.handle(),
            session: Some(Arc::new(MockChannel {
                state: self.state.clone(),
            })),
            stdin: Some(Box::new(self.pipe()) as BoxWriter),
            stdout: Some(Box::new(self.pipe()) as BoxReader),
            stderr: Some(Box::new(self.pipe()) as BoxReader),
        }
    }

    /// A login with no interactive channel.
    pub fn bare_login(&self) -> Login {
        Login {
            handle: self.handle(),
            session: None,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.state.events.lock().unwrap().clone()
    }

    pub fn dialed(&self) -> Vec<String> {
        self.state.dialed.lock().unwrap().clone()
    }

    /// Wait until the remote side saw a `(rows, cols)` window change.
    pub async fn wait_for_window_change(&self, expected: (u16, u16)) {
        let seen = async {
            loop {
                if self.state.window_changes.lock().unwrap().contains(&expected) {
                    return;
                }
                self.state.window_changed.notified().await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), seen)
            .await
            .expect("window change not forwarded");
    }
}

struct MockHandle {
    state: Arc<MockState>,
}

impl LoginHandle for MockHandle {
    fn dial<'a>(
        &'a self,
        addr: &'a str,
        _timeout: Option<Duration>,
    ) -> BoxFuture<'a, TsshResult<BoxStream>> {
        Box::pin(async move {
            self.state.dialed.lock().unwrap().push(addr.to_string());
            match self.state.dial_mode {
                DialMode::Echo => {
                    let (local, remote) = duplex(4096);
                    tokio::spawn(async move {
                        let (mut reader, mut writer) = tokio::io::split(remote);
                        let _ = tokio::io::copy(&mut reader, &mut writer).await;
                        let _ = writer.shutdown().await;
                    });
                    Ok(Box::new(local) as BoxStream)
                }
                DialMode::Fail => Err(TsshError::Tunnel(format!("connect to {addr} refused"))),
                DialMode::Hang => std::future::pending().await,
            }
        })
    }

    fn wait(&self) -> BoxFuture<'_, TsshResult<()>> {
        Box::pin(async move {
            self.state.record("handle.wait");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, TsshResult<()>> {
        Box::pin(async move {
            self.state.record("handle.close");
            Ok(())
        })
    }
}

struct MockChannel {
    state: Arc<MockState>,
}

impl RemoteSession for MockChannel {
    fn start<'a>(&'a self, command: &'a str) -> BoxFuture<'a, TsshResult<()>> {
        Box::pin(async move {
            self.state.record(format!("start:{command}"));
            if self.state.start_fails {
                return Err(TsshError::Session("exit status 127".into()));
            }
            Ok(())
        })
    }

    fn shell(&self) -> BoxFuture<'_, TsshResult<()>> {
        Box::pin(async move {
            self.state.record("shell");
            if self.state.start_fails {
                return Err(TsshError::Session("no shell".into()));
            }
            Ok(())
        })
    }

    fn window_change(&self, rows: u16, cols: u16) -> TsshResult<()> {
        self.state.window_changes.lock().unwrap().push((rows, cols));
        self.state.window_changed.notify_one();
        Ok(())
    }

    fn wait(&self) -> BoxFuture<'_, TsshResult<()>> {
        Box::pin(async move {
            self.state.record("channel.wait");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, TsshResult<()>> {
        Box::pin(async move {
            self.state.record("channel.close");
            Ok(())
        })
    }
}

/// A provider that hands out logins backed by a [`MockLogin`] and stages one
/// cleanup on each registry.
pub struct MockProvider {
    pub remote: MockLogin,
    fail: bool,
    requests: Mutex<Vec<LoginRequest>>,
}

impl MockProvider {
    pub fn new(remote: MockLogin) -> Self {
        Self {
            remote,
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(MockLogin::new())
        }
    }

    pub fn requests(&self) -> Vec<LoginRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LoginProvider for MockProvider {
    fn login<'a>(
        &'a self,
        request: &'a LoginRequest,
        cleanups: &'a mut Cleanups,
    ) -> BoxFuture<'a, TsshResult<Login>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(TsshError::Login("permission denied".into()));
            }
            let state = self.remote.state.clone();
            cleanups
                .after_login
                .push(move || state.record("after_login"));
            let state = self.remote.state.clone();
            cleanups.on_exit.push(move || state.record("on_exit"));

            Ok(if request.no_session {
                self.remote.bare_login()
            } else {
                self.remote.login()
            })
        })
    }
}

/// Collects everything written to it.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub struct MockConsole {
    interactive: bool,
    size_fails: bool,
    input: Vec<u8>,
    pub output: SharedBuf,
    raw_entered: AtomicUsize,
    resize_senders: Mutex<Vec<mpsc::Sender<(u16, u16)>>>,
}

impl MockConsole {
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive,
            size_fails: false,
            input: Vec::new(),
            output: SharedBuf::default(),
            raw_entered: AtomicUsize::new(0),
            resize_senders: Mutex::new(Vec::new()),
        }
    }

    pub fn with_size_error(mut self) -> Self {
        self.size_fails = true;
        self
    }

    pub fn with_input(mut self, input: &[u8]) -> Self {
        self.input = input.to_vec();
        self
    }

    pub fn raw_mode_entries(&self) -> usize {
        self.raw_entered.load(Ordering::SeqCst)
    }

    pub fn resize_subscriptions(&self) -> usize {
        self.resize_senders.lock().unwrap().len()
    }

    /// Deliver a `(cols, rows)` resize event to every listener.
    pub async fn resize(&self, cols: u16, rows: u16) {
        let senders = self.resize_senders.lock().unwrap().clone();
        for tx in senders {
            let _ = tx.send((cols, rows)).await;
        }
    }
}

impl Console for MockConsole {
    fn is_terminal(&self) -> bool {
        self.interactive
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        if self.size_fails {
            Err(io::Error::other("not a terminal"))
        } else {
            Ok((80, 24))
        }
    }

    fn enter_raw_mode(&self) -> TsshResult<RawModeGuard> {
        self.raw_entered.fetch_add(1, Ordering::SeqCst);
        Ok(RawModeGuard::inactive())
    }

    fn stdin(&self) -> BoxReader {
        Box::new(io::Cursor::new(self.input.clone()))
    }

    fn stdout(&self) -> BoxWriter {
        Box::new(self.output.clone())
    }

    fn stderr(&self) -> BoxWriter {
        Box::new(tokio::io::sink())
    }

    fn resize_events(&self) -> mpsc::Receiver<(u16, u16)> {
        let (tx, rx) = mpsc::channel(8);
        self.resize_senders.lock().unwrap().push(tx);
        rx
    }
}

/// A filter that only records how it was configured.
pub struct MockFilter {
    pub relay: bool,
    pub options: FilterOptions,
    columns: AtomicI32,
    upload_path: Mutex<String>,
    download_path: Mutex<String>,
    connector: Mutex<Option<TunnelConnector>>,
    _streams: Mutex<FilterStreams>,
}

impl MockFilter {
    pub fn columns(&self) -> i32 {
        self.columns.load(Ordering::SeqCst)
    }

    pub fn upload_path(&self) -> String {
        self.upload_path.lock().unwrap().clone()
    }

    pub fn download_path(&self) -> String {
        self.download_path.lock().unwrap().clone()
    }

    pub fn has_connector(&self) -> bool {
        self.connector.lock().unwrap().is_some()
    }
}

impl StreamFilter for MockFilter {
    fn set_terminal_columns(&self, columns: i32) {
        self.columns.store(columns, Ordering::SeqCst);
    }

    fn set_default_upload_path(&self, path: &str) {
        *self.upload_path.lock().unwrap() = path.to_string();
    }

    fn set_default_download_path(&self, path: &str) {
        *self.download_path.lock().unwrap() = path.to_string();
    }

    fn set_tunnel_connector(&self, connector: TunnelConnector) {
        *self.connector.lock().unwrap() = Some(connector);
    }
}

#[derive(Default)]
pub struct MockFilterFactory {
    created: Mutex<Vec<Arc<MockFilter>>>,
}

impl MockFilterFactory {
    pub fn created(&self) -> Vec<Arc<MockFilter>> {
        self.created.lock().unwrap().clone()
    }

    fn build(
        &self,
        streams: FilterStreams,
        options: FilterOptions,
        relay: bool,
    ) -> Arc<dyn StreamFilter> {
        let filter = Arc::new(MockFilter {
            relay,
            columns: AtomicI32::new(options.terminal_columns),
            options,
            upload_path: Mutex::new(String::new()),
            download_path: Mutex::new(String::new()),
            connector: Mutex::new(None),
            _streams: Mutex::new(streams),
        });
        self.created.lock().unwrap().push(filter.clone());
        filter
    }
}

impl FilterFactory for MockFilterFactory {
    fn filter(&self, streams: FilterStreams, options: FilterOptions) -> Arc<dyn StreamFilter> {
        self.build(streams, options, false)
    }

    fn relay(&self, streams: FilterStreams, options: FilterOptions) -> Arc<dyn StreamFilter> {
        self.build(streams, options, true)
    }
}
