//! Stdio wiring for an established session.
//!
//! One of four strategies is picked up front by [`select_wiring`]; streams
//! are claimed only after the choice is made because a stream handed to one
//! strategy cannot be shared with another.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};
use tssh_core::{
    FilterFactory, FilterOptions, FilterStreams, LoginHandle, RemoteSession, TsshError,
    TsshResult, TunnelConnector,
};

use crate::config::Settings;
use crate::console::Console;
use crate::pump::wrap_stdio;
use crate::session::Session;

/// How long a tunnel dial may take before it counts as unavailable.
pub const TUNNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WiringMode {
    /// Plain pumps, no resize handling.
    Raw,
    /// Plain pumps plus resize forwarding; the filter is disabled.
    Passthrough,
    /// Filter relay on stdin/stdout.
    Relay,
    /// Full filter on stdin/stdout.
    Direct,
}

/// Everything the wiring choice depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WiringInputs {
    /// Local stdin is a terminal.
    pub interactive: bool,
    /// The session requested a remote pty.
    pub tty: bool,
    /// `EnableTrzsz=no`.
    pub trzsz_disabled: bool,
    /// `--relay`.
    pub relay_forced: bool,
    /// No graphical environment is available locally.
    pub no_gui: bool,
}

/// Pick the wiring strategy. Relay and no-GUI are checked before anything
/// that needs the terminal width.
pub fn select_wiring(inputs: WiringInputs) -> WiringMode {
    if !inputs.interactive || !inputs.tty {
        WiringMode::Raw
    } else if inputs.trzsz_disabled {
        WiringMode::Passthrough
    } else if inputs.relay_forced || inputs.no_gui {
        WiringMode::Relay
    } else {
        WiringMode::Direct
    }
}

/// Whether this machine lacks a graphical session to pick files from.
pub fn no_gui() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    let unset = |name: &str| std::env::var_os(name).map_or(true, |v| v.is_empty());
    unset("DISPLAY") && unset("WAYLAND_DISPLAY")
}

/// Filter-related settings, resolved from flags with config fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrzszSettings {
    pub disabled: bool,
    pub relay: bool,
    pub drag_file: bool,
    pub trace_log: bool,
    pub zmodem: bool,
    /// No graphical session is available locally; see [`no_gui`].
    pub no_gui: bool,
    pub upload_path: String,
    pub download_path: String,
}

impl TrzszSettings {
    pub fn resolve(settings: &Settings<'_>) -> Self {
        let args = settings.args;
        Self {
            disabled: settings.is_no("EnableTrzsz"),
            relay: args.relay,
            drag_file: args.drag_file || settings.is_yes("EnableDragFile"),
            trace_log: args.trace_log,
            zmodem: args.zmodem || settings.is_yes("EnableZmodem"),
            no_gui: no_gui(),
            upload_path: settings.config.default.upload_path.clone(),
            download_path: settings.config.default.download_path.clone(),
        }
    }
}

/// A connector that opens `127.0.0.1:<port>` through `handle`. Failures and
/// timeouts yield `None`.
pub fn tunnel_connector(handle: Arc<dyn LoginHandle>) -> TunnelConnector {
    Arc::new(move |port| {
        let handle = handle.clone();
        Box::pin(async move {
            let addr = format!("127.0.0.1:{port}");
            let dial = handle.dial(&addr, Some(TUNNEL_DIAL_TIMEOUT));
            match tokio::time::timeout(TUNNEL_DIAL_TIMEOUT, dial).await {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    debug!(%addr, "tunnel dial failed: {e}");
                    None
                }
                Err(_) => {
                    debug!(%addr, "tunnel dial timed out");
                    None
                }
            }
        })
    })
}

/// Run `on_resize(columns, rows)` for every terminal resize event.
pub fn on_terminal_resize<F>(console: &dyn Console, on_resize: F) -> JoinHandle<()>
where
    F: Fn(u16, u16) + Send + 'static,
{
    let mut events = console.resize_events();
    tokio::spawn(async move {
        while let Some((cols, rows)) = events.recv().await {
            debug!(cols, rows, "terminal resized");
            on_resize(cols, rows);
        }
    })
}

fn forward_window_change(channel: Option<Arc<dyn RemoteSession>>) -> impl Fn(u16, u16) + Send {
    move |cols, rows| {
        if let Some(channel) = &channel {
            if let Err(e) = channel.window_change(rows, cols) {
                debug!("window change failed: {e}");
            }
        }
    }
}

/// Wire the session's streams to the local console. Returns once wiring is
/// committed; forwarding continues on spawned tasks.
pub fn enable_trzsz(
    session: &mut Session,
    console: &dyn Console,
    filters: &dyn FilterFactory,
    settings: &TrzszSettings,
) -> TsshResult<WiringMode> {
    let mode = select_wiring(WiringInputs {
        interactive: console.is_terminal(),
        tty: session.tty,
        trzsz_disabled: settings.disabled,
        relay_forced: settings.relay,
        no_gui: settings.no_gui,
    });
    info!(?mode, "wiring session stdio");

    match mode {
        WiringMode::Raw => {
            let streams = session.take_streams();
            wrap_stdio(console, streams.stdin, streams.stdout, streams.stderr, session.tty);
        }
        WiringMode::Passthrough => {
            let streams = session.take_streams();
            wrap_stdio(console, streams.stdin, streams.stdout, streams.stderr, session.tty);
            on_terminal_resize(console, forward_window_change(session.channel.clone()));
        }
        WiringMode::Relay => {
            let streams = claim_filter_streams(session, console)?;
            let relay = filters.relay(
                streams,
                FilterOptions {
                    detect_trace_log: settings.trace_log,
                    ..Default::default()
                },
            );
            on_terminal_resize(console, forward_window_change(session.channel.clone()));
            relay.set_tunnel_connector(tunnel_connector(session.handle.clone()));
        }
        WiringMode::Direct => {
            let (columns, _) = console
                .size()
                .map_err(|e| TsshError::Terminal(format!("get terminal size failed: {e}")))?;

            let streams = claim_filter_streams(session, console)?;
            let filter = filters.filter(
                streams,
                FilterOptions {
                    terminal_columns: i32::from(columns),
                    detect_drag_file: settings.drag_file,
                    detect_trace_log: settings.trace_log,
                    enable_zmodem: settings.zmodem,
                    affected_by_windows: false,
                },
            );

            let resized = filter.clone();
            let window_change = forward_window_change(session.channel.clone());
            on_terminal_resize(console, move |cols, rows| {
                resized.set_terminal_columns(i32::from(cols));
                window_change(cols, rows);
            });

            filter.set_default_upload_path(&settings.upload_path);
            filter.set_default_download_path(&settings.download_path);
            filter.set_tunnel_connector(tunnel_connector(session.handle.clone()));
        }
    }
    Ok(mode)
}

/// Start a plain pump for stderr and hand stdin/stdout to a filter.
fn claim_filter_streams(session: &mut Session, console: &dyn Console) -> TsshResult<FilterStreams> {
    let streams = session.take_streams();
    let (Some(server_in), Some(server_out)) = (streams.stdin, streams.stdout) else {
        return Err(TsshError::Session(
            "session is missing its input or output stream".into(),
        ));
    };
    wrap_stdio(console, None, None, streams.stderr, session.tty);
    Ok(FilterStreams {
        client_in: console.stdin(),
        client_out: console.stdout(),
        server_in,
        server_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConsole, MockFilterFactory, MockLogin};

    fn inputs(
        interactive: bool,
        tty: bool,
        disabled: bool,
        relay: bool,
        no_gui: bool,
    ) -> WiringInputs {
        WiringInputs {
            interactive,
            tty,
            trzsz_disabled: disabled,
            relay_forced: relay,
            no_gui,
        }
    }

    #[test]
    fn wiring_decision_table() {
        assert_eq!(select_wiring(inputs(false, true, false, false, false)), WiringMode::Raw);
        assert_eq!(select_wiring(inputs(true, false, false, true, true)), WiringMode::Raw);
        assert_eq!(select_wiring(inputs(true, true, true, true, true)), WiringMode::Passthrough);
        assert_eq!(select_wiring(inputs(true, true, false, true, false)), WiringMode::Relay);
        assert_eq!(select_wiring(inputs(true, true, false, false, true)), WiringMode::Relay);
        assert_eq!(select_wiring(inputs(true, true, false, false, false)), WiringMode::Direct);
    }

    #[tokio::test]
    async fn raw_mode_pumps_without_resize() {
        let mock = MockLogin::new();
        let mut session = Session::new(mock.login(), false);
        let console = MockConsole::new(false);
        let filters = MockFilterFactory::default();

        let settings = TrzszSettings::default();
        let mode = enable_trzsz(&mut session, &console, &filters, &settings).unwrap();
        assert_eq!(mode, WiringMode::Raw);
        assert!(session.stdin.is_none() && session.stdout.is_none() && session.stderr.is_none());
        assert_eq!(console.resize_subscriptions(), 0);
        assert!(filters.created().is_empty());
    }

    #[tokio::test]
    async fn passthrough_forwards_resize_to_remote() {
        let mock = MockLogin::new();
        let mut session = Session::new(mock.login(), true);
        let console = MockConsole::new(true);
        let filters = MockFilterFactory::default();
        let settings = TrzszSettings {
            disabled: true,
            ..Default::default()
        };

        let mode = enable_trzsz(&mut session, &console, &filters, &settings).unwrap();
        assert_eq!(mode, WiringMode::Passthrough);
        assert!(filters.created().is_empty());

        console.resize(120, 40).await;
        mock.wait_for_window_change((40, 120)).await;
    }

    #[tokio::test]
    async fn relay_skips_terminal_width() {
        let mock = MockLogin::new();
        let mut session = Session::new(mock.login(), true);
        let console = MockConsole::new(true).with_size_error();
        let filters = MockFilterFactory::default();
        let settings = TrzszSettings {
            relay: true,
            trace_log: true,
            ..Default::default()
        };

        let mode = enable_trzsz(&mut session, &console, &filters, &settings).unwrap();
        assert_eq!(mode, WiringMode::Relay);
        let created = filters.created();
        assert_eq!(created.len(), 1);
        assert!(created[0].relay);
        assert!(created[0].options.detect_trace_log);
        assert!(created[0].has_connector());
    }

    #[tokio::test]
    async fn direct_fails_without_terminal_width() {
        let mock = MockLogin::new();
        let mut session = Session::new(mock.login(), true);
        let console = MockConsole::new(true).with_size_error();
        let filters = MockFilterFactory::default();

        let settings = TrzszSettings::default();
        let err = enable_trzsz(&mut session, &console, &filters, &settings).unwrap_err();
        assert!(err.to_string().contains("get terminal size failed"));
        // Nothing was claimed before the failure.
        assert!(session.stdin.is_some() && session.stdout.is_some());
    }

    #[tokio::test]
    async fn direct_configures_filter_and_resize() {
        let mock = MockLogin::new();
        let mut session = Session::new(mock.login(), true);
        let console = MockConsole::new(true);
        let filters = MockFilterFactory::default();
        let settings = TrzszSettings {
            drag_file: true,
            zmodem: true,
            upload_path: "/up".into(),
            download_path: "/down".into(),
            ..Default::default()
        };

        let mode = enable_trzsz(&mut session, &console, &filters, &settings).unwrap();
        assert_eq!(mode, WiringMode::Direct);
        let filter = filters.created().remove(0);
        assert!(!filter.relay);
        assert_eq!(filter.options.terminal_columns, 80);
        assert!(filter.options.detect_drag_file && filter.options.enable_zmodem);
        assert!(!filter.options.affected_by_windows);
        assert_eq!(filter.upload_path(), "/up");
        assert_eq!(filter.download_path(), "/down");
        assert!(filter.has_connector());

        console.resize(100, 30).await;
        mock.wait_for_window_change((30, 100)).await;
        assert_eq!(filter.columns(), 100);
    }

    #[tokio::test]
    async fn connector_dials_loopback() {
        let mock = MockLogin::new();
        let connector = tunnel_connector(mock.handle());
        assert!(connector(7000).await.is_some());
        assert_eq!(mock.dialed(), vec!["127.0.0.1:7000".to_string()]);
    }

    #[tokio::test]
    async fn connector_yields_none_on_failure() {
        let mock = MockLogin::new().with_dial_failure();
        let connector = tunnel_connector(mock.handle());
        assert!(connector(7000).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connector_times_out_after_one_second() {
        let mock = MockLogin::new().with_hanging_dial();
        let connector = tunnel_connector(mock.handle());
        let started = tokio::time::Instant::now();
        assert!(connector(7000).await.is_none());
        assert!(started.elapsed() >= TUNNEL_DIAL_TIMEOUT);
    }
}
