//! Login provider backed by the system OpenSSH client.
//!
//! Authentication and host-key checks are left to `ssh` itself: a master
//! process holds the connection (`ControlMaster`) and every further channel
//! is a short-lived `ssh` multiplexed over its control socket. The
//! interactive channel runs inside a local pty when the session wants a
//! remote one, with piped stdio otherwise; tunnels use `ssh -W`.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{
    duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf,
};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use tssh_core::{
    BoxFuture, BoxReader, BoxStream, BoxWriter, Cleanups, Login, LoginHandle, LoginProvider,
    LoginRequest, RemoteSession, TsshError, TsshResult,
};

use crate::pty::{PtyIo, PtyProcess};

const CHECK_INTERVAL: Duration = Duration::from_millis(100);
const PIPE_CAPACITY: usize = 64 * 1024;
/// How long a freshly spawned `ssh -W` must stay alive to count as connected.
const DIAL_SETTLE: Duration = Duration::from_millis(300);

/// Options consumed by the engine itself and never passed on to `ssh`.
const ENGINE_OPTIONS: &[&str] = &[
    "remotecommand",
    "requesttty",
    "enabletrzsz",
    "enabledragfile",
    "enablezmodem",
    "setenv",
];

/// How to invoke `ssh`: the connection-level flags from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSshConfig {
    pub program: String,
    pub port: Option<u16>,
    pub login_name: Option<String>,
    pub identities: Vec<String>,
    pub ssh_config: Option<String>,
    pub proxy_jump: Option<String>,
    /// `Some(true)` for `-A`, `Some(false)` for `-a`.
    pub forward_agent: Option<bool>,
    pub gateway_ports: bool,
    /// `-o` values, passed through unless the engine consumes them.
    pub options: Vec<String>,
    pub dynamic_forwards: Vec<String>,
    pub local_forwards: Vec<String>,
    pub remote_forwards: Vec<String>,
}

impl Default for OpenSshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".into(),
            port: None,
            login_name: None,
            identities: Vec::new(),
            ssh_config: None,
            proxy_jump: None,
            forward_agent: None,
            gateway_ports: false,
            options: Vec::new(),
            dynamic_forwards: Vec::new(),
            local_forwards: Vec::new(),
            remote_forwards: Vec::new(),
        }
    }
}

impl OpenSshConfig {
    /// Flags every `ssh` invocation shares.
    fn common_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.extend(["-p".into(), port.to_string()]);
        }
        if let Some(login) = &self.login_name {
            args.extend(["-l".into(), login.clone()]);
        }
        if let Some(file) = &self.ssh_config {
            args.extend(["-F".into(), file.clone()]);
        }
        for option in &self.options {
            if !is_engine_option(option) {
                args.extend(["-o".into(), option.clone()]);
            }
        }
        args
    }

    fn master_args(&self, control: &Path, destination: &str) -> Vec<String> {
        let mut args = self.common_args();
        for identity in &self.identities {
            args.extend(["-i".into(), identity.clone()]);
        }
        if let Some(jump) = &self.proxy_jump {
            args.extend(["-J".into(), jump.clone()]);
        }
        match self.forward_agent {
            Some(true) => args.push("-A".into()),
            Some(false) => args.push("-a".into()),
            None => {}
        }
        if self.gateway_ports {
            args.push("-g".into());
        }
        for (flag, specs) in [
            ("-D", &self.dynamic_forwards),
            ("-L", &self.local_forwards),
            ("-R", &self.remote_forwards),
        ] {
            for spec in specs {
                args.extend([flag.to_string(), spec.clone()]);
            }
        }
        args.extend([
            "-M".into(),
            "-N".into(),
            "-S".into(),
            control.display().to_string(),
            "-o".into(),
            "ControlPersist=no".into(),
            destination.into(),
        ]);
        args
    }

    /// Flags for a channel multiplexed over the master.
    fn mux_args(&self, control: &Path) -> Vec<String> {
        let mut args = self.common_args();
        args.extend([
            "-S".into(),
            control.display().to_string(),
            "-o".into(),
            "ControlMaster=no".into(),
        ]);
        args
    }

    fn channel_args(&self, control: &Path, request: &LoginRequest, command: &str) -> Vec<String> {
        let mut args = self.mux_args(control);
        args.push(if request.tty { "-tt" } else { "-T" }.into());
        for (key, value) in &request.env {
            args.extend(["-o".into(), format!("SetEnv={key}={value}")]);
        }
        args.push(request.destination.clone());
        if !command.is_empty() {
            args.push(command.into());
        }
        args
    }
}

fn is_engine_option(option: &str) -> bool {
    let key = option
        .split(|c: char| c == '=' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    ENGINE_OPTIONS.iter().any(|o| key.eq_ignore_ascii_case(o))
}

/// Logs in by starting an `ssh` control master.
#[derive(Debug, Clone, Default)]
pub struct OpenSshProvider {
    config: Arc<OpenSshConfig>,
}

impl OpenSshProvider {
    pub fn new(config: OpenSshConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// A private directory for the control socket. Removed at exit.
    fn control_dir(cleanups: &mut Cleanups) -> TsshResult<PathBuf> {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        let dir = std::env::temp_dir().join(format!("tssh-{}-{nonce:x}", std::process::id()));
        std::fs::create_dir(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        let removed = dir.clone();
        cleanups.on_exit.push(move || {
            if let Err(e) = std::fs::remove_dir_all(&removed) {
                debug!(dir = %removed.display(), "removing control dir failed: {e}");
            }
        });
        Ok(dir)
    }

    async fn start_master(&self, control: &Path, destination: &str) -> TsshResult<Child> {
        let args = self.config.master_args(control, destination);
        debug!(?args, "starting ssh master");
        let mut master = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TsshError::Login(format!("failed to run {}: {e}", self.config.program)))?;

        loop {
            if let Some(status) = master.try_wait()? {
                return Err(TsshError::Login(format!("ssh exited with {status}")));
            }
            if self.control_check(control, destination).await {
                return Ok(master);
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    async fn control_check(&self, control: &Path, destination: &str) -> bool {
        Command::new(&self.config.program)
            .args(self.config.mux_args(control))
            .args(["-O", "check", destination])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

impl LoginProvider for OpenSshProvider {
    fn login<'a>(
        &'a self,
        request: &'a LoginRequest,
        cleanups: &'a mut Cleanups,
    ) -> BoxFuture<'a, TsshResult<Login>> {
        Box::pin(async move {
            let control = Self::control_dir(cleanups)?.join("master.sock");
            let master = self.start_master(&control, &request.destination).await?;
            info!(dest = %request.destination, "connected");

            let handle = Arc::new(MasterHandle {
                config: self.config.clone(),
                control: control.clone(),
                destination: request.destination.clone(),
                master: tokio::sync::Mutex::new(master),
            });
            if request.no_session {
                return Ok(Login {
                    handle,
                    session: None,
                    stdin: None,
                    stdout: None,
                    stderr: None,
                });
            }

            let (stdin, stdin_far) = duplex(PIPE_CAPACITY);
            let (stdout, stdout_far) = duplex(PIPE_CAPACITY);
            let (stderr, stderr_far) = duplex(PIPE_CAPACITY);
            let channel = Arc::new(SshChannel {
                config: self.config.clone(),
                control,
                request: request.clone(),
                pipes: Mutex::new(Some(ChannelPipes {
                    stdin: stdin_far,
                    stdout: stdout_far,
                    stderr: stderr_far,
                })),
                process: Mutex::new(None),
            });
            Ok(Login {
                handle,
                session: Some(channel),
                stdin: Some(Box::new(stdin) as BoxWriter),
                stdout: Some(Box::new(stdout) as BoxReader),
                stderr: Some(Box::new(stderr) as BoxReader),
            })
        })
    }
}

/// The control master.
struct MasterHandle {
    config: Arc<OpenSshConfig>,
    control: PathBuf,
    destination: String,
    master: tokio::sync::Mutex<Child>,
}

impl MasterHandle {
    async fn control(&self, operation: &str) -> TsshResult<()> {
        let status = Command::new(&self.config.program)
            .args(self.config.mux_args(&self.control))
            .args(["-O", operation, self.destination.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(TsshError::Session(format!("ssh -O {operation} failed: {status}")))
        }
    }
}

impl LoginHandle for MasterHandle {
    fn dial<'a>(
        &'a self,
        addr: &'a str,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, TsshResult<BoxStream>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.config.program);
            cmd.args(self.config.mux_args(&self.control));
            if let Some(timeout) = timeout {
                let secs = timeout.as_secs().max(1);
                cmd.args(["-o".to_string(), format!("ConnectTimeout={secs}")]);
            }
            let mut child = cmd
                .args(["-W", addr, self.destination.as_str()])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| TsshError::Tunnel(format!("dial {addr} failed: {e}")))?;

            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                return Err(TsshError::Tunnel(format!("dial {addr} failed: no stdio")));
            };

            // `ssh -W` gives no signal on success; a refused forward makes it
            // exit right away.
            let settle = timeout.map_or(DIAL_SETTLE, |t| DIAL_SETTLE.min(t / 2));
            if let Ok(status) = tokio::time::timeout(settle, child.wait()).await {
                let reason = match status {
                    Ok(status) => format!("ssh exited with {status}"),
                    Err(e) => e.to_string(),
                };
                return Err(TsshError::Tunnel(format!("dial {addr} failed: {reason}")));
            }
            debug!(%addr, "tunnel opened");
            Ok(Box::new(ProcessStream {
                _child: child,
                stdin,
                stdout,
            }) as BoxStream)
        })
    }

    fn wait(&self) -> BoxFuture<'_, TsshResult<()>> {
        Box::pin(async move {
            let status = self.master.lock().await.wait().await?;
            debug!(%status, "ssh master exited");
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, TsshResult<()>> {
        Box::pin(async move {
            if let Err(e) = self.control("exit").await {
                debug!("stopping ssh master: {e}");
            }
            Ok(())
        })
    }
}

/// A `ssh -W` process seen as one byte stream.
struct ProcessStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for ProcessStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProcessStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// Far ends of the streams handed out in [`Login`], waiting for the channel
/// process to be started.
struct ChannelPipes {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

enum ChannelProcess {
    Pty(Arc<PtyProcess>),
    Piped {
        exited: watch::Receiver<bool>,
        kill: Option<oneshot::Sender<()>>,
    },
}

/// The interactive channel: one `ssh` over the master.
struct SshChannel {
    config: Arc<OpenSshConfig>,
    control: PathBuf,
    request: LoginRequest,
    pipes: Mutex<Option<ChannelPipes>>,
    process: Mutex<Option<ChannelProcess>>,
}

impl SshChannel {
    fn launch(&self, command: &str) -> TsshResult<()> {
        let pipes = self
            .pipes
            .lock()
            .map_err(|_| TsshError::Other("channel lock poisoned".into()))?
            .take()
            .ok_or_else(|| TsshError::Session("session already started".into()))?;
        let args = self.config.channel_args(&self.control, &self.request, command);
        debug!(?args, "starting ssh channel");

        let process = if self.request.tty {
            let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
            let (pty, io) = PtyProcess::spawn(&self.config.program, &args, cols, rows)?;
            bridge_pty(io, pipes);
            ChannelProcess::Pty(Arc::new(pty))
        } else {
            let child = Command::new(&self.config.program)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            let (exited, kill) = bridge_piped(child, pipes);
            ChannelProcess::Piped {
                exited,
                kill: Some(kill),
            }
        };

        *self
            .process
            .lock()
            .map_err(|_| TsshError::Other("channel lock poisoned".into()))? = Some(process);
        Ok(())
    }

    fn with_process<T>(&self, f: impl FnOnce(&mut ChannelProcess) -> T) -> Option<T> {
        self.process.lock().ok()?.as_mut().map(f)
    }
}

impl RemoteSession for SshChannel {
    fn start<'a>(&'a self, command: &'a str) -> BoxFuture<'a, TsshResult<()>> {
        Box::pin(async move { self.launch(command) })
    }

    fn shell(&self) -> BoxFuture<'_, TsshResult<()>> {
        Box::pin(async move { self.launch("") })
    }

    fn window_change(&self, rows: u16, cols: u16) -> TsshResult<()> {
        match self.with_process(|p| match p {
            ChannelProcess::Pty(pty) => Some(pty.clone()),
            ChannelProcess::Piped { .. } => None,
        }) {
            Some(Some(pty)) => pty.resize(cols, rows),
            _ => Ok(()),
        }
    }

    fn wait(&self) -> BoxFuture<'_, TsshResult<()>> {
        enum Waiter {
            Pty(Arc<PtyProcess>),
            Piped(watch::Receiver<bool>),
        }
        let waiter = self.with_process(|p| match p {
            ChannelProcess::Pty(pty) => Waiter::Pty(pty.clone()),
            ChannelProcess::Piped { exited, .. } => Waiter::Piped(exited.clone()),
        });
        Box::pin(async move {
            match waiter {
                Some(Waiter::Pty(pty)) => {
                    let code = pty.wait().await;
                    debug!(code, "ssh channel exited");
                }
                Some(Waiter::Piped(mut exited)) => {
                    let _ = exited.wait_for(|done| *done).await;
                }
                None => return Err(TsshError::Session("session not started".into())),
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, TsshResult<()>> {
        let result = self
            .with_process(|p| match p {
                ChannelProcess::Pty(pty) => pty.kill(),
                ChannelProcess::Piped { kill, .. } => {
                    if let Some(kill) = kill.take() {
                        let _ = kill.send(());
                    }
                    Ok(())
                }
            })
            .unwrap_or(Ok(()));
        Box::pin(async move { result })
    }
}

/// Connect the pty's chunk channels to the session pipes. The pty merges
/// stderr into its output, so the error pipe just closes.
fn bridge_pty(io: PtyIo, pipes: ChannelPipes) {
    let (mut output, input) = (io.output, io.input);
    let ChannelPipes {
        stdin,
        mut stdout,
        stderr,
    } = pipes;
    drop(stderr);

    tokio::spawn(async move {
        while let Some(chunk) = output.recv().await {
            if stdout.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = stdout.shutdown().await;
    });

    tokio::spawn(async move {
        let mut stdin = stdin;
        let mut buf = vec![0u8; PIPE_CAPACITY];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if input.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn bridge_piped(
    mut child: Child,
    pipes: ChannelPipes,
) -> (watch::Receiver<bool>, oneshot::Sender<()>) {
    let ChannelPipes {
        stdin: mut stdin_far,
        stdout: mut stdout_far,
        stderr: mut stderr_far,
    } = pipes;

    if let Some(mut child_in) = child.stdin.take() {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stdin_far, &mut child_in).await;
            let _ = child_in.shutdown().await;
        });
    }
    if let Some(mut child_out) = child.stdout.take() {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut child_out, &mut stdout_far).await;
            let _ = stdout_far.shutdown().await;
        });
    }
    if let Some(mut child_err) = child.stderr.take() {
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut child_err, &mut stderr_far).await;
            let _ = stderr_far.shutdown().await;
        });
    }

    let (exit_tx, exited) = watch::channel(false);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => debug!(%status, "ssh channel exited"),
                Err(e) => warn!("waiting for ssh channel failed: {e}"),
            },
            _ = kill_rx => {
                if let Err(e) = child.kill().await {
                    debug!("killing ssh channel failed: {e}");
                }
            }
        }
        let _ = exit_tx.send(true);
    });
    (exited, kill_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OpenSshConfig {
        OpenSshConfig {
            port: Some(2222),
            login_name: Some("me".into()),
            identities: vec!["~/.ssh/id_ed25519".into()],
            proxy_jump: Some("bastion".into()),
            forward_agent: Some(true),
            options: vec![
                "ServerAliveInterval=30".into(),
                "RemoteCommand=tmux".into(),
                "EnableTrzsz no".into(),
            ],
            local_forwards: vec!["8080:localhost:80".into()],
            ..Default::default()
        }
    }

    #[test]
    fn engine_options_are_not_passed_to_ssh() {
        assert!(is_engine_option("RemoteCommand=tmux"));
        assert!(is_engine_option("requesttty force"));
        assert!(!is_engine_option("ServerAliveInterval=30"));

        let args = config().common_args();
        assert_eq!(
            args,
            ["-p", "2222", "-l", "me", "-o", "ServerAliveInterval=30"]
        );
    }

    #[test]
    fn master_owns_forwards_and_auth_flags() {
        let control = Path::new("/tmp/tssh-test/master.sock");
        let args = config().master_args(control, "dev");
        let joined = args.join(" ");
        assert!(joined.contains("-i ~/.ssh/id_ed25519"));
        assert!(joined.contains("-J bastion"));
        assert!(joined.contains("-A"));
        assert!(joined.contains("-L 8080:localhost:80"));
        assert!(
            joined.ends_with("-M -N -S /tmp/tssh-test/master.sock -o ControlPersist=no dev")
        );
    }

    #[test]
    fn channel_requests_pty_and_env() {
        let control = Path::new("/tmp/s");
        let request = LoginRequest {
            destination: "dev".into(),
            tty: true,
            no_session: false,
            env: vec![("LANG".into(), "C.UTF-8".into())],
        };
        let args = config().channel_args(control, &request, "uptime");
        let tail: Vec<&str> = args[args.len() - 5..].iter().map(String::as_str).collect();
        assert_eq!(tail, ["-tt", "-o", "SetEnv=LANG=C.UTF-8", "dev", "uptime"]);
        assert!(!args.iter().any(|a| a == "-J" || a == "-L"));

        let shell = LoginRequest {
            tty: false,
            env: Vec::new(),
            ..request
        };
        let args = config().channel_args(control, &shell, "");
        assert_eq!(&args[args.len() - 2..], ["-T", "dev"]);
    }

    #[tokio::test]
    async fn login_fails_when_ssh_exits() {
        let provider = OpenSshProvider::new(OpenSshConfig {
            program: "false".into(),
            ..Default::default()
        });
        let mut cleanups = Cleanups::new();
        let request = LoginRequest {
            destination: "nowhere".into(),
            ..Default::default()
        };
        let err = match provider.login(&request, &mut cleanups).await {
            Ok(_) => panic!("login should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, TsshError::Login(_)));
        // The control dir is staged for removal.
        assert_eq!(cleanups.on_exit.len(), 1);
    }

    fn failing_master() -> MasterHandle {
        let master = Command::new("true").kill_on_drop(true).spawn().unwrap();
        MasterHandle {
            config: Arc::new(OpenSshConfig {
                program: "false".into(),
                ..Default::default()
            }),
            control: PathBuf::from("/tmp/tssh-test/master.sock"),
            destination: "dev".into(),
            master: tokio::sync::Mutex::new(master),
        }
    }

    #[tokio::test]
    async fn dial_fails_when_forward_exits() {
        let handle = failing_master();
        let err = match handle.dial("127.0.0.1:9", None).await {
            Ok(_) => panic!("dial should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, TsshError::Tunnel(_)));
        assert!(err.to_string().contains("dial 127.0.0.1:9 failed"));
    }

    #[tokio::test]
    async fn connector_reports_no_tunnel_for_failed_forward() {
        let connector = crate::trzsz::tunnel_connector(Arc::new(failing_master()));
        assert!(connector(9).await.is_none());
    }
}
