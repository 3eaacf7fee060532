//! Background execution (`-f`) and the `--reconnect` restart loop.
//!
//! A foreground instance relaunches its own executable with the resolved
//! destination and a launch role in the environment, then exits. With
//! `--reconnect` the relaunched child is a monitor that keeps restarting a
//! background child.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tssh_core::{TsshError, TsshResult};

/// Environment variable carrying the [`LaunchRole`] of a relaunched process.
pub const LAUNCH_ROLE_ENV: &str = "TSSH_LAUNCH_ROLE";

/// A child that lived at least this long is considered healthy.
const HEALTHY_LIFETIME: Duration = Duration::from_secs(10);
const BACKOFF_STEP: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Which part this process plays in background execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchRole {
    /// Started by the user.
    #[default]
    Foreground,
    /// Relaunched to run the session detached.
    Background,
    /// Relaunched to restart background children.
    Monitor,
}

impl LaunchRole {
    pub fn from_env() -> Self {
        std::env::var(LAUNCH_ROLE_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    /// Unknown values mean [`LaunchRole::Foreground`].
    pub fn parse(value: &str) -> Self {
        match value {
            "background" => Self::Background,
            "monitor" => Self::Monitor,
            _ => Self::Foreground,
        }
    }

    pub fn as_env_value(self) -> Option<&'static str> {
        match self {
            Self::Foreground => None,
            Self::Background => Some("background"),
            Self::Monitor => Some("monitor"),
        }
    }

    /// The role for a process this one relaunches.
    pub fn child_role(self, reconnect: bool) -> Self {
        if reconnect && self != Self::Monitor {
            Self::Monitor
        } else {
            Self::Background
        }
    }
}

/// Swap `original` for `resolved` in an argument vector. `args[0]` (the
/// program) is never touched. An empty `original` means the destination came
/// from the config, so it is appended.
pub fn substitute_destination(
    args: &[OsString],
    original: &str,
    resolved: &str,
) -> TsshResult<Vec<OsString>> {
    let mut args = args.to_vec();
    if original.is_empty() {
        args.push(resolved.into());
        return Ok(args);
    }
    if original == resolved {
        return Ok(args);
    }

    let positions: Vec<usize> = args
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, arg)| arg.as_os_str() == original)
        .map(|(i, _)| i)
        .collect();
    match positions.as_slice() {
        [index] => {
            args[*index] = resolved.into();
            Ok(args)
        }
        _ => Err(TsshError::Resolution(format!(
            "don't know how to replace the destination: {original} => {resolved}"
        ))),
    }
}

/// How to re-execute this program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaunchDescriptor {
    pub program: PathBuf,
    /// Full argument vector, `args[0]` included.
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub destination: String,
    /// Role of the relaunched process.
    pub role: LaunchRole,
}

impl RelaunchDescriptor {
    pub fn build(
        program: PathBuf,
        args: &[OsString],
        env: impl IntoIterator<Item = (OsString, OsString)>,
        original_destination: &str,
        resolved_destination: &str,
        role: LaunchRole,
        reconnect: bool,
    ) -> TsshResult<Self> {
        let args = substitute_destination(args, original_destination, resolved_destination)?;
        let child = role.child_role(reconnect);
        let mut env: Vec<(OsString, OsString)> = env
            .into_iter()
            .filter(|(k, _)| k.as_os_str() != LAUNCH_ROLE_ENV)
            .collect();
        if let Some(value) = child.as_env_value() {
            env.push((LAUNCH_ROLE_ENV.into(), value.into()));
        }
        Ok(Self {
            program,
            args,
            env,
            destination: resolved_destination.to_string(),
            role: child,
        })
    }

    /// The descriptor for the current process.
    pub fn current(
        original_destination: &str,
        resolved_destination: &str,
        role: LaunchRole,
        reconnect: bool,
    ) -> TsshResult<Self> {
        let program = std::env::current_exe()
            .map_err(|e| TsshError::Supervisor(format!("run in background failed: {e}")))?;
        let args: Vec<OsString> = std::env::args_os().collect();
        Self::build(
            program,
            &args,
            std::env::vars_os(),
            original_destination,
            resolved_destination,
            role,
            reconnect,
        )
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().skip(1))
            .env_clear()
            .envs(self.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn spawn(&self) -> TsshResult<Child> {
        self.command()
            .spawn()
            .map_err(|e| TsshError::Supervisor(format!("run in background failed: {e}")))
    }
}

/// Restart delay: grows by a second per short-lived child up to ten seconds,
/// and resets once a child stays up.
#[derive(Debug, Clone, Default)]
pub struct RestartBackoff {
    delay: Duration,
}

impl RestartBackoff {
    pub fn next_delay(&mut self, lifetime: Duration) -> Duration {
        if lifetime < HEALTHY_LIFETIME {
            if self.delay < BACKOFF_MAX {
                self.delay += BACKOFF_STEP;
            }
        } else {
            self.delay = Duration::ZERO;
        }
        self.delay
    }
}

/// Start `launch`, wait for it and restart it, forever. Only a failed start
/// ends the loop.
pub async fn supervise<F, Fut>(mut launch: F) -> TsshResult<()>
where
    F: FnMut() -> TsshResult<Fut>,
    Fut: std::future::Future<Output = ()>,
{
    let mut backoff = RestartBackoff::default();
    loop {
        let running = launch()?;
        let started = Instant::now();
        running.await;
        let delay = backoff.next_delay(started.elapsed());
        if !delay.is_zero() {
            debug!(?delay, "background child exited early, delaying restart");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Launch the background child and return without waiting for it.
pub fn spawn_detached(desc: &RelaunchDescriptor) -> TsshResult<()> {
    let child = desc.spawn()?;
    info!(dest = %desc.destination, pid = child.id(), "running in background");
    Ok(())
}

/// Keep a background child running, restarting it whenever it exits.
pub async fn monitor(desc: &RelaunchDescriptor) -> TsshResult<()> {
    supervise(|| {
        let mut child = desc.spawn()?;
        info!(dest = %desc.destination, pid = child.id(), "started background session");
        Ok(async move {
            match child.wait().await {
                Ok(status) => debug!(%status, "background session exited"),
                Err(e) => warn!("waiting for background session failed: {e}"),
            }
        })
    })
    .await
}

/// Whether the caller should go on to run the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Handle `-f` for a process in `role`. A background process goes on to run
/// the session; a monitor supervises until a relaunch fails; a foreground
/// process starts its child and is done.
pub async fn run_background(desc: &RelaunchDescriptor, role: LaunchRole) -> TsshResult<Flow> {
    match role {
        LaunchRole::Background => return Ok(Flow::Continue),
        LaunchRole::Monitor => monitor(desc).await?,
        LaunchRole::Foreground => spawn_detached(desc)?,
    }
    Ok(Flow::Exit)
}
