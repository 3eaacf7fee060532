//! Drives one session from login to teardown.
//!
//! The sequence is resolve, login, the `-W` and `-N` short-circuits, start,
//! raw mode, stdio wiring, drain and wait. The session is closed on every
//! path once login has succeeded, and the terminal is restored before
//! [`Orchestrator::run`] returns.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use tssh_core::{Cleanups, FilterFactory, LoginProvider, LoginRequest, TsshError, TsshResult};

use crate::args::SessionArgs;
use crate::config::{Config, Settings};
use crate::console::Console;
use crate::resolve::parse_cmd_and_tty;
use crate::session::Session;
use crate::supervisor::LaunchRole;
use crate::trzsz::{enable_trzsz, TrzszSettings};

pub struct Orchestrator<'a> {
    provider: &'a dyn LoginProvider,
    filters: &'a dyn FilterFactory,
    console: Arc<dyn Console>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        provider: &'a dyn LoginProvider,
        filters: &'a dyn FilterFactory,
        console: Arc<dyn Console>,
    ) -> Self {
        Self {
            provider,
            filters,
            console,
        }
    }

    /// Run a session to completion.
    pub async fn run(
        &self,
        args: &SessionArgs,
        config: &Config,
        role: LaunchRole,
        cleanups: &mut Cleanups,
    ) -> TsshResult<()> {
        let settings = Settings::new(args, config);
        let interactive = self.console.is_terminal();
        let (command, tty) = parse_cmd_and_tty(&settings, interactive)?;

        let request = LoginRequest {
            destination: args.destination.clone(),
            tty,
            no_session: args.no_command || args.stdio_forward.is_some(),
            env: settings.env(),
        };
        info!(dest = %request.destination, tty, "logging in");
        let login = self.provider.login(&request, cleanups).await?;
        let mut session = Session::new(login, tty);

        let result = self
            .drive(&mut session, args, &settings, &command, role, cleanups)
            .await;
        session.close().await;
        result
    }

    async fn drive(
        &self,
        session: &mut Session,
        args: &SessionArgs,
        settings: &Settings<'_>,
        command: &str,
        role: LaunchRole,
        cleanups: &mut Cleanups,
    ) -> TsshResult<()> {
        if let Some(target) = &args.stdio_forward {
            return self.forward_stdio(session, target, cleanups).await;
        }

        if args.no_command {
            cleanups.after_login.drain();
            debug!("no remote command, waiting for the connection to end");
            if let Err(e) = session.handle.wait().await {
                debug!("connection ended: {e}");
            }
            return Ok(());
        }

        let channel = session
            .channel
            .clone()
            .ok_or_else(|| TsshError::Session("login did not open a session".into()))?;
        if command.is_empty() {
            channel
                .shell()
                .await
                .map_err(|e| TsshError::Session(format!("start shell failed: {e}")))?;
        } else {
            channel
                .start(command)
                .await
                .map_err(|e| TsshError::Session(format!("start command [{command}] failed: {e}")))?;
        }

        let _raw_mode = if self.console.is_terminal() && session.tty {
            Some(self.console.enter_raw_mode()?)
        } else {
            None
        };

        enable_trzsz(
            session,
            self.console.as_ref(),
            self.filters,
            &TrzszSettings::resolve(settings),
        )?;

        cleanups.after_login.drain();

        if let Err(e) = channel.wait().await {
            debug!("session ended: {e}");
        }
        if role == LaunchRole::Background {
            if let Err(e) = session.handle.wait().await {
                debug!("connection ended: {e}");
            }
        }
        Ok(())
    }

    /// `-W host:port`: splice local stdio onto a tunnel through the login.
    async fn forward_stdio(
        &self,
        session: &mut Session,
        target: &str,
        cleanups: &mut Cleanups,
    ) -> TsshResult<()> {
        let stream = session.handle.dial(target, None).await?;
        let (mut remote_read, mut remote_write) = tokio::io::split(stream);

        let mut stdin = self.console.stdin();
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin, &mut remote_write).await {
                debug!("stdio forward input ended: {e}");
            }
            let _ = remote_write.shutdown().await;
        });

        cleanups.after_login.drain();

        let mut stdout = self.console.stdout();
        if let Err(e) = tokio::io::copy(&mut remote_read, &mut stdout).await {
            debug!("stdio forward output ended: {e}");
        }
        let _ = stdout.flush().await;
        Ok(())
    }
}
