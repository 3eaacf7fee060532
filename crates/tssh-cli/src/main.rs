//! tssh: ssh client with trzsz-aware terminal wiring.
//!
//! Resolves the destination, optionally relaunches itself in the background,
//! then hands the session to the engine. Every fatal error is printed once,
//! after the terminal has been restored, and mapped to an exit code.

mod destination;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tssh_client::{
    run_background, setup_virtual_terminal, Config, Flow, LaunchRole, OpenSshConfig,
    OpenSshProvider, Orchestrator, RelaunchDescriptor, SessionArgs, SshOptions, StdConsole,
    TransferFilterFactory,
};
use tssh_core::Cleanups;

/// tssh: ssh client with trzsz file transfer support
#[derive(Parser, Debug)]
#[command(name = "tssh", version, about = "ssh client with trzsz (trz/tsz) file transfer support")]
struct Cli {
    /// Disable pseudo-terminal allocation
    #[arg(short = 'T')]
    disable_tty: bool,

    /// Force pseudo-terminal allocation
    #[arg(short = 't')]
    force_tty: bool,

    /// Run as a background process
    #[arg(short = 'f')]
    background: bool,

    /// Do not execute a remote command
    #[arg(short = 'N')]
    no_command: bool,

    /// Port to connect to on the remote host
    #[arg(short = 'p', value_name = "port")]
    port: Option<u16>,

    /// User to log in as on the remote machine
    #[arg(short = 'l', value_name = "login_name")]
    login_name: Option<String>,

    /// Identity (private key) for public key auth
    #[arg(short = 'i', value_name = "identity_file")]
    identity: Vec<String>,

    /// Alternative ssh configuration file
    #[arg(short = 'F', value_name = "configfile")]
    ssh_config: Option<String>,

    /// Jump hosts separated by comma characters
    #[arg(short = 'J', value_name = "destination")]
    proxy_jump: Option<String>,

    /// Enable forwarding of the authentication agent connection
    #[arg(short = 'A', conflicts_with = "no_forward_agent")]
    forward_agent: bool,

    /// Disable forwarding of the authentication agent connection
    #[arg(short = 'a')]
    no_forward_agent: bool,

    /// Forwarding allows remote hosts to connect
    #[arg(short = 'g')]
    gateway_ports: bool,

    /// Options in the format used in the configuration file
    #[arg(short = 'o', value_name = "key=value")]
    options: Vec<String>,

    /// Forward stdin and stdout to host on port over the secure channel
    #[arg(short = 'W', value_name = "host:port")]
    stdio_forward: Option<String>,

    /// Dynamic application-level port forwarding
    #[arg(short = 'D', value_name = "[bind_address:]port")]
    dynamic_forward: Vec<String>,

    /// Local port forwarding
    #[arg(short = 'L', value_name = "[bind_address:]port:host:hostport")]
    local_forward: Vec<String>,

    /// Remote port forwarding
    #[arg(short = 'R', value_name = "[bind_address:]port:host:hostport")]
    remote_forward: Vec<String>,

    /// Reconnect when the background session exits
    #[arg(long)]
    reconnect: bool,

    /// Enable drag files and directories to upload
    #[arg(long = "dragfile")]
    drag_file: bool,

    /// Enable trzsz trace logging for debugging
    #[arg(long = "tracelog")]
    trace_log: bool,

    /// Force trzsz to run as a relay
    #[arg(long)]
    relay: bool,

    /// Verbose mode for debugging
    #[arg(long)]
    debug: bool,

    /// Enable zmodem lrzsz (rz/sz) feature
    #[arg(long)]
    zmodem: bool,

    /// Config file path
    #[arg(long = "config", value_name = "path")]
    config: Option<PathBuf>,

    /// Alias in the config file, or [user@]hostname
    destination: Option<String>,

    /// Command to execute on the remote host, with its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    fn session_args(&self, destination: &str) -> anyhow::Result<SessionArgs> {
        let mut options = SshOptions::default();
        for option in &self.options {
            options.add(option)?;
        }
        let (command, arguments) = match self.command.split_first() {
            Some((command, arguments)) => (command.clone(), arguments.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Ok(SessionArgs {
            destination: destination.to_string(),
            command,
            arguments,
            disable_tty: self.disable_tty,
            force_tty: self.force_tty,
            background: self.background,
            no_command: self.no_command,
            stdio_forward: self.stdio_forward.clone(),
            reconnect: self.reconnect,
            drag_file: self.drag_file,
            trace_log: self.trace_log,
            relay: self.relay,
            zmodem: self.zmodem,
            options,
        })
    }

    fn ssh_config(&self) -> OpenSshConfig {
        let forward_agent = match (self.forward_agent, self.no_forward_agent) {
            (true, _) => Some(true),
            (false, true) => Some(false),
            (false, false) => None,
        };
        OpenSshConfig {
            port: self.port,
            login_name: self.login_name.clone(),
            identities: self.identity.clone(),
            ssh_config: self.ssh_config.clone(),
            proxy_jump: self.proxy_jump.clone(),
            forward_agent,
            gateway_ports: self.gateway_ports,
            options: self.options.clone(),
            dynamic_forwards: self.dynamic_forward.clone(),
            local_forwards: self.local_forward.clone(),
            remote_forwards: self.remote_forward.clone(),
            ..Default::default()
        }
    }
}

/// A fatal error and the exit code it maps to. `error` is `None` when the
/// output has already been written.
struct Fatal {
    code: i32,
    error: Option<anyhow::Error>,
}

trait OrExit<T> {
    fn or_exit(self, code: i32) -> Result<T, Fatal>;
}

impl<T, E: Into<anyhow::Error>> OrExit<T> for Result<T, E> {
    fn or_exit(self, code: i32) -> Result<T, Fatal> {
        self.map_err(|e| Fatal {
            code,
            error: Some(e.into()),
        })
    }
}

fn init_tracing(debug: bool) {
    let (default_filter, with_target) = if debug {
        ("tssh=debug,tssh_cli=debug,tssh_client=debug,tssh_core=debug", true)
    } else {
        ("warn", false)
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(with_target)
        .with_writer(std::io::stderr)
        .init();
}

async fn tssh_main(cli: &Cli, cleanups: &mut Cleanups) -> Result<(), Fatal> {
    let interactive = std::io::stdin().is_terminal();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path).or_exit(1)?;

    if interactive {
        setup_virtual_terminal().or_exit(2)?;
    }

    let requested = cli.destination.clone().unwrap_or_default();
    let requested_or_default = if requested.is_empty() {
        config.default.host.clone()
    } else {
        requested.clone()
    };
    if requested_or_default.is_empty() {
        if !interactive {
            eprint!("{}", Cli::command().render_help());
            return Err(Fatal {
                code: 3,
                error: None,
            });
        }
        return Err(Fatal {
            code: 4,
            error: Some(anyhow::anyhow!(
                "no destination given and no default host configured"
            )),
        });
    }
    let dest = destination::resolve(&requested_or_default, &config).or_exit(4)?;
    debug!(requested = %requested, dest = %dest, "destination resolved");

    let role = LaunchRole::from_env();
    if cli.background {
        let desc = RelaunchDescriptor::current(&requested, &dest, role, cli.reconnect).or_exit(5)?;
        if run_background(&desc, role).await.or_exit(5)? == Flow::Exit {
            return Ok(());
        }
    }

    let args = cli.session_args(&dest).or_exit(6)?;
    let provider = OpenSshProvider::new(cli.ssh_config());
    let filters = TransferFilterFactory;
    let orchestrator = Orchestrator::new(&provider, &filters, Arc::new(StdConsole::new()));
    info!(dest = %dest, ?role, "starting session");
    orchestrator
        .run(&args, &config, role, cleanups)
        .await
        .or_exit(6)
}

/// Runs to completion and returns the exit code. All cleanups have run by
/// the time this returns.
async fn run(cli: Cli) -> i32 {
    let mut cleanups = Cleanups::new();
    let code = match tssh_main(&cli, &mut cleanups).await {
        Ok(()) => 0,
        Err(Fatal { code, error }) => {
            if let Some(e) = error {
                eprint!("{e}\r\n");
            }
            code
        }
    };
    drop(cleanups);
    code
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let code = run(cli).await;
    std::process::exit(code);
}
