//! Remote command and pseudo-terminal resolution.

use tssh_core::{TsshError, TsshResult};

use crate::config::Settings;

/// The remote command to run, or an empty string for a login shell.
///
/// An inline command and a configured `RemoteCommand` are mutually
/// exclusive, unless the configured value is `none`.
pub fn parse_remote_command(settings: &Settings<'_>) -> TsshResult<String> {
    let args = settings.args;
    let configured = settings.get("RemoteCommand");
    let disabled = configured.eq_ignore_ascii_case("none");

    if !args.command.is_empty() && !configured.is_empty() && !disabled {
        return Err(TsshError::Config(
            "cannot execute command-line and remote command".into(),
        ));
    }
    if !args.command.is_empty() {
        if args.arguments.is_empty() {
            return Ok(args.command.clone());
        }
        return Ok(format!("{} {}", args.command, args.arguments.join(" ")));
    }
    if disabled {
        return Ok(String::new());
    }
    Ok(configured.to_string())
}

/// Resolve the remote command and whether to request a pseudo-terminal.
///
/// `interactive` is whether local stdin is a terminal.
pub fn parse_cmd_and_tty(settings: &Settings<'_>, interactive: bool) -> TsshResult<(String, bool)> {
    let command = parse_remote_command(settings)?;
    let args = settings.args;

    if args.disable_tty && args.force_tty {
        return Err(TsshError::Config("cannot specify -t with -T".into()));
    }
    if args.disable_tty {
        return Ok((command, false));
    }
    if args.force_tty {
        return Ok((command, true));
    }

    let request_tty = settings.get("RequestTTY");
    let tty = match request_tty.to_lowercase().as_str() {
        "" | "auto" => interactive && command.is_empty(),
        "no" => false,
        "force" => true,
        "yes" => interactive,
        _ => {
            return Err(TsshError::Config(format!(
                "unknown RequestTTY option: {request_tty}"
            )))
        }
    };
    Ok((command, tty))
}
