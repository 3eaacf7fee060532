//! Parsed invocation as seen by the session engine.

use std::collections::HashMap;

use tssh_core::{TsshError, TsshResult};

/// `-o key=value` options, keyed case-insensitively. Repeated keys keep
/// every value in order; lookups return the first one.
#[derive(Debug, Clone, Default)]
pub struct SshOptions {
    options: HashMap<String, Vec<String>>,
}

impl SshOptions {
    /// Parse one option in either `Key=Value` or `Key Value` form.
    pub fn add(&mut self, text: &str) -> TsshResult<()> {
        let s = text.trim();
        let pos = match s.find('=') {
            Some(eq) => match s[..eq].trim_end().find([' ', '\t']) {
                Some(p) if p > 0 => p,
                _ => eq,
            },
            None => s
                .find([' ', '\t'])
                .ok_or_else(|| TsshError::Config(format!("invalid option: {s}")))?,
        };
        let key = s[..pos].trim();
        let value = s[pos + 1..].trim();
        if key.is_empty() || value.is_empty() {
            return Err(TsshError::Config(format!("invalid option: {s}")));
        }
        self.options
            .entry(key.to_lowercase())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .get(&key.to_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.options
            .get(&key.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// The flags the engine acts on. Transport-level flags (port, identity,
/// forwards, ...) belong to the login provider instead.
#[derive(Debug, Clone, Default)]
pub struct SessionArgs {
    /// Resolved destination.
    pub destination: String,
    /// Inline command, empty for a login shell.
    pub command: String,
    pub arguments: Vec<String>,
    pub disable_tty: bool,
    pub force_tty: bool,
    pub background: bool,
    pub no_command: bool,
    /// `-W host:port`.
    pub stdio_forward: Option<String>,
    pub reconnect: bool,
    pub drag_file: bool,
    pub trace_log: bool,
    pub relay: bool,
    pub zmodem: bool,
    pub options: SshOptions,
}
