//! Destination resolution against the configured host aliases.

use anyhow::{bail, Result};
use tssh_client::Config;

/// Resolve `requested` to a destination. A configured alias is kept as is;
/// otherwise a unique alias starting with `requested` is chosen. Anything
/// else is taken to be a plain `[user@]host`.
pub fn resolve(requested: &str, config: &Config) -> Result<String> {
    if config.hosts.contains_key(requested) {
        return Ok(requested.to_string());
    }

    let candidates: Vec<&str> = config
        .aliases()
        .filter(|alias| alias.starts_with(requested))
        .collect();
    match candidates.as_slice() {
        [] => Ok(requested.to_string()),
        [alias] => Ok(alias.to_string()),
        many => bail!(
            "ambiguous destination '{requested}', matches: {}",
            many.join(", ")
        ),
    }
}
