use thiserror::Error;

/// Errors produced by the tssh session engine.
#[derive(Debug, Error)]
pub enum TsshError {
    /// Conflicting or unrecognized options.
    #[error("{0}")]
    Config(String),

    /// The destination could not be resolved or substituted.
    #[error("{0}")]
    Resolution(String),

    #[error("login failed: {0}")]
    Login(String),

    /// Starting or driving the remote command/shell failed.
    #[error("{0}")]
    Session(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("{0}")]
    Supervisor(String),

    #[error("terminal error: {0}")]
    Terminal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TsshResult<T> = Result<T, TsshError>;
