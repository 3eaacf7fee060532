//! tssh-client: the session engine behind the `tssh` binary.
//!
//! Once a login exists, the engine decides how local terminal input and
//! output reach the remote side, optionally through a file-transfer aware
//! filter, supervises detached background runs, and tears everything down
//! on every exit path.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tssh_client::{Config, LaunchRole, OpenSshProvider, Orchestrator, SessionArgs,
//!     StdConsole, TransferFilterFactory};
//! use tssh_core::Cleanups;
//!
//! # async fn example() -> tssh_core::TsshResult<()> {
//! let provider = OpenSshProvider::default();
//! let filters = TransferFilterFactory;
//! let orchestrator = Orchestrator::new(&provider, &filters, Arc::new(StdConsole::new()));
//!
//! let args = SessionArgs {
//!     destination: "dev".into(),
//!     ..Default::default()
//! };
//! let mut cleanups = Cleanups::new();
//! orchestrator
//!     .run(&args, &Config::default(), LaunchRole::Foreground, &mut cleanups)
//!     .await
//! # }
//! ```

pub mod args;
pub mod config;
pub mod console;
pub mod filter;
pub mod openssh;
pub mod orchestrator;
pub mod pty;
pub mod pump;
pub mod resolve;
pub mod session;
pub mod supervisor;
pub mod trzsz;

#[cfg(test)]
mod testing;

// Re-export primary public types.
pub use args::{SessionArgs, SshOptions};
pub use config::{Config, Settings};
pub use console::{setup_virtual_terminal, Console, RawModeGuard, StdConsole};
pub use filter::{TransferFilter, TransferFilterFactory};
pub use openssh::{OpenSshConfig, OpenSshProvider};
pub use orchestrator::Orchestrator;
pub use supervisor::{run_background, Flow, LaunchRole, RelaunchDescriptor};
pub use trzsz::{select_wiring, WiringInputs, WiringMode};

// Re-export tssh-core error types for convenience.
pub use tssh_core::{TsshError, TsshResult};
