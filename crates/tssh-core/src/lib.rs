//! tssh-core: shared contracts for the tssh session engine.
//!
//! Provides the error taxonomy, the login-provider and stream-filter traits
//! the engine is written against, and the scoped cleanup stacks.

pub mod cleanup;
pub mod error;
pub mod filter;
pub mod transport;

// Re-export commonly used items at crate root.
pub use cleanup::{CleanupStack, Cleanups};
pub use error::{TsshError, TsshResult};
pub use filter::{FilterFactory, FilterOptions, FilterStreams, StreamFilter, TunnelConnector};
pub use transport::{
    BoxFuture, BoxReader, BoxStream, BoxWriter, ByteStream, Login, LoginHandle, LoginProvider,
    LoginRequest, RemoteSession,
};
