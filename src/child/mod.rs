//! The wrapped tool as a child process.
//!
//! - [`env`]: the environment that routes the child through the proxy
//! - [`handle`]: spawning, waiting, signal forwarding and exit translation

pub mod env;
pub mod error;
pub mod handle;

pub use env::{ChildEnvironment, proxy_url};
pub use error::ChildError;
pub use handle::{ChildExit, ChildProcess, SignalForwarder, resolve_program};
