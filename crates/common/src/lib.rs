//! Shared utilities: logging setup, local IPC framing, HTTP CONNECT
//! tunneling, stream relaying and bipartite matching.

pub mod error;
pub mod framed;
pub mod http;
pub mod logging;
pub mod matching;
pub mod relay;
pub mod ws;

pub use error::{Error, Result};
pub use logging::setup_logging;
