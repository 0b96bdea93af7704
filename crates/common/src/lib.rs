//! Shared protocol definitions and errors for the `rproxy` workspace.

pub mod error;
pub mod protocol;

pub use error::ProxyError;
pub use protocol::{Endpoint, Protocol};
