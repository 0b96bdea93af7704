//! `rproxy`: a reverse proxy that accepts plain TCP or mutually authenticated
//! TLS clients and forwards each one to a single TCP or TLS backend.
//!
//! - [`certs`] builds TLS bundles from PEM files.
//! - [`endpoint`] turns a [`Protocol`] into a listener or a backend dial.
//! - [`forward`] copies bytes between two streams until either closes.
//! - [`inspect`] wraps streams for transparent traffic logging.
//! - [`server`] ties them together: accept loop plus one task per session.

pub mod certs;
pub mod config;
pub mod endpoint;
pub mod forward;
pub mod inspect;
pub mod server;
pub mod telemetry;

pub use common::{Endpoint, Protocol, ProxyError};
pub use server::{BoundProxy, ProxyConfig, ProxyServer, TlsFiles};
