//! Configuration loading and validation for the rproxy binary.
//!
//! All values come from `RPROXY_*` environment variables; every one has a
//! default, so an empty environment yields the stock TLS → TLS setup.

use std::time::Duration;

use anyhow::{Context, Result};
use common::{Endpoint, Protocol};
use serde::Deserialize;

use crate::server::{ProxyConfig, TlsFiles};

const ENV_PREFIX: &str = "RPROXY";

/// Validated rproxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen endpoint, `<tcp|tls>://<host:port>`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Backend endpoint, `<tcp|tls>://<host:port>`.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// PEM root CA used for both backend and client certificate checks.
    #[serde(default = "default_root_cert")]
    pub root_cert: String,

    #[serde(default = "default_server_cert")]
    pub server_cert: String,

    #[serde(default = "default_server_key")]
    pub server_key: String,

    #[serde(default = "default_client_cert")]
    pub client_cert: String,

    #[serde(default = "default_client_key")]
    pub client_key: String,

    /// Name the TLS backend must present a certificate for.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Log every proxied byte at `debug` level.
    #[serde(default)]
    pub verbose: bool,

    /// Overrides the per-protocol accept-error policy when set.
    #[serde(default)]
    pub continue_on_accept_error: Option<bool>,

    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> String {
    "tls://0.0.0.0:23001".into()
}
fn default_backend() -> String {
    "tls://127.0.0.1:23002".into()
}
fn default_root_cert() -> String {
    "certs/root_cert.pem".into()
}
fn default_server_cert() -> String {
    "certs/server_cert.pem".into()
}
fn default_server_key() -> String {
    "certs/server_key.pem".into()
}
fn default_client_cert() -> String {
    "certs/client_0_cert.pem".into()
}
fn default_client_key() -> String {
    "certs/client_0_key.pem".into()
}
fn default_server_name() -> String {
    "testapp-server".into()
}
fn default_dial_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(config::Environment::with_prefix(ENV_PREFIX))
    }

    fn load(source: config::Environment) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(source.try_parsing(true))
            .build()
            .context("failed to build rproxy configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise rproxy configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        let listen = parse_endpoint(&self.listen, "RPROXY_LISTEN")?;
        let backend = parse_endpoint(&self.backend, "RPROXY_BACKEND")?;

        if self.dial_timeout_secs == 0 {
            anyhow::bail!("RPROXY_DIAL_TIMEOUT_SECS must be > 0");
        }
        if listen.protocol == Protocol::Tls || backend.protocol == Protocol::Tls {
            ensure_non_empty(&self.root_cert, "RPROXY_ROOT_CERT")?;
        }
        if listen.protocol == Protocol::Tls {
            ensure_non_empty(&self.server_cert, "RPROXY_SERVER_CERT")?;
            ensure_non_empty(&self.server_key, "RPROXY_SERVER_KEY")?;
        }
        if backend.protocol == Protocol::Tls {
            ensure_non_empty(&self.client_cert, "RPROXY_CLIENT_CERT")?;
            ensure_non_empty(&self.client_key, "RPROXY_CLIENT_KEY")?;
            ensure_non_empty(&self.server_name, "RPROXY_SERVER_NAME")?;
        }
        Ok(())
    }

    /// Convert into the proxy's runtime configuration.
    pub fn into_proxy_config(self) -> Result<ProxyConfig> {
        let listen = parse_endpoint(&self.listen, "RPROXY_LISTEN")?;
        let backend = parse_endpoint(&self.backend, "RPROXY_BACKEND")?;

        let mut cfg = ProxyConfig::new(listen, backend)
            .with_tls_files(TlsFiles {
                root_cert: self.root_cert.into(),
                server_cert: self.server_cert.into(),
                server_key: self.server_key.into(),
                client_cert: self.client_cert.into(),
                client_key: self.client_key.into(),
                server_name: self.server_name,
            })
            .with_verbose(self.verbose)
            .with_dial_timeout(Duration::from_secs(self.dial_timeout_secs));
        if let Some(continue_on_error) = self.continue_on_accept_error {
            cfg = cfg.with_continue_on_accept_error(continue_on_error);
        }
        Ok(cfg)
    }
}

fn parse_endpoint(value: &str, name: &str) -> Result<Endpoint> {
    value
        .parse()
        .with_context(|| format!("{name} is not a valid endpoint"))
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::load(config::Environment::with_prefix(ENV_PREFIX).source(Some(vars)))
    }

    #[test]
    fn defaults() {
        assert_eq!(default_listen(), "tls://0.0.0.0:23001");
        assert_eq!(default_backend(), "tls://127.0.0.1:23002");
        assert_eq!(default_server_name(), "testapp-server");
        assert_eq!(default_dial_timeout_secs(), 30);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn empty_environment_is_valid() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.listen, default_listen());
        assert!(!cfg.verbose);
        assert_eq!(cfg.continue_on_accept_error, None);
    }

    #[test]
    fn reads_prefixed_variables() {
        let cfg = load(&[
            ("RPROXY_LISTEN", "tcp://127.0.0.1:9000"),
            ("RPROXY_BACKEND", "TCP://127.0.0.1:9001"),
            ("RPROXY_VERBOSE", "true"),
            ("RPROXY_CONTINUE_ON_ACCEPT_ERROR", "false"),
            ("RPROXY_DIAL_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        assert!(cfg.verbose);
        assert_eq!(cfg.dial_timeout_secs, 5);

        let proxy = cfg.into_proxy_config().unwrap();
        assert_eq!(proxy.listen, Endpoint::new(Protocol::Tcp, "127.0.0.1:9000"));
        assert_eq!(proxy.backend.protocol, Protocol::Tcp);
        assert_eq!(proxy.dial_timeout, Duration::from_secs(5));
        assert!(!proxy.accept_errors_are_recoverable());
    }

    #[test]
    fn validate_rejects_unsupported_protocol() {
        let err = load(&[("RPROXY_BACKEND", "udp://127.0.0.1:53")]).unwrap_err();
        assert!(format!("{err:#}").contains("unsupported protocol"));
    }

    #[test]
    fn validate_rejects_zero_dial_timeout() {
        assert!(load(&[("RPROXY_DIAL_TIMEOUT_SECS", "0")]).is_err());
    }

    #[test]
    fn validate_requires_certs_only_for_tls() {
        let cfg = Config {
            listen: "tls://0.0.0.0:23001".into(),
            backend: "tcp://127.0.0.1:23002".into(),
            root_cert: default_root_cert(),
            server_cert: "  ".into(),
            server_key: default_server_key(),
            client_cert: String::new(),
            client_key: String::new(),
            server_name: String::new(),
            verbose: false,
            continue_on_accept_error: None,
            dial_timeout_secs: 30,
            log_level: default_log_level(),
        };
        // Empty server cert with a TLS listener.
        assert!(cfg.validate().is_err());

        // Client material is irrelevant for a TCP backend.
        let cfg = Config {
            server_cert: default_server_cert(),
            ..cfg
        };
        assert!(cfg.validate().is_ok());
    }
}
