use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use url::Url;

const DEFAULT_CONFIG_FILENAME: &str = "tollgate.yaml";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8081";
const DEFAULT_DB_FILENAME: &str = "tollgate.db";
const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CHALLENGE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_UNHEALTHY_THRESHOLD_SECS: u64 = 60;

/// One backend behind the proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    /// Regular expression the request host must match.
    pub host_regexp: String,
    /// Regular expression the request path must match. Empty matches all.
    #[serde(default)]
    pub path_regexp: String,
    /// Upstream base URL.
    pub backend: String,
    /// Price of a token for this service; 0 means free.
    #[serde(default)]
    pub price_msat: u64,
    #[serde(default = "default_true")]
    pub auth_required: bool,
    /// Capabilities granted to freshly minted tokens.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Service tier recorded in the `services` caveat.
    #[serde(default)]
    pub tier: u8,
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
    /// If set, minted tokens expire this many seconds after issuance.
    #[serde(default)]
    pub token_lifetime_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_service_timeout() -> u64 {
    DEFAULT_SERVICE_TIMEOUT_SECS
}

/// Connection details for the backing payment node. The node speaks a
/// REST-shaped invoice API; only the capability contract matters here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticatorConfig {
    /// Disable authentication entirely. Only valid while no configured
    /// service requires auth.
    #[serde(default)]
    pub disable: bool,
    /// Base URL of the payment node, e.g. `https://127.0.0.1:8080`.
    #[serde(default)]
    pub node_host: String,
    /// Path to the hex-encoded macaroon authorizing invoice operations.
    #[serde(default)]
    pub macaroon_path: String,
    /// Accept the node's self-signed TLS certificate.
    #[serde(default)]
    pub tls_insecure: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Optional second plaintext ingress (e.g. behind a privacy overlay
    /// that provides its own encryption).
    #[serde(default)]
    pub insecure_listen_addr: Option<String>,
    /// Directory for the database and other files. Defaults to the working
    /// directory.
    #[serde(default)]
    pub base_dir: Option<String>,
    /// Secret-store database path; relative paths resolve under `base_dir`.
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub authenticator: AuthenticatorConfig,
    /// CORS origin allow-list; empty disables CORS handling.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Serve files from `static_root` for requests nothing else matched.
    #[serde(default)]
    pub serve_static: bool,
    #[serde(default)]
    pub static_root: Option<String>,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_challenge_timeout")]
    pub challenge_timeout_secs: u64,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold_secs: u64,
    /// Bearer token required for /metrics (None = public).
    #[serde(default)]
    pub metrics_token: Option<String>,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_drain_timeout() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

fn default_challenge_timeout() -> u64 {
    DEFAULT_CHALLENGE_TIMEOUT_SECS
}

fn default_unhealthy_threshold() -> u64 {
    DEFAULT_UNHEALTHY_THRESHOLD_SECS
}

impl Config {
    /// Load the configuration file.
    ///
    /// The path is taken from `TOLLGATE_CONFIG` if set (the file must then
    /// exist); otherwise `tollgate.yaml` in the working directory is read if
    /// present, and pure defaults apply if not. `TOLLGATE_LISTEN_ADDR`
    /// overrides the listen address either way.
    pub fn load() -> Result<Self, ConfigError> {
        let (path, must_exist) = match env::var("TOLLGATE_CONFIG") {
            Ok(p) if !p.is_empty() => (PathBuf::from(p), true),
            _ => (PathBuf::from(DEFAULT_CONFIG_FILENAME), false),
        };

        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(raw) => Self::from_yaml(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !must_exist => {
                Self::from_yaml("{}")?
            }
            Err(e) => {
                return Err(ConfigError::Io(format!(
                    "config file {}: {e}",
                    path.display()
                )))
            }
        };

        if let Ok(addr) = env::var("TOLLGATE_LISTEN_ADDR") {
            if !addr.is_empty() {
                cfg.listen_addr = addr;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Full path of the secret-store database.
    pub fn resolved_db_path(&self) -> PathBuf {
        let db = self.db_path.as_deref().unwrap_or(DEFAULT_DB_FILENAME);
        let db = Path::new(db);
        if db.is_absolute() {
            return db.to_path_buf();
        }
        match &self.base_dir {
            Some(base) => Path::new(base).join(db),
            None => db.to_path_buf(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(ConfigError::Invalid("service with empty name".into()));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service name: {}",
                    service.name
                )));
            }
            regex::Regex::new(&service.host_regexp).map_err(|e| {
                ConfigError::Invalid(format!("service {}: host_regexp: {e}", service.name))
            })?;
            regex::Regex::new(&service.path_regexp).map_err(|e| {
                ConfigError::Invalid(format!("service {}: path_regexp: {e}", service.name))
            })?;
            Url::parse(&service.backend).map_err(|e| {
                ConfigError::Invalid(format!("service {}: backend: {e}", service.name))
            })?;
        }

        if self.serve_static {
            let root_ok = self
                .static_root
                .as_deref()
                .is_some_and(|r| !r.trim().is_empty());
            if !root_ok {
                return Err(ConfigError::Invalid(
                    "static_root must be set when serve_static is enabled".into(),
                ));
            }
        }

        if self.authenticator.disable {
            if let Some(s) = self.services.iter().find(|s| s.auth_required) {
                return Err(ConfigError::Invalid(format!(
                    "authenticator is disabled but service {} requires auth",
                    s.name
                )));
            }
        } else {
            if self.authenticator.node_host.is_empty() {
                return Err(ConfigError::MissingRequired("authenticator.node_host"));
            }
            Url::parse(&self.authenticator.node_host)
                .map_err(|e| ConfigError::Invalid(format!("authenticator.node_host: {e}")))?;
            if self.authenticator.macaroon_path.is_empty() {
                return Err(ConfigError::MissingRequired("authenticator.macaroon_path"));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(String),

    #[error("unable to parse config file: {0}")]
    Parse(String),

    #[error("missing required config value: {0}")]
    MissingRequired(&'static str),

    #[error("invalid config: {0}")]
    Invalid(String),
}
