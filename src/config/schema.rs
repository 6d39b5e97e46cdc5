//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration for the application server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Listener configuration (bind address, ports, context path).
    pub server: ListenerConfig,

    /// TLS material for the HTTPS listener.
    pub tls: TlsConfig,

    /// Session identity and persistence settings.
    pub session: SessionConfig,

    /// Session store selection and backend settings.
    pub store: StoreConfig,

    /// Upload spooling settings.
    pub upload: UploadConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address without port (e.g., "0.0.0.0").
    pub bind_address: String,

    /// Plain HTTP port; listener disabled when absent.
    pub http_port: Option<u16>,

    /// HTTPS port; listener disabled when absent.
    pub https_port: Option<u16>,

    /// Maximum concurrent connections per listener (backpressure).
    pub max_connections: usize,

    /// Context path prefix stripped from request paths.
    pub context_path: String,

    /// Form field that overrides the transport method (PUT/DELETE over POST).
    pub method_override_param: String,

    /// Headers added to every response.
    pub default_headers: BTreeMap<String, String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: Some(8080),
            https_port: None,
            max_connections: 10_000,
            context_path: "/".to_string(),
            method_override_param: "_method".to_string(),
            default_headers: BTreeMap::new(),
        }
    }
}

/// TLS input files for the HTTPS listener.
///
/// Absence of either the key or all certificates disables HTTPS without
/// failing HTTP startup.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to the PEM-armored private key.
    pub key_file: Option<PathBuf>,

    /// Certificate files concatenated into one chain, in order.
    pub cert_files: Vec<PathBuf>,
}

/// Session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity timeout in minutes; indefinite when zero or negative.
    pub timeout_minutes: i64,

    /// Cookie attributes.
    pub cookie: CookieConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            cookie: CookieConfig::default(),
        }
    }
}

/// Session cookie attributes, each independently toggleable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Cookie name.
    pub name: String,

    /// Fixed-length node suffix appended to the cookie value.
    ///
    /// Must have the same length on every node sharing a cookie name, so
    /// that stripping it is unambiguous regardless of which node minted
    /// the cookie.
    pub cluster_suffix: String,

    /// Emit an `Expires` attribute derived from the session timeout.
    pub expires: bool,

    /// `Max-Age` seconds; emitted only when positive.
    pub max_age_seconds: i64,

    /// `Domain` attribute.
    pub domain: Option<String>,

    /// `Path` attribute; defaults to the context path when absent.
    pub path: Option<String>,

    /// `Secure` attribute (HTTPS only).
    pub secure: bool,

    /// `HttpOnly` attribute (no script access).
    pub http_only: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "HearthSession".to_string(),
            cluster_suffix: String::new(),
            expires: false,
            max_age_seconds: -1,
            domain: None,
            path: None,
            secure: false,
            http_only: true,
        }
    }
}

/// Which backing store persists sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// Row-per-attribute relational table.
    #[default]
    Relational,
    /// Hash-per-session key-value server.
    KeyValue,
}

/// Session store selection plus backend-specific settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Active backend; resolved once at startup, never consulted again.
    pub backend: StoreBackend,

    /// Relational backend settings.
    pub relational: RelationalConfig,

    /// Key-value backend settings.
    pub kv: KvConfig,
}

/// Relational session store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelationalConfig {
    /// Database connection URL.
    pub url: String,

    /// Session table name.
    pub table: String,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            table: "t_session".to_string(),
        }
    }
}

/// Key-value session store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KvConfig {
    /// Key-value server host.
    pub host: String,

    /// Key-value server port.
    pub port: u16,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
        }
    }
}

/// Upload spooling settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Uploads stay in memory below this many bytes.
    pub spool_threshold: usize,

    /// Directory for spooled temp files; system temp dir when absent.
    pub dir: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            spool_threshold: 32 * 1024,
            dir: None,
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default tracing filter when RUST_LOG is unset.
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "hearth=debug,info".to_string(),
        }
    }
}
