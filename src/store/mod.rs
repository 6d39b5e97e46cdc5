//! Session persistence backends.
//!
//! # Data Flow
//! ```text
//! session save/load
//!     → SessionStore trait (backend-agnostic)
//!         → relational.rs (row per attribute, SQL)
//!         → kv.rs (hash per session, wire protocol)
//!             → resp.rs (binary wire codec)
//! ```
//!
//! # Design Decisions
//! - Backend chosen once at startup from config, injected as a trait
//!   object; nothing below the factory consults the config again
//! - Values cross the trait boundary as opaque bytes; serialization is
//!   the session layer's concern

pub mod kv;
pub mod relational;
pub mod resp;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::{AppConfig, StoreBackend};

/// Error type for session store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("wire protocol error: {0}")]
    Wire(#[from] resp::RespError),
    #[error("store connection error: {0}")]
    Connect(String),
}

/// Backend-agnostic session persistence.
///
/// `save` receives exactly the attributes that changed since the last
/// load plus the names removed; implementations never rewrite unchanged
/// attributes.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch every attribute of one session, refreshing its liveness.
    async fn load(&self, session_id: &str) -> Result<HashMap<String, Bytes>, StoreError>;

    /// Persist changed attributes and delete removed ones.
    async fn save(
        &self,
        session_id: &str,
        new: &[(String, Bytes)],
        removed: &[String],
    ) -> Result<(), StoreError>;

    /// Release backend resources at shutdown.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Build the configured store backend.
pub async fn build_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>, StoreError> {
    let timeout_seconds = config.session.timeout_minutes.max(0) * 60;
    match config.store.backend {
        StoreBackend::Relational => {
            let store = relational::RelationalSessionStore::connect(
                &config.store.relational,
                timeout_seconds,
            )
            .await?;
            tracing::info!(
                url = %config.store.relational.url,
                table = %config.store.relational.table,
                "relational session store ready"
            );
            Ok(Arc::new(store))
        }
        StoreBackend::KeyValue => {
            let store =
                kv::KvSessionStore::connect(&config.store.kv, timeout_seconds).await?;
            tracing::info!(
                host = %config.store.kv.host,
                port = config.store.kv.port,
                "key-value session store ready"
            );
            Ok(Arc::new(store))
        }
    }
}
