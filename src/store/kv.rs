//! Key-value session store.
//!
//! Each session maps to one hash keyed by the session id; attributes are
//! hash fields. Liveness is the server's own key expiry, refreshed on
//! every load and save.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::schema::KvConfig;
use crate::store::resp::{Reply, RespError, WireClient};
use crate::store::{SessionStore, StoreError};

/// Session store backed by a hash-capable key-value server.
pub struct KvSessionStore {
    client: Mutex<WireClient<TcpStream>>,
    ttl_seconds: i64,
}

impl KvSessionStore {
    /// Connect to the configured server. A ttl of zero disables expiry.
    pub async fn connect(config: &KvConfig, ttl_seconds: i64) -> Result<Self, StoreError> {
        let client = WireClient::connect(&config.host, config.port).await?;
        Ok(Self {
            client: Mutex::new(client),
            ttl_seconds,
        })
    }

    async fn refresh_expiry(
        client: &mut WireClient<TcpStream>,
        session_id: &str,
        ttl_seconds: i64,
    ) -> Result<(), StoreError> {
        if ttl_seconds <= 0 {
            return Ok(());
        }
        let ttl = ttl_seconds.to_string();
        client
            .command(&[b"EXPIRE", session_id.as_bytes(), ttl.as_bytes()])
            .await?
            .into_result()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for KvSessionStore {
    async fn load(&self, session_id: &str) -> Result<HashMap<String, Bytes>, StoreError> {
        let mut client = self.client.lock().await;
        let reply = client
            .command(&[b"HGETALL", session_id.as_bytes()])
            .await?
            .into_result()?;
        let items = match reply {
            Reply::Array(Some(items)) => items,
            Reply::Array(None) => Vec::new(),
            other => {
                return Err(
                    RespError::Protocol(format!("HGETALL returned {other:?}")).into(),
                )
            }
        };

        let mut attributes = HashMap::with_capacity(items.len() / 2);
        let mut pairs = items.into_iter();
        while let Some(field) = pairs.next() {
            let value = pairs.next().ok_or_else(|| {
                RespError::Protocol("HGETALL returned an odd element count".into())
            })?;
            let (Reply::Bulk(Some(field)), Reply::Bulk(Some(value))) = (field, value) else {
                return Err(
                    RespError::Protocol("HGETALL element is not a bulk string".into()).into(),
                );
            };
            let name = String::from_utf8(field.to_vec()).map_err(|_| {
                RespError::Protocol("attribute name is not UTF-8".into())
            })?;
            attributes.insert(name, value);
        }

        Self::refresh_expiry(&mut client, session_id, self.ttl_seconds).await?;
        tracing::debug!(session_id, attributes = attributes.len(), "session loaded");
        Ok(attributes)
    }

    async fn save(
        &self,
        session_id: &str,
        new: &[(String, Bytes)],
        removed: &[String],
    ) -> Result<(), StoreError> {
        let mut client = self.client.lock().await;
        for (name, value) in new {
            client
                .command(&[b"HSET", session_id.as_bytes(), name.as_bytes(), value])
                .await?
                .into_result()?;
        }
        for name in removed {
            client
                .command(&[b"HDEL", session_id.as_bytes(), name.as_bytes()])
                .await?
                .into_result()?;
        }
        Self::refresh_expiry(&mut client, session_id, self.ttl_seconds).await?;
        tracing::debug!(
            session_id,
            written = new.len(),
            removed = removed.len(),
            "session saved"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut client = self.client.lock().await;
        client.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one connection and answer each incoming command with the
    /// next scripted reply, recording everything received.
    async fn scripted_server(
        replies: Vec<&'static [u8]>,
    ) -> (KvConfig, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            for reply in replies {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                socket.write_all(reply).await.unwrap();
            }
            received
        });
        let config = KvConfig {
            host: "127.0.0.1".to_string(),
            port,
        };
        (config, handle)
    }

    #[tokio::test]
    async fn load_decodes_alternating_pairs_and_refreshes_expiry() {
        let (config, handle) = scripted_server(vec![
            b"*4\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n",
            b":1\r\n",
        ])
        .await;
        let store = KvSessionStore::connect(&config, 1800).await.unwrap();
        let attributes = store.load("sid1").await.unwrap();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes["a"], Bytes::from_static(b"1"));
        assert_eq!(attributes["b"], Bytes::from_static(b"2"));

        store.close().await.unwrap();
        let received = handle.await.unwrap();
        let text = String::from_utf8(received).unwrap();
        assert!(text.starts_with("*2\r\n$7\r\nHGETALL\r\n$4\r\nsid1\r\n"));
        assert!(text.contains("EXPIRE"));
        assert!(text.contains("1800"));
    }

    #[tokio::test]
    async fn load_of_missing_session_is_empty() {
        let (config, handle) = scripted_server(vec![b"*0\r\n"]).await;
        let store = KvSessionStore::connect(&config, 0).await.unwrap();
        let attributes = store.load("nope").await.unwrap();
        assert!(attributes.is_empty());
        store.close().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn save_issues_hset_and_hdel() {
        let (config, handle) = scripted_server(vec![b":1\r\n", b":1\r\n"]).await;
        let store = KvSessionStore::connect(&config, 0).await.unwrap();
        store
            .save(
                "sid1",
                &[("a".to_string(), Bytes::from_static(b"1"))],
                &["old".to_string()],
            )
            .await
            .unwrap();
        store.close().await.unwrap();

        let received = String::from_utf8(handle.await.unwrap()).unwrap();
        assert!(received.contains("HSET"));
        assert!(received.contains("HDEL"));
        assert!(received.contains("$3\r\nold\r\n"));
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_store_error() {
        let (config, handle) = scripted_server(vec![b"-ERR read only\r\n"]).await;
        let store = KvSessionStore::connect(&config, 0).await.unwrap();
        let err = store
            .save("sid1", &[("a".to_string(), Bytes::from_static(b"1"))], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Wire(RespError::Server(_))));
        store.close().await.unwrap();
        handle.await.unwrap();
    }
}
