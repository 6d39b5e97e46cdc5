//! Shared helpers for integration tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use hearth::store::{SessionStore, StoreError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Minimal parsed HTTP/1.1 response.
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Write one raw request and read the whole response. The request must
/// carry `Connection: close` so the read ends at EOF.
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let body = raw[split + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().expect("empty response");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("bad status line");
    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    RawResponse {
        status,
        headers,
        body,
    }
}

/// In-process store, one attribute map per session id.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, HashMap<String, Bytes>>>,
}

#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, session_id: &str) -> Result<HashMap<String, Bytes>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(
        &self,
        session_id: &str,
        new: &[(String, Bytes)],
        removed: &[String],
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().unwrap();
        let attributes = sessions.entry(session_id.to_string()).or_default();
        for (name, value) in new {
            attributes.insert(name.clone(), value.clone());
        }
        for name in removed {
            attributes.remove(name);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
