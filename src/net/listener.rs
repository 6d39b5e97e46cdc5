//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to configured address(es)
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Graceful handling of accept errors

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    Bind(std::io::Error),
    /// Failed to accept connection.
    #[error("failed to accept: {0}")]
    Accept(std::io::Error),
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
}

impl Listener {
    /// Bind to `addr` with the given connection limit.
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .expect("Semaphore closed unexpectedly");

        // Then accept the connection
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
