//! Embedded application-server session runtime.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request        ┌──────────────────────────────────────────────┐
//!     ──────────────────────┼─▶ net (listener, tls) ─▶ server ─▶ http      │
//!                           │                            │      (decoder,  │
//!                           │                            │       multipart)│
//!                           │                            ▼                 │
//!                           │                         session              │
//!                           │                    (identity, cache)         │
//!                           │                            │                 │
//!     Client Response       │                            ▼                 │
//!     ◀─────────────────────┼── server ◀── dispatch   store                │
//!                           │                 (relational | kv ─▶ resp)    │
//!                           │                                              │
//!                           │  config · observability · lifecycle          │
//!                           └──────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod session;
pub mod store;

pub use config::AppConfig;
pub use lifecycle::Shutdown;
pub use server::{Application, Dispatch, TransportListener};
pub use session::Session;
pub use store::SessionStore;
