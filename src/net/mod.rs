//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!         |
//!         v
//!   listener (accept + backpressure)
//!         |
//!         +-- tls (optional handshake, credentials from `tls::bootstrap`)
//!         |
//!         v
//!   server exchange handling
//! ```

pub mod der;
pub mod listener;
pub mod tls;

pub use listener::{Listener, ListenerError};
pub use tls::{CredentialStore, KeyFormat, TlsError};
