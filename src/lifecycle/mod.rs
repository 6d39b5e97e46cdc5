//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Load config → Validate → Build store → Start listeners
//!
//! Shutdown (shutdown.rs):
//!     ctrl-c → stop accepting → close store → exit
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
