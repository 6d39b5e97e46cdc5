//! Session identity and state.
//!
//! # Data Flow
//! ```text
//! Cookie header
//!     → identity.rs (resolve or mint a session id)
//!     → cache.rs (lazy-loading, change-tracking attribute map)
//!     → store::SessionStore (persist only what changed)
//! ```

pub mod cache;
pub mod identity;

pub use cache::{Session, SessionError};
pub use identity::{format_set_cookie, resolve, ResolvedIdentity};
