//! HTTP exchange types and body decoding.
//!
//! # Data Flow
//! ```text
//! hyper request head + body stream
//!     → decoder.rs (content-type dispatch, method override)
//!         → multipart.rs (boundary scan, spool-to-disk)
//!     → Request (normalized, immutable view for dispatch)
//! dispatch result
//!     → Response (status, headers, body)
//! ```

pub mod decoder;
pub mod multipart;
pub mod request;
pub mod response;

pub use decoder::{decode_request, DecodeError, DecodePolicy};
pub use multipart::{FileBody, UploadedFile};
pub use request::Request;
pub use response::Response;
