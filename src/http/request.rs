//! Normalized per-exchange request snapshot.

use std::collections::HashMap;

use http::{HeaderMap, Method};

use crate::http::multipart::UploadedFile;

/// One exchange's decoded request.
///
/// Built once by the decoder, read by dispatch, discarded when the
/// exchange completes. Spooled upload files delete themselves when the
/// request is dropped.
pub struct Request {
    /// Slash-normalized path with the context path stripped.
    pub path: String,
    /// Effective method after any form-field override.
    pub method: Method,
    /// Transport headers, multi-valued.
    pub headers: HeaderMap,
    /// Query-string and body parameters merged, multi-valued.
    pub parameters: HashMap<String, Vec<String>>,
    /// Uploaded files keyed by form field name.
    pub files: HashMap<String, UploadedFile>,
    /// Request-scoped attributes set and read by dispatch.
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Request {
    /// First value of one parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value of one parameter, empty when absent.
    pub fn params(&self, name: &str) -> &[String] {
        self.parameters
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of one header, when it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}
