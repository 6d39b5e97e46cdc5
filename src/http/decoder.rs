//! Request decoding: content-type dispatch and method resolution.
//!
//! # Responsibilities
//! - Normalize the path against the configured context path
//! - Merge query-string and body parameters into one multi-valued map
//! - Apply the form-field method override (PUT/DELETE over POST)
//!
//! # Design Decisions
//! - The body arrives as `AsyncBufRead`; the server adapts the hyper
//!   body stream once, so the decoder never sees transport types
//! - Unrecognized content types are drained and ignored, not rejected

use std::collections::HashMap;
use std::path::PathBuf;

use http::{HeaderMap, Method, Uri};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncBufRead, AsyncReadExt};

use crate::http::multipart::{self, SpoolPolicy};
use crate::http::request::Request;

/// Error type for request decoding.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("body read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoder knobs, derived from the listener and upload configuration.
pub struct DecodePolicy {
    pub context_path: String,
    pub method_override_param: String,
    pub spool_threshold: usize,
    pub spool_dir: Option<PathBuf>,
}

/// Decode one exchange into a normalized [`Request`].
pub async fn decode_request<R: AsyncBufRead + Unpin>(
    method: Method,
    uri: &Uri,
    headers: HeaderMap,
    mut body: R,
    policy: &DecodePolicy,
) -> Result<Request, DecodeError> {
    let path = normalize_path(uri.path(), &policy.context_path);

    let mut parameters: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(query) = uri.query() {
        parse_urlencoded(query, &mut parameters);
    }

    let mut files = HashMap::new();
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        // Decoded lossily rather than rejected; a stray non-UTF-8 byte
        // must not fail the whole exchange.
        let mut raw = Vec::new();
        body.read_to_end(&mut raw).await?;
        parse_urlencoded(&String::from_utf8_lossy(&raw), &mut parameters);
    } else if let Some(boundary) = boundary_token(&content_type) {
        let spool = SpoolPolicy {
            threshold: policy.spool_threshold,
            dir: policy.spool_dir.clone(),
        };
        multipart::parse(&mut body, &boundary, &spool, &mut parameters, &mut files).await?;
    } else {
        // Body types the runtime does not interpret are still consumed
        // so the connection can be reused.
        let mut sink = tokio::io::sink();
        tokio::io::copy(&mut body, &mut sink).await?;
    }

    let method = effective_method(method, &parameters, &policy.method_override_param);

    Ok(Request {
        path,
        method,
        headers,
        parameters,
        files,
        attributes: HashMap::new(),
    })
}

/// Strip the context path prefix and guarantee a leading slash.
fn normalize_path(path: &str, context_path: &str) -> String {
    let stripped = if context_path != "/" {
        path.strip_prefix(context_path).unwrap_or(path)
    } else {
        path
    };
    if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    }
}

/// Split `a=1&b=2` pairs, percent-decoding with `+` as space.
fn parse_urlencoded(encoded: &str, parameters: &mut HashMap<String, Vec<String>>) {
    for pair in encoded.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = decode_component(name);
        let value = decode_component(value);
        if name.is_empty() {
            continue;
        }
        parameters.entry(name).or_default().push(value);
    }
}

fn decode_component(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8_lossy()
        .into_owned()
}

/// Pull the boundary token out of a multipart/form-data content type.
fn boundary_token(content_type: &str) -> Option<String> {
    if !content_type.starts_with("multipart/form-data") {
        return None;
    }
    content_type.split(';').skip(1).find_map(|attr| {
        let (key, value) = attr.split_once('=')?;
        (key.trim() == "boundary").then(|| value.trim().trim_matches('"').to_string())
    })
}

/// The override parameter wins when it names a valid method.
fn effective_method(
    transport: Method,
    parameters: &HashMap<String, Vec<String>>,
    override_param: &str,
) -> Method {
    let Some(requested) = parameters
        .get(override_param)
        .and_then(|values| values.first())
    else {
        return transport;
    };
    match Method::from_bytes(requested.to_ascii_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            tracing::debug!(requested = %requested, "invalid method override ignored");
            transport
        }
    }
}
