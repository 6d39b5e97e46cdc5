//! Session identity: cookie parsing, id minting, Set-Cookie rendering.
//!
//! # Responsibilities
//! - Recover the session id from the request's Cookie header
//! - Strip the fixed-length cluster suffix appended by whichever node
//!   minted the cookie
//! - Mint a fresh unguessable id when no usable cookie arrived
//!
//! # Design Decisions
//! - Ids are hex SHA-256 over a process counter, the clock, the peer
//!   address and random bits; no coordination between nodes is needed
//! - A cookie value shorter than the cluster suffix is treated as absent

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::config::SessionConfig;

static MINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Outcome of resolving a request's session identity.
pub struct ResolvedIdentity {
    /// Bare session id, cluster suffix stripped.
    pub id: String,
    /// True when no usable cookie arrived and a fresh id was minted.
    pub minted: bool,
    /// Set-Cookie header value to send back, present only when minted.
    pub set_cookie: Option<String>,
}

/// Resolve the session id for one request, minting one if needed.
pub fn resolve(
    cookie_header: Option<&str>,
    remote: SocketAddr,
    session: &SessionConfig,
    context_path: &str,
) -> ResolvedIdentity {
    let cookie = &session.cookie;
    if let Some(value) = cookie_header.and_then(|header| find_cookie(header, &cookie.name)) {
        if value.len() >= cookie.cluster_suffix.len() {
            let id = &value[..value.len() - cookie.cluster_suffix.len()];
            if !id.is_empty() {
                return ResolvedIdentity {
                    id: id.to_string(),
                    minted: false,
                    set_cookie: None,
                };
            }
        }
        tracing::debug!(cookie = %cookie.name, "cookie too short, minting a fresh id");
    }

    let id = mint_id(remote);
    let set_cookie = format_set_cookie(&id, session, context_path);
    tracing::debug!(session_id = %id, "minted session id");
    ResolvedIdentity {
        id,
        minted: true,
        set_cookie: Some(set_cookie),
    }
}

/// Find one cookie's value in a Cookie header. Names compare
/// case-insensitively; the first match wins.
fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

/// Mint an unguessable session id.
fn mint_id(remote: SocketAddr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(MINT_COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes());
    hasher.update(chrono::Utc::now().timestamp_millis().to_be_bytes());
    hasher.update(remote.to_string().as_bytes());
    hasher.update(rand::random::<u64>().to_be_bytes());
    let digest = hasher.finalize();

    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

/// Render the Set-Cookie header value for a freshly minted id.
///
/// Attribute order follows the common convention: Expires, Max-Age,
/// Domain, Path, Secure, HttpOnly. Each attribute toggles on its own:
/// Expires derives its timestamp from the session inactivity timeout,
/// Max-Age is emitted only when positive, Path falls back to the
/// context path.
pub fn format_set_cookie(id: &str, session: &SessionConfig, context_path: &str) -> String {
    let cookie = &session.cookie;
    let mut out = format!("{}={}{}", cookie.name, id, cookie.cluster_suffix);

    if cookie.expires {
        let lifetime = chrono::Duration::minutes(session.timeout_minutes.max(0));
        let expires = chrono::Utc::now() + lifetime;
        out.push_str("; Expires=");
        out.push_str(&expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
    }
    if cookie.max_age_seconds > 0 {
        out.push_str("; Max-Age=");
        out.push_str(&cookie.max_age_seconds.to_string());
    }
    if let Some(domain) = &cookie.domain {
        out.push_str("; Domain=");
        out.push_str(domain);
    }
    out.push_str("; Path=");
    out.push_str(cookie.path.as_deref().unwrap_or(context_path));
    if cookie.secure {
        out.push_str("; Secure");
    }
    if cookie.http_only {
        out.push_str("; HttpOnly");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CookieConfig;

    fn remote() -> SocketAddr {
        "127.0.0.1:54321".parse().unwrap()
    }

    fn config() -> SessionConfig {
        SessionConfig::default()
    }

    #[test]
    fn returning_cookie_is_reused_verbatim() {
        let resolved = resolve(
            Some("HearthSession=abc123"),
            remote(),
            &config(),
            "/",
        );
        assert_eq!(resolved.id, "abc123");
        assert!(!resolved.minted);
        assert!(resolved.set_cookie.is_none());
    }

    #[test]
    fn cookie_name_matches_case_insensitively() {
        let resolved = resolve(
            Some("hearthsession=abc123"),
            remote(),
            &config(),
            "/",
        );
        assert_eq!(resolved.id, "abc123");
        assert!(!resolved.minted);
    }

    #[test]
    fn picks_the_right_cookie_out_of_many() {
        let resolved = resolve(
            Some("theme=dark; HearthSession=abc123; lang=en"),
            remote(),
            &config(),
            "/",
        );
        assert_eq!(resolved.id, "abc123");
    }

    #[test]
    fn cluster_suffix_is_stripped() {
        let mut session = config();
        session.cookie.cluster_suffix = ".n1".into();
        let resolved = resolve(Some("HearthSession=abc123.n2"), remote(), &session, "/");
        // Suffix stripping is positional, whichever node minted it.
        assert_eq!(resolved.id, "abc123");
        assert!(!resolved.minted);
    }

    #[test]
    fn value_shorter_than_suffix_mints_fresh() {
        let mut session = config();
        session.cookie.cluster_suffix = ".node-one".into();
        let resolved = resolve(Some("HearthSession=ab"), remote(), &session, "/");
        assert!(resolved.minted);
        assert!(resolved.set_cookie.is_some());
    }

    #[test]
    fn absent_cookie_mints_unique_hex_ids() {
        let first = resolve(None, remote(), &config(), "/");
        let second = resolve(None, remote(), &config(), "/");
        assert!(first.minted);
        assert_eq!(first.id.len(), 64);
        assert!(first.id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn minted_set_cookie_carries_the_suffix() {
        let mut session = config();
        session.cookie.cluster_suffix = ".n1".into();
        let resolved = resolve(None, remote(), &session, "/app");
        let header = resolved.set_cookie.unwrap();
        assert!(header.starts_with(&format!("HearthSession={}.n1; ", resolved.id)));
        assert!(header.contains("Path=/app"));
        assert!(header.ends_with("HttpOnly"));
    }

    #[test]
    fn expires_toggles_on_its_own_from_the_session_timeout() {
        // Default max_age_seconds is -1; Expires must not depend on it.
        let mut session = config();
        session.cookie.expires = true;
        let header = format_set_cookie("abc", &session, "/");
        assert!(header.starts_with("HearthSession=abc; Expires="));
        assert!(header.contains(" GMT; Path=/"));
        assert!(!header.contains("Max-Age"));
    }

    #[test]
    fn set_cookie_attribute_toggles() {
        let session = SessionConfig {
            timeout_minutes: 30,
            cookie: CookieConfig {
                name: "sid".into(),
                cluster_suffix: String::new(),
                expires: true,
                max_age_seconds: 600,
                domain: Some("example.org".into()),
                path: Some("/x".into()),
                secure: true,
                http_only: false,
            },
        };
        let header = format_set_cookie("abc", &session, "/");
        assert!(header.starts_with("sid=abc; Expires="));
        assert!(header.contains(" GMT; Max-Age=600; Domain=example.org; Path=/x; Secure"));
        assert!(!header.contains("HttpOnly"));
    }

    #[test]
    fn negative_max_age_emits_neither_expires_nor_max_age_when_off() {
        let header = format_set_cookie("abc", &config(), "/");
        assert_eq!(header, "HearthSession=abc; Path=/; HttpOnly");
    }
}
