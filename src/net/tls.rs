//! TLS bootstrap from bare PEM files, without a keystore file.
//!
//! # Responsibilities
//! - Decode a PEM-armored private key (PKCS#8, or legacy PKCS#1 fallback)
//! - Load certificate files into one chain
//! - Assemble a password-less in-memory credential store (one alias)
//! - Build a rustls `ServerConfig` from it
//!
//! A bootstrap failure disables only the HTTPS listener; the caller keeps
//! the HTTP listener running.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::net::der::{self, DerError};

/// Error type for TLS bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("private key is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("private key is neither PKCS#8 nor a readable PKCS#1 encoding: {0}")]
    Key(#[from] DerError),
    #[error("no usable certificate in the configured files")]
    EmptyChain,
    #[error("credential store holds no entry")]
    NoCredentials,
    #[error("TLS context setup failed: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Encoding the private key arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// Standard wrapped PrivateKeyInfo.
    Pkcs8,
    /// Bare RSAPrivateKey recovered through manual DER traversal.
    LegacyPkcs1,
}

/// Password-less in-memory credential store: alias -> (key, chain).
///
/// The bootstrap always produces exactly one alias (the empty string),
/// mirroring the single unnamed key entry the server has always shipped.
#[derive(Debug)]
pub struct CredentialStore {
    entries: Vec<(String, PrivateKeyDer<'static>, Vec<CertificateDer<'static>>)>,
}

impl CredentialStore {
    fn single(key: PrivateKeyDer<'static>, chain: Vec<CertificateDer<'static>>) -> Self {
        Self {
            entries: vec![(String::new(), key, chain)],
        }
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(alias, _, _)| alias.as_str())
    }

    fn entry(&self) -> Result<(&PrivateKeyDer<'static>, &[CertificateDer<'static>]), TlsError> {
        self.entries
            .first()
            .map(|(_, key, chain)| (key, chain.as_slice()))
            .ok_or(TlsError::NoCredentials)
    }
}

/// Read and decode the private-key file.
///
/// Lines that are empty, PEM armor (`--...`), or colon-delimited metadata
/// are discarded; the remainder is base64-decoded. The result is first
/// recognized as PKCS#8; failing that, the manual DER traversal in
/// [`der::rsa_key_components`] validates a legacy PKCS#1 layout and the
/// raw encoding is used as-is.
pub fn load_private_key(path: &Path) -> Result<(PrivateKeyDer<'static>, KeyFormat), TlsError> {
    let text = fs::read_to_string(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let body: String = text
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with("--") && !line.contains(':'))
        .collect();
    let bytes = BASE64.decode(body)?;

    if der::is_pkcs8(&bytes) {
        return Ok((PrivatePkcs8KeyDer::from(bytes).into(), KeyFormat::Pkcs8));
    }

    let components = der::rsa_key_components(&bytes)?;
    tracing::info!(
        key = %path.display(),
        modulus_bits = components.modulus_bits(),
        "loaded legacy PKCS#1 private key"
    );
    Ok((PrivatePkcs1KeyDer::from(bytes).into(), KeyFormat::LegacyPkcs1))
}

/// Parse every certificate file independently and concatenate the results
/// into one chain. A file that fails to parse is logged and skipped; the
/// chain just gets shorter.
pub fn load_cert_chain(
    paths: &[impl AsRef<Path>],
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut chain = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(cert = %path.display(), error = %e, "skipping unreadable certificate file");
                continue;
            }
        };
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            match cert {
                Ok(cert) => chain.push(cert),
                Err(e) => {
                    tracing::warn!(cert = %path.display(), error = %e, "skipping unparsable certificate");
                }
            }
        }
    }
    if chain.is_empty() {
        return Err(TlsError::EmptyChain);
    }
    Ok(chain)
}

/// One-shot startup routine: key + certificates -> credential store.
pub fn bootstrap(
    key_path: &Path,
    cert_paths: &[impl AsRef<Path>],
) -> Result<CredentialStore, TlsError> {
    let (key, format) = load_private_key(key_path)?;
    let chain = load_cert_chain(cert_paths)?;
    tracing::info!(
        key_format = ?format,
        chain_len = chain.len(),
        "TLS credentials assembled"
    );
    Ok(CredentialStore::single(key, chain))
}

/// Build the server-side TLS context from the credential store's sole entry.
pub fn server_config(store: &CredentialStore) -> Result<Arc<ServerConfig>, TlsError> {
    let (key, chain) = store.entry()?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain.to_vec(), key.clone_key())?;
    Ok(Arc::new(config))
}
