//! Minimal ASN.1/DER traversal for legacy private-key material.
//!
//! # Responsibilities
//! - Walk tag/length/value triplets (short-form and long-form lengths)
//! - Recognize PKCS#8 PrivateKeyInfo wrapping
//! - Extract (modulus, private exponent) from a bare PKCS#1 RSAPrivateKey
//!
//! This is deliberately not a general DER library. It reads exactly what
//! the TLS bootstrap needs and nothing else, and it never panics on
//! malformed input.

/// Error type for DER traversal.
#[derive(Debug, thiserror::Error)]
pub enum DerError {
    /// Input ended before a complete tag/length/value triplet.
    #[error("truncated DER input at offset {0}")]
    Truncated(usize),
    /// A length field that cannot be represented.
    #[error("unsupported DER length encoding at offset {0}")]
    BadLength(usize),
    /// The expected structure was not found.
    #[error("unexpected DER structure: {0}")]
    UnexpectedStructure(&'static str),
}

/// ASN.1 universal tag numbers this module cares about.
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_SEQUENCE: u8 = 0x10;

/// Cursor over a DER-encoded byte slice.
pub struct DerReader<'a> {
    bytes: &'a [u8],
    index: usize,
}

impl<'a> DerReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, index: 0 }
    }

    /// True when the cursor has consumed all input.
    pub fn is_empty(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DerError> {
        let end = self
            .index
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DerError::Truncated(self.index))?;
        let slice = &self.bytes[self.index..end];
        self.index = end;
        Ok(slice)
    }

    /// Read one tag/length/value triplet, returning (tag, contents).
    ///
    /// Short-form lengths (`0x00..=0x7f`) encode the length directly; a
    /// long-form length byte (`0x80 | n`) is followed by `n` big-endian
    /// length bytes.
    pub fn read(&mut self) -> Result<(u8, &'a [u8]), DerError> {
        let at = self.index;
        let tag = self.take(1)?[0];
        let first = self.take(1)?[0];
        let length = if first & 0x80 == 0 {
            first as usize
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 || count > std::mem::size_of::<usize>() {
                return Err(DerError::BadLength(at));
            }
            self.take(count)?
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize)
        };
        Ok((tag, self.take(length)?))
    }

    /// Read a triplet and require its tag number (class bits ignored).
    fn expect(&mut self, tag: u8, what: &'static str) -> Result<&'a [u8], DerError> {
        let (found, contents) = self.read()?;
        if found & 0x1f != tag {
            return Err(DerError::UnexpectedStructure(what));
        }
        Ok(contents)
    }
}

/// RSA key material recovered from a legacy PKCS#1 encoding.
///
/// Holds only (modulus, private exponent); the CRT parameters that follow
/// in the encoding are ignored, matching the legacy bootstrap path that
/// constructs a non-CRT key.
pub struct RsaComponents {
    pub modulus: Vec<u8>,
    pub private_exponent: Vec<u8>,
}

impl RsaComponents {
    /// Bit length of the modulus, leading zero bytes stripped.
    pub fn modulus_bits(&self) -> usize {
        let mut bytes = self.modulus.as_slice();
        while let [0, rest @ ..] = bytes {
            bytes = rest;
        }
        match bytes.first() {
            Some(first) => bytes.len() * 8 - first.leading_zeros() as usize,
            None => 0,
        }
    }
}

/// Check whether `bytes` looks like a PKCS#8 PrivateKeyInfo: a SEQUENCE of
/// a version INTEGER, an AlgorithmIdentifier SEQUENCE and an OCTET STRING.
pub fn is_pkcs8(bytes: &[u8]) -> bool {
    let mut outer = DerReader::new(bytes);
    let Ok(contents) = outer.expect(TAG_SEQUENCE, "outer sequence") else {
        return false;
    };
    let mut inner = DerReader::new(contents);
    inner.expect(TAG_INTEGER, "version").is_ok()
        && inner.expect(TAG_SEQUENCE, "algorithm identifier").is_ok()
        && inner.expect(TAG_OCTET_STRING, "private key").is_ok()
}

/// Extract (modulus, private exponent) from a bare PKCS#1 RSAPrivateKey:
/// `SEQUENCE { version, modulus, publicExponent, privateExponent, ... }`.
pub fn rsa_key_components(bytes: &[u8]) -> Result<RsaComponents, DerError> {
    let mut outer = DerReader::new(bytes);
    let contents = outer.expect(TAG_SEQUENCE, "first part is not a sequence")?;
    let mut inner = DerReader::new(contents);
    inner.expect(TAG_INTEGER, "missing version integer")?;
    let modulus = inner.expect(TAG_INTEGER, "missing modulus integer")?;
    inner.expect(TAG_INTEGER, "missing public exponent integer")?;
    let private_exponent = inner.expect(TAG_INTEGER, "missing private exponent integer")?;
    Ok(RsaComponents {
        modulus: modulus.to_vec(),
        private_exponent: private_exponent.to_vec(),
    })
}
