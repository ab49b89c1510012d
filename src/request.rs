//! Validated preview requests and their content fingerprints.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// A schema-checked, normalized request. Only [`crate::validate`] builds these.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreviewRequest {
    pub(crate) html: Option<String>,
    pub(crate) css: Option<String>,
    pub(crate) js: Option<String>,
}

impl PreviewRequest {
    pub fn html(&self) -> Option<&str> {
        self.html.as_deref()
    }

    pub fn css(&self) -> Option<&str> {
        self.css.as_deref()
    }

    pub fn js(&self) -> Option<&str> {
        self.js.as_deref()
    }

    /// Total bytes of text carried by the request.
    pub fn content_len(&self) -> usize {
        [&self.html, &self.css, &self.js]
            .iter()
            .filter_map(|f| f.as_ref().map(String::len))
            .sum()
    }

    /// SHA-256 over a framed encoding of the fields.
    ///
    /// Each field contributes `tag, presence, u64 length (BE), bytes`, so no
    /// two distinct requests share an encoding.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for (tag, field) in [(b'h', &self.html), (b'c', &self.css), (b'j', &self.js)] {
            hasher.update([tag]);
            match field {
                Some(text) => {
                    hasher.update([1]);
                    hasher.update((text.len() as u64).to_be_bytes());
                    hasher.update(text.as_bytes());
                }
                None => hasher.update([0]),
            }
        }
        Fingerprint(hasher.finalize().into())
    }
}

/// Deterministic digest of a request's normalized content. Used as the cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid fingerprint: {0}")]
pub struct ParseFingerprintError(String);

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| ParseFingerprintError(e.to_string()))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ParseFingerprintError(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(Self(digest))
    }
}
