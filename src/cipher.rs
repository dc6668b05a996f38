//! Stateless challenge/response proving a callback was requested by the
//! application that receives it.
//!
//! The scheduling client signs a fresh nonce together with the callback URL
//! using its application secret and sends the result as a `c=` cipher on the
//! schedule request. The dispatcher keeps that string with the task and, at
//! delivery time, answers with an `s=` cipher whose cryptogram also binds the
//! callback id. The receiver recomputes both cryptograms and compares.
//!
//! Every failure on the validation side returns `false`/`None`.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::types::TaskId;

/// Header carrying the cipher on both the schedule request and the callback.
pub const AUTHORIZATION_HEADER: &str = "Revalee-Auth";

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Nonce length used when issuing.
pub const NONCE_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Who produced a cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSource {
    /// Issued by the scheduling client (`c=`).
    Client,
    /// Issued by the dispatcher on delivery (`s=`).
    Server,
}

impl CipherSource {
    fn tag(self) -> &'static str {
        match self {
            CipherSource::Client => "c",
            CipherSource::Server => "s",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("cipher is empty")]
    Empty,
    #[error("malformed cipher field: {0}")]
    MalformedField(String),
    #[error("duplicate cipher field: {0}")]
    DuplicateField(String),
    #[error("unknown cipher field: {0}")]
    UnknownField(String),
    #[error("missing cipher field: {0}")]
    MissingField(&'static str),
    #[error("invalid hex in field {0}")]
    InvalidHex(&'static str),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
}

/// A parsed authorization cipher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCipher {
    pub source: CipherSource,
    pub version: u16,
    pub nonce: Vec<u8>,
    pub cryptogram: Vec<u8>,
}

impl AuthorizationCipher {
    /// Issue a client cipher for `callback_url` with a fresh random nonce.
    pub fn issue(secret: &[u8], callback_url: &str) -> Self {
        let mut nonce = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::issue_with_nonce(secret, callback_url, nonce)
    }

    /// Issue a client cipher with a caller-supplied nonce.
    pub fn issue_with_nonce(secret: &[u8], callback_url: &str, nonce: Vec<u8>) -> Self {
        let cryptogram = client_cryptogram(secret, &nonce, callback_url);
        Self {
            source: CipherSource::Client,
            version: PROTOCOL_VERSION,
            nonce,
            cryptogram,
        }
    }

    /// Parse a serialized cipher. Never panics.
    pub fn try_parse(text: &str) -> Option<Self> {
        text.parse().ok()
    }

    /// Derive the server response for a stored client cipher.
    ///
    /// Returns `None` for server ciphers and unsupported versions.
    pub fn respond(&self, callback_id: &TaskId) -> Option<Self> {
        if self.source != CipherSource::Client || self.version != PROTOCOL_VERSION {
            return None;
        }
        Some(Self {
            source: CipherSource::Server,
            version: self.version,
            nonce: self.nonce.clone(),
            cryptogram: server_cryptogram(&self.nonce, &self.cryptogram, callback_id),
        })
    }
}

impl fmt::Display for AuthorizationCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v={},n={},{}={}",
            self.version,
            hex::encode(&self.nonce),
            self.source.tag(),
            hex::encode(&self.cryptogram)
        )
    }
}

impl FromStr for AuthorizationCipher {
    type Err = CipherError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CipherError::Empty);
        }

        let mut version: Option<u16> = None;
        let mut nonce: Option<Vec<u8>> = None;
        let mut cryptogram: Option<(CipherSource, Vec<u8>)> = None;

        for field in text.split(',') {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| CipherError::MalformedField(field.to_string()))?;
            let key = key.trim();
            let value = value.trim();

            match key {
                "v" => {
                    if version.is_some() {
                        return Err(CipherError::DuplicateField(key.to_string()));
                    }
                    let parsed = value
                        .parse::<u16>()
                        .map_err(|_| CipherError::MalformedField(field.to_string()))?;
                    if parsed < 1 {
                        return Err(CipherError::UnsupportedVersion(parsed));
                    }
                    version = Some(parsed);
                }
                "n" => {
                    if nonce.is_some() {
                        return Err(CipherError::DuplicateField(key.to_string()));
                    }
                    nonce = Some(decode_field(value, "n")?);
                }
                "c" | "s" => {
                    if cryptogram.is_some() {
                        return Err(CipherError::DuplicateField(key.to_string()));
                    }
                    let source = if key == "c" {
                        CipherSource::Client
                    } else {
                        CipherSource::Server
                    };
                    cryptogram = Some((source, decode_field(value, "c/s")?));
                }
                other => return Err(CipherError::UnknownField(other.to_string())),
            }
        }

        let version = version.ok_or(CipherError::MissingField("v"))?;
        let nonce = nonce.ok_or(CipherError::MissingField("n"))?;
        let (source, cryptogram) = cryptogram.ok_or(CipherError::MissingField("c/s"))?;

        Ok(Self { source, version, nonce, cryptogram })
    }
}

fn decode_field(value: &str, name: &'static str) -> Result<Vec<u8>, CipherError> {
    if value.is_empty() || value.len() % 2 != 0 {
        return Err(CipherError::InvalidHex(name));
    }
    hex::decode(value).map_err(|_| CipherError::InvalidHex(name))
}

/// HMAC-SHA256(secret, nonce || utf8(url)).
pub fn client_cryptogram(secret: &[u8], nonce: &[u8], callback_url: &str) -> Vec<u8> {
    // HMAC accepts keys of any length, including empty ones.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(nonce);
    mac.update(callback_url.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// SHA256(nonce || client cryptogram || callback id bytes).
pub fn server_cryptogram(nonce: &[u8], client_cryptogram: &[u8], callback_id: &TaskId) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(client_cryptogram);
    hasher.update(callback_id.as_bytes());
    hasher.finalize().to_vec()
}

/// Build the outbound header value for a task's stored cipher.
///
/// A stored value that does not parse as a client cipher yields `None`; the
/// callback is then delivered without the header.
pub fn server_response_header(stored: Option<&str>, callback_id: &TaskId) -> Option<String> {
    let cipher = AuthorizationCipher::try_parse(stored?)?;
    cipher.respond(callback_id).map(|c| c.to_string())
}

/// Validate a server cipher received with a callback.
///
/// Recomputes the client cryptogram from `secret`, the cipher's nonce and
/// `callback_url`, then the server cryptogram with `callback_id`, and
/// compares in constant time.
pub fn validate(header: &str, secret: &[u8], callback_url: &str, callback_id: &TaskId) -> bool {
    let Some(cipher) = AuthorizationCipher::try_parse(header) else {
        return false;
    };
    if cipher.source != CipherSource::Server || cipher.version != PROTOCOL_VERSION {
        return false;
    }
    if cipher.nonce.is_empty() || cipher.cryptogram.is_empty() {
        return false;
    }

    let client = client_cryptogram(secret, &cipher.nonce, callback_url);
    if client.is_empty() {
        return false;
    }
    let expected = server_cryptogram(&cipher.nonce, &client, callback_id);

    expected.len() == cipher.cryptogram.len() && bool::from(expected.as_slice().ct_eq(cipher.cryptogram.as_slice()))
}
