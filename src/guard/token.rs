//! Replay tokens: what makes two calls "the same call".

use std::fmt;

use crate::dispatch::Call;
use crate::protocol::Value;

pub const TOKEN_LEN: usize = 32;

/// Fixed-size digest identifying one logical request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplayToken([u8; TOKEN_LEN]);

impl ReplayToken {
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Digest of length-prefixed parts, so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn digest(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Display for ReplayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ReplayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplayToken({})", self)
    }
}

/// Derives the replay token for a call.
pub trait TokenStrategy: Send + Sync {
    fn token(&self, call: &Call<'_>) -> ReplayToken;
}

impl<F> TokenStrategy for F
where
    F: Fn(&Call<'_>) -> ReplayToken + Send + Sync,
{
    fn token(&self, call: &Call<'_>) -> ReplayToken {
        self(call)
    }
}

/// Digest of the target URI and the raw body bytes. Two byte-identical
/// submissions of the same method get the same token.
#[derive(Debug, Clone, Copy, Default)]
pub struct BodyDigest;

impl TokenStrategy for BodyDigest {
    fn token(&self, call: &Call<'_>) -> ReplayToken {
        ReplayToken::digest(&[call.target_uri().as_bytes(), call.raw_body()])
    }
}

/// Client-supplied request id carried in a packet header, falling back to
/// [`BodyDigest`] when the header is absent or not a string or number.
#[derive(Debug, Clone)]
pub struct HeaderToken {
    header: String,
}

impl HeaderToken {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl TokenStrategy for HeaderToken {
    fn token(&self, call: &Call<'_>) -> ReplayToken {
        match call.header(&self.header) {
            Some(Value::String(id)) => ReplayToken::digest(&[&b"header"[..], id.as_bytes()]),
            Some(Value::Number(n)) => ReplayToken::digest(&[&b"header"[..], &n.to_be_bytes()[..]]),
            _ => BodyDigest.token(call),
        }
    }
}
