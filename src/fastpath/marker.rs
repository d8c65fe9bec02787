//! Signed "blocked until" markers.
//!
//! A marker is `<blocked_until_ms>.<signature>` where the signature is an
//! unpadded URL-safe base64 HMAC-SHA256 over a versioned payload. Markers
//! travel in a cookie, so the client holds them; the signature only stops a
//! client from minting markers for somebody else. Stripping a marker just
//! sends the client to the authoritative check.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, TollgateError};

type HmacSha256 = Hmac<Sha256>;

/// Domain separation prefix mixed into every signature.
const MARKER_CONTEXT: &[u8] = b"tollgate-marker-v1:";

/// Length of generated signing keys in bytes.
const GENERATED_KEY_LEN: usize = 32;

/// A decoded marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    /// Until when the holder is blocked (epoch millis)
    pub blocked_until_ms: u64,
}

impl Marker {
    /// Whether the block still applies at `now_ms`.
    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.blocked_until_ms
    }

    /// Whole seconds left on the block, rounded up.
    pub fn remaining_secs(&self, now_ms: u64) -> u64 {
        self.blocked_until_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

/// Encodes and verifies markers with a shared secret.
///
/// Every edge node that should honour a marker must hold the same secret.
#[derive(Clone)]
pub struct MarkerCodec {
    mac: HmacSha256,
}

impl std::fmt::Debug for MarkerCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerCodec").finish_non_exhaustive()
    }
}

impl MarkerCodec {
    /// Create a codec from raw key bytes.
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(TollgateError::Config("marker secret must not be empty".into()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| TollgateError::Config(format!("invalid marker secret: {}", e)))?;
        Ok(Self { mac })
    }

    /// Create a codec from a hex-encoded key.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| TollgateError::Config(format!("marker secret is not hex: {}", e)))?;
        Self::new(&bytes)
    }

    /// Create a codec with a fresh random key.
    ///
    /// Markers from such a codec are only honoured by the process that
    /// issued them.
    pub fn random() -> Result<Self> {
        let key: [u8; GENERATED_KEY_LEN] = rand::random();
        Self::new(&key)
    }

    /// Issue a marker blocking for `block_secs` from `now_ms`.
    pub fn issue(&self, now_ms: u64, block_secs: u64) -> String {
        self.encode(&Marker {
            blocked_until_ms: now_ms.saturating_add(block_secs.saturating_mul(1000)),
        })
    }

    /// Encode and sign a marker.
    pub fn encode(&self, marker: &Marker) -> String {
        let expiry = marker.blocked_until_ms.to_string();
        let signature = self.keyed(&expiry).finalize().into_bytes();
        format!("{}.{}", expiry, URL_SAFE_NO_PAD.encode(signature))
    }

    /// Decode a marker and verify its signature.
    ///
    /// Expiry is not checked here; see [`Marker::is_active`].
    pub fn decode(&self, token: &str) -> Result<Marker> {
        let (expiry, signature) = token
            .trim()
            .split_once('.')
            .ok_or(TollgateError::MalformedMarker("missing signature"))?;

        if expiry.is_empty() || !expiry.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TollgateError::MalformedMarker("expiry is not a timestamp"));
        }
        let blocked_until_ms: u64 = expiry
            .parse()
            .map_err(|_| TollgateError::MalformedMarker("expiry out of range"))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TollgateError::MalformedMarker("signature is not base64"))?;

        self.keyed(expiry)
            .verify_slice(&signature)
            .map_err(|_| TollgateError::MalformedMarker("signature mismatch"))?;

        Ok(Marker { blocked_until_ms })
    }

    /// A MAC already fed the signed payload for `expiry`.
    fn keyed(&self, expiry: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(MARKER_CONTEXT);
        mac.update(expiry.as_bytes());
        mac
    }
}
