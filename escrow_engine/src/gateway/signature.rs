//! HMAC-SHA256 helpers for outgoing signatures and incoming webhook verification.
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::gateway::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// How far a timestamped signature may be from the local clock, in either direction.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

fn new_mac(key: &[u8], message: &[u8]) -> Result<HmacSha256, GatewayError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| GatewayError::InvalidSignature(format!("Invalid key. {e}")))?;
    mac.update(message);
    Ok(mac)
}

/// Returns the HMAC-SHA256 of `message`, hex-encoded.
pub fn calculate_hmac(key: &[u8], message: &[u8]) -> Result<String, GatewayError> {
    let mac = new_mac(key, message)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex-encoded signature against the HMAC-SHA256 of `message`. The comparison is constant-time.
pub fn verify_hmac(key: &[u8], message: &[u8], signature_hex: &str) -> Result<(), GatewayError> {
    let expected = hex::decode(signature_hex.trim())
        .map_err(|e| GatewayError::InvalidSignature(format!("Signature is not valid hex. {e}")))?;
    new_mac(key, message)?
        .verify_slice(&expected)
        .map_err(|_| GatewayError::InvalidSignature("Signature does not match the payload".into()))
}

/// A parsed `t=<unix timestamp>,v1=<signature>[,v1=<signature>...]` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedSignature {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl TimestampedSignature {
    pub fn parse(header: &str) -> Result<Self, GatewayError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", t)) => {
                    let t = t.parse::<i64>().map_err(|e| GatewayError::InvalidSignature(format!("Bad timestamp. {e}")))?;
                    timestamp = Some(t);
                },
                Some(("v1", sig)) => signatures.push(sig.to_string()),
                _ => {},
            }
        }
        let timestamp = timestamp.ok_or_else(|| GatewayError::InvalidSignature("Missing timestamp".into()))?;
        if signatures.is_empty() {
            return Err(GatewayError::InvalidSignature("Missing v1 signature".into()));
        }
        Ok(Self { timestamp, signatures })
    }

    /// The signed message is `"{timestamp}.{payload}"`. Any one of the listed signatures may match, and the
    /// timestamp must lie within `tolerance` of `now`, so that a captured webhook cannot be replayed later.
    pub fn verify(&self, key: &[u8], payload: &[u8], now: DateTime<Utc>, tolerance: Duration) -> Result<(), GatewayError> {
        let mut message = format!("{}.", self.timestamp).into_bytes();
        message.extend_from_slice(payload);
        if !self.signatures.iter().any(|sig| verify_hmac(key, &message, sig).is_ok()) {
            return Err(GatewayError::InvalidSignature("No signature matches the payload".into()));
        }
        let drift = (now.timestamp() - self.timestamp).abs();
        if drift > tolerance.num_seconds() {
            return Err(GatewayError::InvalidSignature(format!(
                "Signature timestamp {} is {drift}s away from the current time",
                self.timestamp
            )));
        }
        Ok(())
    }
}
