use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing timestamp")]
    MissingTimestamp,
    #[error("signature header carries no v1 signature")]
    MissingSignature,
    #[error("signature timestamp {timestamp} outside tolerance of {tolerance_secs}s")]
    OutsideTolerance { timestamp: i64, tolerance_secs: i64 },
    #[error("no signature matched the payload")]
    Mismatch,
}

/// key: billing-webhook-signature -> `t=<unix>,v1=<hex>` HMAC-SHA256 over `"<t>.<body>"`
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can use any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }

    /// Produces a header value for `payload`; used by tests and local replay tooling.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let digest = self.mac_for(timestamp, payload).finalize().into_bytes();
        format!("t={timestamp},v1={}", hex::encode(digest))
    }

    pub fn verify(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse::<i64>().ok(),
                "v1" => {
                    if let Ok(bytes) = hex::decode(value) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
        if candidates.is_empty() {
            return Err(SignatureError::MissingSignature);
        }
        // `t` is unauthenticated here; abs_diff cannot overflow on extreme values
        if now.timestamp().abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            return Err(SignatureError::OutsideTolerance {
                timestamp,
                tolerance_secs: self.tolerance_secs,
            });
        }

        let mac = self.mac_for(timestamp, payload);
        // verify_slice compares in constant time
        if candidates
            .iter()
            .any(|candidate| mac.clone().verify_slice(candidate).is_ok())
        {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}
