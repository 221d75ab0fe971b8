//! HMAC-SHA256 payload signing.
//!
//! Signatures are computed over [`canonical_json`]: compact JSON with the
//! keys of every object sorted, at every depth. Two payloads that are equal
//! as JSON values always produce the same bytes, however their keys were
//! ordered on input or stored in memory. Signatures are formatted as
//! `sha256=<lowercase hex>`.

use std::fmt;

use hmac::{Hmac, Mac};
use serde::{ser::SerializeMap, Serialize, Serializer};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{CoreError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every signature produced by [`Signer`].
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Header carrying the signature on outbound deliveries.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Compact JSON for `value` with object keys sorted bytewise at every depth.
///
/// This is the byte form that is signed and sent on the wire.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&Canonical(value)).unwrap_or_else(|_| value.to_string())
}

struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(object) => {
                let mut entries: Vec<(&String, &Value)> = object.iter().collect();
                entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, &Canonical(value))?;
                }
                map.end()
            },
            Value::Array(items) => serializer.collect_seq(items.iter().map(Canonical)),
            scalar => scalar.serialize(serializer),
        }
    }
}

/// Stateless payload signer keyed by a server secret.
///
/// # Example
///
/// ```
/// use courier_core::Signer;
/// use serde_json::json;
///
/// let signer = Signer::new("topsecret").unwrap();
/// let payload = json!({"event": "order.created", "id": 42});
/// let signature = signer.sign(&payload);
///
/// assert!(signature.starts_with("sha256="));
/// assert!(signer.verify(&payload, &signature));
/// ```
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl Signer {
    /// Creates a signer for `secret`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the secret is empty.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(CoreError::InvalidInput("signing secret must not be empty".to_string()));
        }

        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| CoreError::InvalidInput(format!("invalid signing secret: {e}")))?;
        Ok(Self { mac })
    }

    /// Signs the canonical form of a JSON payload.
    pub fn sign(&self, payload: &Value) -> String {
        self.sign_bytes(canonical_json(payload).as_bytes())
    }

    /// Signs raw bytes.
    pub fn sign_bytes(&self, bytes: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(bytes);
        format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
    }

    /// Checks `signature` against a JSON payload in constant time.
    pub fn verify(&self, payload: &Value, signature: &str) -> bool {
        self.verify_bytes(canonical_json(payload).as_bytes(), signature)
    }

    /// Checks `signature` against raw bytes in constant time.
    ///
    /// Malformed signatures (missing prefix, bad hex, wrong length) are
    /// rejected.
    pub fn verify_bytes(&self, bytes: &[u8], signature: &str) -> bool {
        let Some(hex_digest) = signature.strip_prefix(SIGNATURE_PREFIX) else {
            return false;
        };
        let Ok(expected) = hex::decode(hex_digest) else {
            return false;
        };

        let mut mac = self.mac.clone();
        mac.update(bytes);
        mac.verify_slice(&expected).is_ok()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}
