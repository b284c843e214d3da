//! Keyed signatures over provider-defined parameter strings.
//!
//! Each provider message type has exactly one [`SignatureLayout`]: an ordered
//! list of field names. The canonical string is `k1=v1&k2=v2...` in that
//! order, so reordering or dropping a field yields a different digest. A
//! missing field never produces a signature; verification fails closed.

use hmac::{Hmac, Mac};
use serde_json::Value as JsonValue;
use sha2::{Sha256, Sha512};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::payments::utils::secure_eq;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing signed field '{field}' for {layout}")]
    MissingField {
        layout: &'static str,
        field: &'static str,
    },
    #[error("signing key rejected: {0}")]
    InvalidKey(String),
}

/// Keyed hash producing a lowercase hex digest.
pub trait SignatureStrategy: Send + Sync {
    fn algorithm(&self) -> &'static str;

    fn digest_hex(&self, secret: &[u8], message: &[u8]) -> Result<String, SignatureError>;
}

pub struct HmacSha256Strategy;

impl SignatureStrategy for HmacSha256Strategy {
    fn algorithm(&self) -> &'static str {
        "hmac-sha256"
    }

    fn digest_hex(&self, secret: &[u8], message: &[u8]) -> Result<String, SignatureError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        mac.update(message);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

pub struct HmacSha512Strategy;

impl SignatureStrategy for HmacSha512Strategy {
    fn algorithm(&self) -> &'static str {
        "hmac-sha512"
    }

    fn digest_hex(&self, secret: &[u8], message: &[u8]) -> Result<String, SignatureError> {
        let mut mac = Hmac::<Sha512>::new_from_slice(secret)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        mac.update(message);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Ordered field list for one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureLayout {
    pub name: &'static str,
    pub fields: &'static [&'static str],
}

impl SignatureLayout {
    /// Pulls every field through `lookup`, in layout order.
    pub fn collect<F>(&self, lookup: F) -> Result<Vec<(&'static str, String)>, SignatureError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.fields
            .iter()
            .map(|&field| {
                lookup(field)
                    .map(|value| (field, value))
                    .ok_or(SignatureError::MissingField {
                        layout: self.name,
                        field,
                    })
            })
            .collect()
    }
}

/// `k1=v1&k2=v2` with no escaping, as the providers compute it.
pub fn canonical_string(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

/// Reads a JSON body field the way providers stringify it before signing:
/// strings verbatim, numbers and booleans in their JSON form.
pub fn json_field(payload: &JsonValue, key: &str) -> Option<String> {
    match payload.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Signing capability bound to one provider secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Arc<str>,
    strategy: Arc<dyn SignatureStrategy>,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("algorithm", &self.strategy.algorithm())
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, strategy: Arc<dyn SignatureStrategy>) -> Self {
        let secret: String = secret.into();
        Self {
            secret: Arc::from(secret),
            strategy,
        }
    }

    pub fn hmac_sha256(secret: impl Into<String>) -> Self {
        Self::new(secret, Arc::new(HmacSha256Strategy))
    }

    pub fn hmac_sha512(secret: impl Into<String>) -> Self {
        Self::new(secret, Arc::new(HmacSha512Strategy))
    }

    pub fn algorithm(&self) -> &'static str {
        self.strategy.algorithm()
    }

    pub fn sign(&self, params: &[(&str, String)]) -> Result<String, SignatureError> {
        self.strategy
            .digest_hex(self.secret.as_bytes(), canonical_string(params).as_bytes())
    }

    /// Constant-time comparison against the exact lowercase hex digest.
    pub fn verify(&self, params: &[(&str, String)], provided: &str) -> bool {
        if provided.is_empty() {
            return false;
        }
        match self.sign(params) {
            Ok(expected) => secure_eq(expected.as_bytes(), provided.as_bytes()),
            Err(_) => false,
        }
    }

    pub fn sign_layout<F>(&self, layout: &SignatureLayout, lookup: F) -> Result<String, SignatureError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let params = layout.collect(lookup)?;
        self.sign(&params)
    }

    pub fn verify_layout<F>(&self, layout: &SignatureLayout, lookup: F, provided: &str) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        match layout.collect(lookup) {
            Ok(params) => self.verify(&params, provided),
            Err(_) => false,
        }
    }
}
