//! Pure domain types for the payment engine.
//!
//! Nothing in here touches the database or the network. Status enums carry
//! their own transition tables so every adapter enforces the same rules.

pub mod booking;
pub mod installment;
pub mod payment;
pub mod risk;
pub mod transaction;

/// Returned when a persisted or user-supplied string does not name a known
/// enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
