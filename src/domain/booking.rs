use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Only bookings that are still awaiting or holding a reservation accept money.
    pub fn is_payable(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "checked_in" | "checked-in" => Ok(BookingStatus::CheckedIn),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            _ => Err(ParseEnumError::new("booking status", value)),
        }
    }
}

/// What the payment engine needs to know about a booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingDetails {
    pub id: Uuid,
    /// Total owed for the stay, in minor units.
    pub total_amount: i64,
    pub status: BookingStatus,
    pub owner_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_and_confirmed_are_payable() {
        assert!(BookingStatus::Pending.is_payable());
        assert!(BookingStatus::Confirmed.is_payable());
        assert!(!BookingStatus::CheckedIn.is_payable());
        assert!(!BookingStatus::Completed.is_payable());
        assert!(!BookingStatus::Cancelled.is_payable());
    }

    #[test]
    fn parses_both_cancel_spellings() {
        assert_eq!("canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("archived".parse::<BookingStatus>().is_err());
    }
}
