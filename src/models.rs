//! Projected entities (contacts, transactions) and their value types.
//! These are derived views; the event log is the source of truth.

use crate::ids::{ContactId, TransactionId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Supported currencies. UI passes the chosen code (e.g. "IQD"); no default is applied here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    IQD,
    USD,
    EUR,
    GBP,
    JPY,
    CHF,
    CAD,
    AUD,
    CNY,
    INR,
    SAR,
    AED,
    EGP,
    TRY,
    BRL,
    MXN,
    KRW,
    ZAR,
    RUB,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::IQD => "IQD",
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::JPY => "JPY",
            Currency::CHF => "CHF",
            Currency::CAD => "CAD",
            Currency::AUD => "AUD",
            Currency::CNY => "CNY",
            Currency::INR => "INR",
            Currency::SAR => "SAR",
            Currency::AED => "AED",
            Currency::EGP => "EGP",
            Currency::TRY => "TRY",
            Currency::BRL => "BRL",
            Currency::MXN => "MXN",
            Currency::KRW => "KRW",
            Currency::ZAR => "ZAR",
            Currency::RUB => "RUB",
        }
    }

    pub fn from_code(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "IQD" => Some(Currency::IQD),
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            "JPY" => Some(Currency::JPY),
            "CHF" => Some(Currency::CHF),
            "CAD" => Some(Currency::CAD),
            "AUD" => Some(Currency::AUD),
            "CNY" => Some(Currency::CNY),
            "INR" => Some(Currency::INR),
            "SAR" => Some(Currency::SAR),
            "AED" => Some(Currency::AED),
            "EGP" => Some(Currency::EGP),
            "TRY" => Some(Currency::TRY),
            "BRL" => Some(Currency::BRL),
            "MXN" => Some(Currency::MXN),
            "KRW" => Some(Currency::KRW),
            "ZAR" => Some(Currency::ZAR),
            "RUB" => Some(Currency::RUB),
            _ => None,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    #[default]
    Money,
    Item,
}

/// Sign convention for balances: `lent` money is owed back to the user
/// (positive), `owed` money is owed by the user (negative).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionDirection {
    Owed,
    Lent,
}

impl TransactionDirection {
    /// The signed balance delta this direction implies for `amount`.
    pub fn signed(&self, amount: i64) -> i64 {
        match self {
            TransactionDirection::Lent => amount,
            TransactionDirection::Owed => -amount,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionDirection::Owed => "owed",
            TransactionDirection::Lent => "lent",
        }
    }

    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "owed" => Some(TransactionDirection::Owed),
            "lent" => Some(TransactionDirection::Lent),
            _ => None,
        }
    }
}

/// Projected contact. `balance` is the sum of signed deltas of all live
/// transactions referencing it, in smallest currency units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub name: String,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_synced: bool,
}

/// Projected transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub contact_id: ContactId,
    #[serde(rename = "type", default)]
    pub kind: TransactionKind,
    pub direction: TransactionDirection,
    pub amount: i64,
    pub currency: Currency,
    pub description: Option<String>,
    pub transaction_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_synced: bool,
}

impl Transaction {
    /// Signed balance delta this transaction contributes to its contact.
    pub fn signed_amount(&self) -> i64 {
        self.direction.signed(self.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_round_trips_codes() {
        assert_eq!(Currency::from_code("usd"), Some(Currency::USD));
        assert_eq!(Currency::USD.as_str(), "USD");
        assert_eq!(Currency::from_code("XYZ"), None);
    }

    #[test]
    fn direction_sign_convention() {
        assert_eq!(TransactionDirection::Lent.signed(500), 500);
        assert_eq!(TransactionDirection::Owed.signed(500), -500);
    }
}
