use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod debts;

pub use debts::DebtTable;

/// A named party that can owe or be owed credits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "Username")]
    pub username: String,
}

impl Account {
    pub fn new(username: impl Into<String>) -> Self {
        Self { username: username.into() }
    }
}

/// One signed transfer between two accounts. A positive amount means the
/// payer owes the recipient that many credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "Payer")]
    pub payer: String,
    #[serde(rename = "Recipient")]
    pub recipient: String,
    #[serde(rename = "Credits")]
    pub credits: i64,
    #[serde(rename = "Date", with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

/// Net traffic between a subject account and one counterparty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Credits the counterparty owes the subject.
    #[serde(rename = "incoming-credits")]
    pub incoming_credits: u64,
    /// Credits the subject owes the counterparty.
    #[serde(rename = "outgoing-credits")]
    pub outgoing_credits: u64,
}

impl SummaryRecord {
    /// Signed balance from the subject's point of view; positive when the
    /// subject owes the counterparty. Saturates at the `i64` bounds.
    pub fn net(&self) -> i64 {
        let net = i128::from(self.outgoing_credits) - i128::from(self.incoming_credits);
        i64::try_from(net).unwrap_or(if net < 0 { i64::MIN } else { i64::MAX })
    }
}

/// Per-counterparty summary for one account, keyed by username.
pub type Summary = BTreeMap<String, SummaryRecord>;

/// Summary for every known account, keyed by username.
pub type GlobalSummary = BTreeMap<String, Summary>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_is_signed_difference() {
        let record = SummaryRecord { incoming_credits: 7, outgoing_credits: 3 };
        assert_eq!(record.net(), -4);
    }

    #[test]
    fn test_net_saturates_on_huge_balances() {
        let owed = SummaryRecord { incoming_credits: 0, outgoing_credits: u64::MAX };
        let owing = SummaryRecord { incoming_credits: u64::MAX, outgoing_credits: 0 };
        let even = SummaryRecord { incoming_credits: u64::MAX, outgoing_credits: u64::MAX };
        assert_eq!(owed.net(), i64::MAX);
        assert_eq!(owing.net(), i64::MIN);
        assert_eq!(even.net(), 0);
    }
}
