//! Sign-aware folding of receipts into per-counterparty summaries.
//!
//! A receipt `(payer, recipient, credits)` with non-negative credits means the
//! payer owes the recipient. A negative amount is a reversal and moves the
//! magnitude to the opposite direction.

use crate::models::{Summary, SummaryRecord};

/// A summary with a zeroed entry for every account.
pub fn empty_summary<'a>(users: impl IntoIterator<Item = &'a str>) -> Summary {
    users
        .into_iter()
        .map(|u| (u.to_string(), SummaryRecord::default()))
        .collect()
}

/// Adds one receipt to `subject`'s summary. Receipts not touching `subject`
/// are ignored.
pub fn apply_receipt(summary: &mut Summary, subject: &str, payer: &str, recipient: &str, credits: i64) {
    let magnitude = credits.unsigned_abs();

    if payer == subject {
        let entry = summary.entry(recipient.to_string()).or_default();
        if credits >= 0 {
            entry.outgoing_credits += magnitude;
        } else {
            entry.incoming_credits += magnitude;
        }
    }

    if recipient == subject {
        let entry = summary.entry(payer.to_string()).or_default();
        if credits >= 0 {
            entry.incoming_credits += magnitude;
        } else {
            entry.outgoing_credits += magnitude;
        }
    }
}
