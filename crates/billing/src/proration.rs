//! Proration estimates and prorated refunds
//!
//! All amounts are integer minor units. Nothing here touches the processor
//! or storage.

use time::OffsetDateTime;

use crate::plans::Plan;

/// Days used to normalize a billing period for estimates
pub const PRORATION_PERIOD_DAYS: i64 = 30;

const SECONDS_PER_DAY: i64 = 86_400;

/// Signed estimate of what switching from `current` to `new` costs for the
/// remainder of the period. Negative values are credits.
pub fn estimate_proration(
    current: &Plan,
    new: &Plan,
    current_period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> i64 {
    let difference = new.price_cents - current.price_cents;
    difference * days_remaining(current_period_end, now) / PRORATION_PERIOD_DAYS
}

/// Result of the refund calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProratedRefund {
    /// Period bounds were unknown, so no refund was computed
    NotAttempted,
    Amount(i64),
}

impl ProratedRefund {
    /// Amount to credit, if strictly positive
    pub fn payable(&self) -> Option<i64> {
        match self {
            ProratedRefund::Amount(amount) if *amount > 0 => Some(*amount),
            _ => None,
        }
    }
}

/// Unused share of `amount_paid` for a period given as unix seconds.
/// A bound of 0 means the processor did not report it.
pub fn compute_prorated_refund(
    amount_paid: i64,
    period_start: i64,
    period_end: i64,
    now: i64,
) -> ProratedRefund {
    if period_start == 0 || period_end == 0 {
        return ProratedRefund::NotAttempted;
    }
    if amount_paid <= 0 || period_end <= period_start || now >= period_end || now < period_start {
        return ProratedRefund::Amount(0);
    }

    let total = i128::from(period_end - period_start);
    let remaining = i128::from(period_end - now);
    let amount = i128::from(amount_paid) * remaining / total;

    ProratedRefund::Amount(i64::try_from(amount).unwrap_or(amount_paid))
}

/// Whole days left in a period, never negative
pub fn days_remaining(period_end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    ((period_end.unix_timestamp() - now.unix_timestamp()) / SECONDS_PER_DAY).max(0)
}
