//! Read-only subscription aggregates

use serde::Serialize;
use time::{Date, Duration, Month};

use crate::gateway::CardRecord;
use crate::plans::Plan;
use crate::subscriptions::Subscription;

/// Cards expiring within this many days are flagged
pub const EXPIRY_WARNING_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardDetails {
    pub brand: String,
    pub last4: String,
    pub exp_month: i64,
    pub exp_year: i64,
    /// Days until the end of the expiry month; negative once expired
    pub days_until_expiry: Option<i64>,
    pub expired: bool,
    pub expiring_soon: bool,
}

impl CardDetails {
    pub fn from_card(card: &CardRecord, today: Date) -> Self {
        let days_until_expiry = days_until_card_expiry(card.exp_month, card.exp_year, today);
        let expired = days_until_expiry.is_some_and(|days| days < 0);
        let expiring_soon =
            days_until_expiry.is_some_and(|days| (0..=EXPIRY_WARNING_DAYS).contains(&days));

        Self {
            brand: card.brand.clone(),
            last4: card.last4.clone(),
            exp_month: card.exp_month,
            exp_year: card.exp_year,
            days_until_expiry,
            expired,
            expiring_soon,
        }
    }
}

/// Subscription with its plan and default card
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionDetails {
    pub subscription: Subscription,
    pub plan: Plan,
    pub payment_method: Option<CardDetails>,
}

/// Whole days from `today` to the last day of the card's expiry month.
/// `None` when the month or year is out of range.
pub fn days_until_card_expiry(exp_month: i64, exp_year: i64, today: Date) -> Option<i64> {
    let month = Month::try_from(u8::try_from(exp_month).ok()?).ok()?;
    let year = i32::try_from(exp_year).ok()?;

    let (next_year, next_month) = match month {
        Month::December => (year.checked_add(1)?, Month::January),
        other => (year, other.next()),
    };
    let last_day = Date::from_calendar_date(next_year, next_month, 1).ok()? - Duration::days(1);

    Some((last_day - today).whole_days())
}
