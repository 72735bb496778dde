//! Prorated refunds for immediate cancellation

use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::gateway::{InvoiceQuery, InvoiceStatus, Metadata, NewCreditNote, ProcessorGateway};
use crate::proration::{compute_prorated_refund, ProratedRefund};
use crate::retry::{with_retry, CancelSignal, RetrySettings};

/// Credit-note metadata key marking the refund flow that issued it
pub const META_REFUND_KIND: &str = "refund_kind";
/// Credit-note metadata key holding the processor subscription id
pub const META_SUBSCRIPTION: &str = "subscription";
pub const REFUND_KIND_CANCEL_PRORATED: &str = "cancel_prorated";

const REFUND_MEMO: &str = "Prorated refund for immediate cancellation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    /// Period bounds were unknown
    NotAttempted,
    /// No paid invoice, or no unused time left
    NothingDue,
    AlreadyRefunded { credit_note_id: String },
    Refunded { credit_note_id: String, amount: i64 },
}

pub struct RefundService {
    gateway: Arc<dyn ProcessorGateway>,
    retry: RetrySettings,
}

impl RefundService {
    pub fn new(gateway: Arc<dyn ProcessorGateway>, retry: RetrySettings) -> Self {
        Self { gateway, retry }
    }

    /// Credit the unused share of the latest paid invoice of a canceled
    /// subscription. Safe to repeat: an existing refund credit note for the
    /// same subscription and invoice short-circuits the flow.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn refund_on_cancellation(
        &self,
        processor_subscription_id: &str,
        period_start: i64,
        period_end: i64,
        cancel: &CancelSignal,
    ) -> BillingResult<RefundOutcome> {
        let gateway = &self.gateway;
        let attempts = self.retry.attempts;

        let query = InvoiceQuery {
            subscription_id: Some(processor_subscription_id.to_string()),
            status: Some(InvoiceStatus::Paid),
            limit: 1,
            ..Default::default()
        };
        let invoices = with_retry("list_invoices", attempts, cancel, || gateway.list_invoices(&query)).await?;
        let Some(invoice) = invoices.into_iter().next() else {
            tracing::debug!("No paid invoice to refund");
            return Ok(RefundOutcome::NothingDue);
        };

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let amount = match compute_prorated_refund(invoice.amount_paid, period_start, period_end, now) {
            ProratedRefund::NotAttempted => {
                tracing::warn!(invoice_id = %invoice.id, "Missing period bounds, refund not attempted");
                return Ok(RefundOutcome::NotAttempted);
            }
            refund => match refund.payable() {
                Some(amount) => amount,
                None => return Ok(RefundOutcome::NothingDue),
            },
        };

        let notes = with_retry("list_credit_notes", attempts, cancel, || {
            gateway.list_credit_notes(&invoice.id)
        })
        .await?;
        if let Some(existing) = notes.iter().find(|note| {
            note.metadata.get(META_REFUND_KIND).map(String::as_str) == Some(REFUND_KIND_CANCEL_PRORATED)
                && note.metadata.get(META_SUBSCRIPTION).map(String::as_str) == Some(processor_subscription_id)
        }) {
            tracing::info!(credit_note_id = %existing.id, "Refund already issued");
            return Ok(RefundOutcome::AlreadyRefunded {
                credit_note_id: existing.id.clone(),
            });
        }

        let params = NewCreditNote {
            invoice_id: invoice.id.clone(),
            amount,
            memo: REFUND_MEMO.to_string(),
            metadata: Metadata::from([
                (META_REFUND_KIND.to_string(), REFUND_KIND_CANCEL_PRORATED.to_string()),
                (META_SUBSCRIPTION.to_string(), processor_subscription_id.to_string()),
            ]),
        };
        let key = format!("credit_note_cancel_{}_{}", processor_subscription_id, invoice.id);
        let note = with_retry("create_credit_note", attempts, cancel, || {
            gateway.create_credit_note(&params, &key)
        })
        .await?;

        tracing::info!(
            credit_note_id = %note.id,
            invoice_id = %invoice.id,
            amount_cents = amount,
            "Issued prorated refund"
        );

        Ok(RefundOutcome::Refunded {
            credit_note_id: note.id,
            amount,
        })
    }
}
