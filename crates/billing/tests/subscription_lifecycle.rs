//! Subscription lifecycle against the scripted processor
//!
//! Covers plan assignment, plan changes, the downgrade guard, immediate
//! cancellation, and resumption.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use subsync_billing::gateway::{InvoiceRecord, InvoiceStatus, ProcessorError};
use subsync_billing::notifications::NotificationTemplate;
use subsync_billing::testing::TestHarness;
use subsync_billing::{BillingError, CancelSignal, DowngradeViolation, SubscriptionStatus};
use subsync_shared::Repository;

#[tokio::test]
async fn new_paid_subscription_syncs_catalog_and_customer() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme Trading", "owner@acme.test").await;
    let professional = h.plan("professional").await.unwrap();
    assert_eq!(professional.price_cents, 5499);

    let sub = h
        .billing
        .subscriptions
        .create_or_update(tenant.id, &professional, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(h.gateway.calls("create_customer"), 1);
    assert_eq!(h.gateway.calls("create_price"), 1);
    assert_eq!(h.gateway.calls("create_subscription"), 1);

    let stored_plan = h.plan("professional").await.unwrap();
    let price = h
        .gateway
        .price(stored_plan.processor_price_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(price.unit_amount, Some(5499));
    assert_eq!(price.currency, "aed");

    // Paid plans wait for the first invoice
    let remote = h.gateway.subscription(&sub.processor_subscription_id).unwrap();
    assert_eq!(remote.status, "incomplete");
    assert_eq!(sub.status, SubscriptionStatus::Incomplete);

    let tenant = h.tenants.get(tenant.id).await.unwrap();
    assert_eq!(tenant.processor_customer_id.as_deref(), Some(remote.customer_id.as_str()));

    let sent = h.sender.wait_for(1).await;
    assert_eq!(sent[0].template, NotificationTemplate::SubscriptionWelcome);
    assert_eq!(sent[0].recipient, "owner@acme.test");
}

#[tokio::test]
async fn free_plan_activates_immediately() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Corner Shop", "owner@corner.test").await;
    let starter = h.plan("starter").await.unwrap();

    let sub = h
        .billing
        .subscriptions
        .create_or_update(tenant.id, &starter, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(h.gateway.subscription(&sub.processor_subscription_id).unwrap().status, "active");
}

#[tokio::test]
async fn status_follows_processor_report() {
    let h = TestHarness::new().await;
    h.gateway.set_new_subscription_status("trialing");
    let tenant = h.add_tenant("Trial Co", "owner@trial.test").await;
    let professional = h.plan("professional").await.unwrap();

    let sub = h
        .billing
        .subscriptions
        .create_or_update(tenant.id, &professional, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(sub.status, SubscriptionStatus::Trialing);

    h.gateway.set_new_subscription_status("paused");
    let other = h.add_tenant("Paused Co", "owner@paused.test").await;
    let sub = h
        .billing
        .subscriptions
        .create_or_update(other.id, &professional, &CancelSignal::never())
        .await
        .unwrap();

    // Statuses outside the local set map to incomplete
    assert_eq!(sub.status, SubscriptionStatus::Incomplete);
}

#[tokio::test]
async fn repeated_assignment_keeps_one_row_per_tenant() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let starter = h.plan("starter").await.unwrap();
    let professional = h.plan("professional").await.unwrap();
    let cancel = CancelSignal::never();

    h.billing.subscriptions.create_or_update(tenant.id, &starter, &cancel).await.unwrap();
    h.billing.subscriptions.create_or_update(tenant.id, &starter, &cancel).await.unwrap();
    let upgraded = h
        .billing
        .subscriptions
        .create_or_update(tenant.id, &professional, &cancel)
        .await
        .unwrap();

    assert_eq!(h.subscriptions.len().await, 1);
    assert_eq!(h.gateway.calls("create_subscription"), 1);
    assert_eq!(h.gateway.calls("update_subscription"), 1);
    assert_eq!(upgraded.plan_id, professional.id);

    let remote = h.gateway.subscription(&upgraded.processor_subscription_id).unwrap();
    let stored_plan = h.plan("professional").await.unwrap();
    assert_eq!(remote.price_id, stored_plan.processor_price_id);
}

#[tokio::test]
async fn downgrade_is_blocked_by_feature_in_use() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let professional = h.plan("professional").await.unwrap();
    let starter = h.plan("starter").await.unwrap();
    h.gateway.set_new_subscription_status("active");
    let cancel = CancelSignal::never();

    h.billing
        .subscriptions
        .create_or_update(tenant.id, &professional, &cancel)
        .await
        .unwrap();

    let err = h
        .billing
        .subscriptions
        .create_or_update(tenant.id, &starter, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::DowngradeBlocked(DowngradeViolation::Feature { .. })
    ));
    assert_eq!(h.gateway.calls("update_subscription"), 0);

    let sub = h.billing.subscriptions.get_for_tenant(tenant.id).await.unwrap();
    assert_eq!(sub.plan_id, professional.id);
}

#[tokio::test]
async fn downgrade_is_blocked_by_usage_over_target_limit() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let enterprise = h.plan("enterprise").await.unwrap();
    let professional = h.plan("professional").await.unwrap();
    h.gateway.set_new_subscription_status("active");
    h.usage.set(8, 1, 10);
    let cancel = CancelSignal::never();

    h.billing
        .subscriptions
        .create_or_update(tenant.id, &enterprise, &cancel)
        .await
        .unwrap();

    let violation = h
        .billing
        .subscriptions
        .downgrade_violation(tenant.id, &enterprise, &professional)
        .await
        .unwrap();
    // Enterprise-only features are checked before limits
    assert!(matches!(violation, Some(DowngradeViolation::Feature { .. })));

    let mut relaxed = professional.clone();
    relaxed.features = enterprise.features.clone();
    let violation = h
        .billing
        .subscriptions
        .downgrade_violation(tenant.id, &enterprise, &relaxed)
        .await
        .unwrap();
    assert_eq!(
        violation,
        Some(DowngradeViolation::Limit {
            limit: "team_members".to_string(),
            current: 8,
            allowed: 5,
        })
    );
}

#[tokio::test]
async fn cancel_immediately_marks_row_canceled() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let starter = h.plan("starter").await.unwrap();
    let cancel = CancelSignal::never();

    let sub = h.billing.subscriptions.create_or_update(tenant.id, &starter, &cancel).await.unwrap();
    let canceled = h.billing.subscriptions.cancel_immediately(tenant.id, &cancel).await.unwrap();

    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert_eq!(
        h.gateway.subscription(&sub.processor_subscription_id).unwrap().status,
        "canceled"
    );

    // Already canceled is a no-op
    h.billing.subscriptions.cancel_immediately(tenant.id, &cancel).await.unwrap();
    assert_eq!(h.gateway.calls("cancel_subscription"), 1);

    let err = h
        .billing
        .entitlements
        .can_use_feature(tenant.id, "accounting")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::SubscriptionCanceled));
}

#[tokio::test]
async fn failed_processor_cancel_still_persists_canceled() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let starter = h.plan("starter").await.unwrap();
    let cancel = CancelSignal::never();

    h.billing.subscriptions.create_or_update(tenant.id, &starter, &cancel).await.unwrap();
    h.gateway.fail_next(
        "cancel_subscription",
        ProcessorError::from_status("cancel_subscription", 400, "already canceled"),
    );

    let err = h.billing.subscriptions.cancel_immediately(tenant.id, &cancel).await.unwrap_err();
    assert!(matches!(err, BillingError::Processor(_)));

    let sub = h.billing.subscriptions.get_for_tenant(tenant.id).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn resume_pays_open_invoices_and_reuses_row() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let starter = h.plan("starter").await.unwrap();
    let cancel = CancelSignal::never();

    let original = h.billing.subscriptions.create_or_update(tenant.id, &starter, &cancel).await.unwrap();
    h.billing.subscriptions.cancel_immediately(tenant.id, &cancel).await.unwrap();

    let customer_id = h.tenants.get(tenant.id).await.unwrap().processor_customer_id.unwrap();
    h.gateway.insert_invoice(InvoiceRecord {
        id: "in_open".to_string(),
        customer_id: Some(customer_id),
        subscription_id: Some(original.processor_subscription_id.clone()),
        status: Some(InvoiceStatus::Open),
        amount_due: 1200,
        amount_paid: 0,
        currency: "aed".to_string(),
        hosted_invoice_url: None,
        invoice_pdf: None,
        created: 1_700_000_000,
    });

    let resumed = h.billing.subscriptions.resume_if_no_due(tenant.id, &cancel).await.unwrap();

    assert_eq!(h.gateway.invoice("in_open").unwrap().status, Some(InvoiceStatus::Paid));
    assert_eq!(resumed.id, original.id);
    assert_ne!(resumed.processor_subscription_id, original.processor_subscription_id);
    assert_eq!(resumed.status, SubscriptionStatus::Active);
    assert_eq!(h.subscriptions.len().await, 1);
}

#[tokio::test]
async fn resume_refuses_when_invoice_cannot_be_paid() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let starter = h.plan("starter").await.unwrap();
    let cancel = CancelSignal::never();

    h.billing.subscriptions.create_or_update(tenant.id, &starter, &cancel).await.unwrap();
    h.billing.subscriptions.cancel_immediately(tenant.id, &cancel).await.unwrap();

    let customer_id = h.tenants.get(tenant.id).await.unwrap().processor_customer_id.unwrap();
    h.gateway.insert_invoice(InvoiceRecord {
        id: "in_declined".to_string(),
        customer_id: Some(customer_id),
        subscription_id: None,
        status: Some(InvoiceStatus::Open),
        amount_due: 1200,
        amount_paid: 0,
        currency: "aed".to_string(),
        hosted_invoice_url: None,
        invoice_pdf: None,
        created: 1_700_000_000,
    });
    h.gateway.fail_next(
        "pay_invoice",
        ProcessorError::from_status("pay_invoice", 402, "card declined"),
    );

    let err = h.billing.subscriptions.resume_if_no_due(tenant.id, &cancel).await.unwrap_err();
    assert!(matches!(err, BillingError::SubscriptionNotActive(_)));
    assert_eq!(h.gateway.calls("create_subscription"), 1);

    let rows = h.subscriptions.find_many(&[]).await.unwrap();
    assert_eq!(rows[0].status, SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn canceled_tenant_must_resume_instead_of_resubscribing() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let starter = h.plan("starter").await.unwrap();
    let cancel = CancelSignal::never();

    h.billing.subscriptions.create_or_update(tenant.id, &starter, &cancel).await.unwrap();
    h.billing.subscriptions.cancel_immediately(tenant.id, &cancel).await.unwrap();

    let customer_id = h.tenants.get(tenant.id).await.unwrap().processor_customer_id.unwrap();
    h.gateway.insert_invoice(InvoiceRecord {
        id: "in_owed".to_string(),
        customer_id: Some(customer_id),
        subscription_id: None,
        status: Some(InvoiceStatus::Open),
        amount_due: 1200,
        amount_paid: 0,
        currency: "aed".to_string(),
        hosted_invoice_url: None,
        invoice_pdf: None,
        created: 1_700_000_000,
    });

    let err = h
        .billing
        .subscriptions
        .create_or_update(tenant.id, &starter, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::SubscriptionCanceled));
    assert_eq!(h.gateway.invoice("in_owed").unwrap().status, Some(InvoiceStatus::Open));
    assert_eq!(h.gateway.calls("create_subscription"), 1);

    let sub = h.billing.subscriptions.get_for_tenant(tenant.id).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_assignment_creates_one_subscription() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let professional = h.plan("professional").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let billing = h.billing.clone();
        let plan = professional.clone();
        let tenant_id = tenant.id;
        handles.push(tokio::spawn(async move {
            billing
                .subscriptions
                .create_or_update(tenant_id, &plan, &CancelSignal::never())
                .await
        }));
    }

    let mut processor_ids = Vec::new();
    for handle in handles {
        let sub = handle.await.unwrap().unwrap();
        processor_ids.push(sub.processor_subscription_id);
    }

    processor_ids.dedup();
    assert_eq!(processor_ids.len(), 1);
    assert_eq!(h.subscriptions.len().await, 1);
    assert_eq!(h.gateway.subscriptions().len(), 1);
    assert_eq!(h.gateway.customers().len(), 1);
}

#[tokio::test]
async fn upgrade_that_cannot_be_stored_reports_failure() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let starter = h.plan("starter").await.unwrap();
    let professional = h.plan("professional").await.unwrap();
    let cancel = CancelSignal::never();

    let original = h.billing.subscriptions.create_or_update(tenant.id, &starter, &cancel).await.unwrap();
    h.subscriptions.fail_next_writes(3);

    let err = h
        .billing
        .subscriptions
        .create_or_update(tenant.id, &professional, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Store(_)));

    // The processor already moved to the new price; the row did not
    let local = h.billing.subscriptions.get_for_tenant(tenant.id).await.unwrap();
    assert_eq!(local.plan_id, starter.id);
    let remote = h.gateway.subscription(&original.processor_subscription_id).unwrap();
    let stored_plan = h.plan("professional").await.unwrap();
    assert_eq!(remote.price_id, stored_plan.processor_price_id);
    assert_eq!(h.gateway.subscriptions().len(), 1);
}

#[tokio::test]
async fn entitlements_follow_active_plan() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let starter = h.plan("starter").await.unwrap();
    h.usage.set(1, 1, 24);

    h.billing
        .subscriptions
        .create_or_update(tenant.id, &starter, &CancelSignal::never())
        .await
        .unwrap();

    let entitlements = &h.billing.entitlements;
    entitlements.can_use_feature(tenant.id, "accounting").await.unwrap();
    assert!(matches!(
        entitlements.can_use_feature(tenant.id, "data_export").await,
        Err(BillingError::FeatureNotAvailable(_))
    ));

    entitlements.check_usage_limit(tenant.id, "orders_per_month", 1).await.unwrap();
    assert!(matches!(
        entitlements.check_usage_limit(tenant.id, "orders_per_month", 2).await,
        Err(BillingError::LimitExceeded { current: 24, allowed: 25, .. })
    ));
    assert!(matches!(
        entitlements.check_usage_limit(tenant.id, "team_members", 1).await,
        Err(BillingError::LimitExceeded { .. })
    ));
}
