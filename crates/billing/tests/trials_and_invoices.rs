//! Trials, grace periods, scheduled plan changes, one-off invoices, and
//! usage reads against the scripted processor

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::{json, Value};
use subsync_billing::gateway::{InvoiceStatus, ProrationMode};
use subsync_billing::notifications::NotificationTemplate;
use subsync_billing::testing::TestHarness;
use subsync_billing::{
    BillingError, CancelSignal, InvoiceRequest, Subscription, SubscriptionStatus, WebhookOutcome,
};
use time::{Duration, OffsetDateTime};

const DAY: i64 = 86_400;

fn event(id: &str, event_type: &str, object: Value) -> String {
    json!({
        "id": id,
        "type": event_type,
        "data": { "object": object },
    })
    .to_string()
}

async fn deliver(h: &TestHarness, payload: &str) -> Result<WebhookOutcome, BillingError> {
    h.billing
        .webhooks
        .handle(payload, Some(&TestHarness::sign(payload)), &CancelSignal::never())
        .await
}

async fn on_plan(h: &TestHarness, descriptor: &str) -> Subscription {
    h.gateway.set_new_subscription_status("active");
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let plan = h.plan(descriptor).await.unwrap();
    h.billing
        .subscriptions
        .create_or_update(tenant.id, &plan, &CancelSignal::never())
        .await
        .unwrap()
}

fn in_days(days: i64) -> String {
    let day = (OffsetDateTime::now_utc() + Duration::days(days)).date();
    format!("{:04}-{:02}-{:02}", day.year(), u8::from(day.month()), day.day())
}

#[tokio::test]
async fn trial_starts_extends_and_reports() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Trial Co", "owner@trial.test").await;
    let professional = h.plan("professional").await.unwrap();
    let subs = &h.billing.subscriptions;

    let sub = subs
        .start_trial(tenant.id, &professional, 14, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Trialing);

    let remote = h.gateway.subscription(&sub.processor_subscription_id).unwrap();
    assert_eq!(remote.status, "trialing");
    assert_eq!(remote.metadata.get("trial").map(String::as_str), Some("true"));
    let trial_end = remote.trial_end.unwrap();
    let expected = OffsetDateTime::now_utc().unix_timestamp() + 14 * DAY;
    assert!((trial_end - expected).abs() < 60);

    let sent = h.sender.wait_for(1).await;
    assert_eq!(sent[0].template, NotificationTemplate::SubscriptionWelcome);

    let status = subs.trial_status(tenant.id, &CancelSignal::never()).await.unwrap();
    assert!(status.is_in_trial);
    assert_eq!(status.days_remaining, 14);

    let extended = subs.extend_trial(tenant.id, 7, &CancelSignal::never()).await.unwrap();
    assert_eq!(extended.days_remaining, 21);
    let new_end = extended.trial_end.unwrap().unix_timestamp();
    assert_eq!(new_end, trial_end + 7 * DAY);

    let local = subs.get_for_tenant(tenant.id).await.unwrap();
    assert_eq!(local.status, SubscriptionStatus::Trialing);
    assert_eq!(local.current_period_end.unix_timestamp(), new_end);

    // Trials carry the plan's features
    h.billing
        .entitlements
        .can_use_feature(tenant.id, "data_export")
        .await
        .unwrap();
}

#[tokio::test]
async fn trials_need_a_paid_plan_and_no_subscription() {
    let h = TestHarness::new().await;
    let subs = &h.billing.subscriptions;

    let tenant = h.add_tenant("Corner Shop", "owner@corner.test").await;
    let starter = h.plan("starter").await.unwrap();
    assert!(matches!(
        subs.start_trial(tenant.id, &starter, 14, &CancelSignal::never()).await,
        Err(BillingError::InvalidInput(_))
    ));

    let professional = h.plan("professional").await.unwrap();
    assert!(matches!(
        subs.start_trial(tenant.id, &professional, 0, &CancelSignal::never()).await,
        Err(BillingError::InvalidInput(_))
    ));
    assert!(matches!(
        subs.start_trial(tenant.id, &professional, 31, &CancelSignal::never()).await,
        Err(BillingError::InvalidInput(_))
    ));
    assert_eq!(h.gateway.calls("create_subscription"), 0);

    let sub = on_plan(&h, "professional").await;
    assert!(matches!(
        subs.start_trial(sub.tenant_id, &professional, 14, &CancelSignal::never()).await,
        Err(BillingError::InvalidState(_))
    ));
    assert!(matches!(
        subs.extend_trial(sub.tenant_id, 7, &CancelSignal::never()).await,
        Err(BillingError::InvalidState(_))
    ));

    let status = subs.trial_status(sub.tenant_id, &CancelSignal::never()).await.unwrap();
    assert!(!status.is_in_trial);
    assert_eq!(status.days_remaining, 0);
}

#[tokio::test]
async fn paid_trial_invoice_keeps_trial_status() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Trial Co", "owner@trial.test").await;
    let professional = h.plan("professional").await.unwrap();
    let sub = h
        .billing
        .subscriptions
        .start_trial(tenant.id, &professional, 14, &CancelSignal::never())
        .await
        .unwrap();

    let payload = event(
        "evt_trial_invoice",
        "invoice.payment_succeeded",
        json!({
            "id": "in_trial",
            "subscription": sub.processor_subscription_id,
            "amount_paid": 0,
            "currency": "aed",
        }),
    );
    assert_eq!(deliver(&h, &payload).await.unwrap(), WebhookOutcome::Processed);

    let local = h.billing.subscriptions.get_for_tenant(tenant.id).await.unwrap();
    assert_eq!(local.status, SubscriptionStatus::Trialing);

    // The processor ends the trial by reporting the subscription active
    let ended = event(
        "evt_trial_over",
        "customer.subscription.updated",
        json!({ "id": sub.processor_subscription_id, "status": "active" }),
    );
    deliver(&h, &ended).await.unwrap();
    let local = h.billing.subscriptions.get_for_tenant(tenant.id).await.unwrap();
    assert_eq!(local.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn grace_period_only_for_past_due() {
    let h = TestHarness::new().await;
    let sub = on_plan(&h, "professional").await;
    let subs = &h.billing.subscriptions;

    assert!(matches!(
        subs.set_grace_period(sub.tenant_id, 7, &CancelSignal::never()).await,
        Err(BillingError::InvalidState(_))
    ));

    subs.mark_past_due(&sub.processor_subscription_id).await.unwrap();
    let grace = subs
        .set_grace_period(sub.tenant_id, 7, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(grace.days, 7);
    assert_eq!(grace.processor_subscription_id, sub.processor_subscription_id);

    let remote = h.gateway.subscription(&sub.processor_subscription_id).unwrap();
    assert_eq!(remote.metadata.get("grace_period").map(String::as_str), Some("true"));
    assert_eq!(remote.metadata.get("grace_period_days").map(String::as_str), Some("7"));
    assert_eq!(
        remote.metadata.get("grace_period_end"),
        Some(&grace.ends_at.unix_timestamp().to_string())
    );

    // Metadata only, the local row keeps its status
    let local = subs.get_for_tenant(sub.tenant_id).await.unwrap();
    assert_eq!(local.status, SubscriptionStatus::PastDue);

    assert!(matches!(
        subs.set_grace_period(sub.tenant_id, 45, &CancelSignal::never()).await,
        Err(BillingError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn scheduled_change_books_phases_and_plan_follows_processor() {
    let h = TestHarness::new().await;
    let sub = on_plan(&h, "professional").await;
    let enterprise = h.plan("enterprise").await.unwrap();
    let subs = &h.billing.subscriptions;
    let effective = in_days(10);

    let change = subs
        .schedule_change(
            sub.tenant_id,
            &enterprise,
            &effective,
            ProrationMode::None,
            &CancelSignal::never(),
        )
        .await
        .unwrap();
    assert_eq!(change.current_plan, "professional");
    assert_eq!(change.new_plan, "enterprise");
    assert_eq!(change.proration, ProrationMode::None);

    let enterprise = h.plan("enterprise").await.unwrap();
    let enterprise_price = enterprise.processor_price_id.clone().unwrap();
    let professional_price = h
        .plan("professional")
        .await
        .unwrap()
        .processor_price_id
        .unwrap();

    let schedules = h.gateway.schedules();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].id, change.schedule_id);
    let phases = &schedules[0].phases;
    assert_eq!(phases.len(), 2);
    assert_eq!(phases[0].price_id, professional_price);
    assert_eq!(phases[0].end_date, Some(change.effective_at.unix_timestamp()));
    assert_eq!(phases[1].price_id, enterprise_price);
    assert_eq!(phases[1].start_date, change.effective_at.unix_timestamp());
    assert_eq!(phases[1].end_date, None);

    // Nothing changes locally until the processor switches the price
    let local = subs.get_for_tenant(sub.tenant_id).await.unwrap();
    assert_eq!(local.plan_id, sub.plan_id);

    let switched = event(
        "evt_schedule_switch",
        "customer.subscription.updated",
        json!({
            "id": sub.processor_subscription_id,
            "status": "active",
            "items": { "data": [{ "price": { "id": enterprise_price } }] },
        }),
    );
    deliver(&h, &switched).await.unwrap();
    let local = subs.get_for_tenant(sub.tenant_id).await.unwrap();
    assert_eq!(local.plan_id, enterprise.id);
    assert_eq!(local.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn scheduled_change_rejects_past_dates_and_same_plan() {
    let h = TestHarness::new().await;
    let sub = on_plan(&h, "professional").await;
    let subs = &h.billing.subscriptions;
    let professional = h.plan("professional").await.unwrap();
    let enterprise = h.plan("enterprise").await.unwrap();

    assert!(matches!(
        subs.schedule_change(
            sub.tenant_id,
            &enterprise,
            &in_days(-1),
            ProrationMode::CreateProrations,
            &CancelSignal::never(),
        )
        .await,
        Err(BillingError::InvalidInput(_))
    ));
    assert!(matches!(
        subs.schedule_change(
            sub.tenant_id,
            &enterprise,
            "soon",
            ProrationMode::CreateProrations,
            &CancelSignal::never(),
        )
        .await,
        Err(BillingError::InvalidInput(_))
    ));
    assert!(matches!(
        subs.schedule_change(
            sub.tenant_id,
            &professional,
            &in_days(10),
            ProrationMode::CreateProrations,
            &CancelSignal::never(),
        )
        .await,
        Err(BillingError::InvalidState(_))
    ));
    assert_eq!(h.gateway.calls("create_subscription_schedule"), 0);
}

#[tokio::test]
async fn setup_intent_is_bound_to_tenant_customer() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;

    let intent = h
        .billing
        .customers
        .create_setup_intent(tenant.id, &CancelSignal::never())
        .await
        .unwrap();
    assert!(intent.client_secret.as_deref().unwrap().starts_with(&intent.id));

    let tenant = h.tenants.get(tenant.id).await.unwrap();
    let stored = h.gateway.setup_intent(&intent.id).unwrap();
    assert_eq!(stored.customer_id, tenant.processor_customer_id);
    assert_eq!(h.gateway.customers().len(), 1);
}

#[tokio::test]
async fn one_off_invoice_is_created_and_downloadable_by_owner_only() {
    let h = TestHarness::new().await;
    let tenant = h.add_tenant("Acme", "owner@acme.test").await;
    let invoices = &h.billing.invoices;

    let request = InvoiceRequest {
        description: "Onboarding workshop".to_string(),
        amount: 25_000,
        currency: "AED".to_string(),
        due_date: Some(in_days(14)),
    };
    let invoice = invoices
        .create_invoice(tenant.id, &request, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(invoice.amount_due, 25_000);
    assert_eq!(invoice.currency, "aed");
    assert_eq!(invoice.status, Some(InvoiceStatus::Draft));

    let items = h.gateway.invoice_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].invoice_id.as_deref(), Some(invoice.id.as_str()));
    assert_eq!(items[0].amount, 25_000);

    let download = invoices
        .download_url(tenant.id, &invoice.id, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(download.url, format!("https://invoice.test/{}/pdf", invoice.id));

    let stranger = h.add_tenant("Other", "owner@other.test").await;
    assert!(matches!(
        invoices.download_url(stranger.id, &invoice.id, &CancelSignal::never()).await,
        Err(BillingError::InvoiceNotFound(_))
    ));

    let bad = InvoiceRequest {
        amount: -5,
        ..request
    };
    assert!(matches!(
        invoices.create_invoice(tenant.id, &bad, &CancelSignal::never()).await,
        Err(BillingError::InvalidInput(_))
    ));
    assert_eq!(h.gateway.calls("create_invoice"), 1);
}

#[tokio::test]
async fn usage_reads_report_plan_limits() {
    let h = TestHarness::new().await;
    let sub = on_plan(&h, "starter").await;
    h.usage.set(1, 1, 24);
    let entitlements = &h.billing.entitlements;

    let usage = entitlements.subscription_usage(sub.tenant_id).await.unwrap();
    assert_eq!(usage.len(), 3);
    let orders = usage.iter().find(|q| q.kind == "orders_per_month").unwrap();
    assert_eq!((orders.used, orders.limit), (24, 25));

    let members = entitlements.usage_quota(sub.tenant_id, "team_members").await.unwrap();
    assert_eq!((members.used, members.limit), (1, 1));

    assert!(matches!(
        entitlements.usage_quota(sub.tenant_id, "warehouses").await,
        Err(BillingError::InvalidInput(_))
    ));
}
