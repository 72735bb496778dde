//! E-mail delivery for billing notifications
//!
//! Renders each [`NotificationTemplate`] to HTML and sends it through the
//! Resend API.

use async_trait::async_trait;
use serde_json::Value;

use crate::notifications::{NotificationError, NotificationSender, NotificationTemplate};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key; empty disables delivery
    pub resend_api_key: String,
    pub email_from: String,
    pub app_name: String,
    pub support_email: String,
    pub dashboard_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Subsync <billing@subsync.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Subsync".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@subsync.app".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://subsync.app".to_string()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// A rendered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// [`NotificationSender`] backed by Resend
#[derive(Clone)]
pub struct ResendSender {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendSender {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn render(&self, template: NotificationTemplate, data: &Value) -> RenderedEmail {
        let text = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or_default();
        let plan = match text("plan_name") {
            "" => "your plan",
            name => name,
        };
        let amount = format_amount(
            data.get("amount_cents").and_then(Value::as_i64).unwrap_or(0),
            text("currency"),
        );
        let billing_link = format!("{}/settings/billing", self.config.dashboard_url);
        let app = &self.config.app_name;

        let (subject, heading, color, body) = match template {
            NotificationTemplate::SubscriptionWelcome => (
                format!("Welcome to {} - {}", plan, app),
                "Welcome aboard",
                "#6366f1",
                format!("<p>Your subscription to <strong>{}</strong> has been created.</p>", plan),
            ),
            NotificationTemplate::SubscriptionConfirmed => (
                format!("Subscription Confirmed - {}", app),
                "Subscription Confirmed",
                "#16a34a",
                format!(
                    "<p>Your first payment of <strong>{}</strong> was received and <strong>{}</strong> is now active.</p>",
                    amount, plan
                ),
            ),
            NotificationTemplate::PaymentSucceeded => (
                format!("Payment Received: {} - {}", amount, app),
                "Payment Received",
                "#16a34a",
                format!(
                    "<p>Thank you! Your renewal payment of <strong>{}</strong> has been processed.</p>{}",
                    amount,
                    invoice_link(text("invoice_url"))
                ),
            ),
            NotificationTemplate::PaymentFailed => (
                format!("Payment Failed - {}", app),
                "Payment Failed",
                "#dc2626",
                format!(
                    "<p>We weren't able to process the payment of <strong>{}</strong>.</p>\
                     <p>Please update your payment method to avoid any interruption to your service.</p>{}",
                    amount,
                    invoice_link(text("invoice_url"))
                ),
            ),
            NotificationTemplate::TrialEnding => (
                format!("Your Trial Ends Soon - {}", app),
                "Your Trial Ends Soon",
                "#f59e0b",
                "<p>Your trial is ending in a few days. Add a payment method to keep your access.</p>"
                    .to_string(),
            ),
            NotificationTemplate::SubscriptionCanceled => (
                format!("Subscription Cancelled - {}", app),
                "Subscription Cancelled",
                "#6b7280",
                format!(
                    "<p>Your subscription to <strong>{}</strong> has been cancelled. Any unused time is credited back to you.</p>",
                    plan
                ),
            ),
        };

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: {color};">{heading}</h2>
    <p>Hi there,</p>
    {body}
    <p>
        <a href="{billing_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            View Billing
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        Questions? Contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            color = color,
            heading = heading,
            body = body,
            billing_link = billing_link,
            support_email = self.config.support_email,
            app_name = app,
        );

        RenderedEmail { subject, html }
    }
}

#[async_trait]
impl NotificationSender for ResendSender {
    async fn send(
        &self,
        template: NotificationTemplate,
        recipient: &str,
        data: &Value,
    ) -> Result<String, NotificationError> {
        if !self.config.is_enabled() {
            return Err(NotificationError::NotConfigured);
        }

        let email = self.render(template, data);
        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [recipient],
            "subject": email.subject,
            "html": email.html,
        });

        let response = self
            .client
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.config.resend_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;
        Ok(payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

fn invoice_link(url: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    format!(
        r#"<p><a href="{}" style="color: #6366f1;">View Invoice</a></p>"#,
        url
    )
}

/// `5499, "aed"` renders as `AED 54.99`
fn format_amount(cents: i64, currency: &str) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!(
        "{} {}{}.{:02}",
        currency.to_uppercase(),
        sign,
        cents / 100,
        cents % 100
    )
    .trim_start()
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> ResendSender {
        ResendSender::new(EmailConfig {
            resend_api_key: String::new(),
            email_from: "Subsync <billing@example.com>".to_string(),
            app_name: "Subsync".to_string(),
            support_email: "support@example.com".to_string(),
            dashboard_url: "https://app.example.com".to_string(),
        })
    }

    #[test]
    fn amounts_render_in_major_units() {
        assert_eq!(format_amount(5499, "aed"), "AED 54.99");
        assert_eq!(format_amount(5, "usd"), "USD 0.05");
        assert_eq!(format_amount(-1000, "aed"), "AED -10.00");
        assert_eq!(format_amount(100, ""), "1.00");
    }

    #[test]
    fn payment_failed_includes_invoice_link() {
        let email = sender().render(
            NotificationTemplate::PaymentFailed,
            &serde_json::json!({
                "amount_cents": 5499,
                "currency": "aed",
                "invoice_url": "https://pay.example.com/in_1",
            }),
        );
        assert_eq!(email.subject, "Payment Failed - Subsync");
        assert!(email.html.contains("AED 54.99"));
        assert!(email.html.contains("https://pay.example.com/in_1"));
        assert!(email.html.contains("https://app.example.com/settings/billing"));
    }

    #[test]
    fn welcome_names_plan() {
        let email = sender().render(
            NotificationTemplate::SubscriptionWelcome,
            &serde_json::json!({ "plan_name": "Professional Plan" }),
        );
        assert!(email.subject.starts_with("Welcome to Professional Plan"));
    }

    #[tokio::test]
    async fn disabled_sender_reports_not_configured() {
        let result = sender()
            .send(NotificationTemplate::TrialEnding, "a@example.com", &Value::Null)
            .await;
        assert!(matches!(result, Err(NotificationError::NotConfigured)));
    }
}
