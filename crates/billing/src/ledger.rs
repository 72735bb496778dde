//! Processed-event ledger used to deduplicate webhook deliveries

use serde::{Deserialize, Serialize};
use subsync_shared::{Entity, FieldValue};
use time::OffsetDateTime;
use uuid::Uuid;

/// Append-only record of a webhook event that was fully handled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

impl ProcessedEvent {
    pub fn new(event_id: &str, event_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            processed_at: OffsetDateTime::now_utc(),
        }
    }
}

impl Entity for ProcessedEvent {
    const NAME: &'static str = "processed_event";

    fn id(&self) -> Uuid {
        self.id
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "id" => Some(self.id.into()),
            "event_id" => Some(self.event_id.clone().into()),
            "event_type" => Some(self.event_type.clone().into()),
            _ => None,
        }
    }

    fn unique_fields() -> &'static [&'static str] {
        &["event_id"]
    }
}
