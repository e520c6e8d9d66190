//! The audit trail: one record per event-lifecycle transition, published
//! fire-and-forget to a dedicated direct exchange so the main flow never
//! blocks on it.

use crate::events::{Event, EventPayload};
use crate::names::Exchange;
use crate::publish::{send_channel, PUBLISH_DEADLINE};
use crate::session::SagaError;
use crate::topology::durable_exchange;
use lapin::options::BasicPublishOptions;
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; every audit timestamp uses this.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Emitted once per successful `publish_event`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditPublishedRecord {
    pub publisher_microservice: String,
    pub published_event: String,
    pub published_at: u64,
    pub event_id: String,
}

impl EventPayload for AuditPublishedRecord {
    fn event(&self) -> Event {
        Event::AuditPublished
    }
}

/// Emitted once per delivery, before the handler is dispatched.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditReceivedRecord {
    pub publisher_microservice: String,
    pub receiver_microservice: String,
    pub received_event: String,
    pub received_at: u64,
    pub queue_name: String,
    pub event_id: String,
}

impl EventPayload for AuditReceivedRecord {
    fn event(&self) -> Event {
        Event::AuditReceived
    }
}

/// Emitted once per successful ack.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditProcessedRecord {
    pub publisher_microservice: String,
    pub processor_microservice: String,
    pub processed_event: String,
    pub processed_at: u64,
    pub queue_name: String,
    pub event_id: String,
}

impl EventPayload for AuditProcessedRecord {
    fn event(&self) -> Event {
        Event::AuditProcessed
    }
}

/// Emitted once per nack routed through the retry engine.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditDeadLetterRecord {
    pub publisher_microservice: String,
    pub rejector_microservice: String,
    pub rejected_event: String,
    pub rejected_at: u64,
    pub queue_name: String,
    pub rejection_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    pub event_id: String,
}

impl EventPayload for AuditDeadLetterRecord {
    fn event(&self) -> Event {
        Event::AuditDeadLetter
    }
}

/// Publishes an audit record to the audit exchange, routed by the record's
/// event name. Callers wrap this in a detached task; a failure here must
/// never reach the main flow.
pub async fn publish_audit_event<T: EventPayload + Serialize>(record: T) -> Result<(), SagaError> {
    let cell = send_channel().await?;
    let channel = cell.lock().await;

    channel
        .exchange_declare(
            Exchange::AUDIT,
            ExchangeKind::Direct,
            durable_exchange(),
            FieldTable::default(),
        )
        .await?;

    let routing_key = record.event();
    let body = serde_json::to_vec(&record)?;

    tokio::time::timeout(
        PUBLISH_DEADLINE,
        channel.basic_publish(
            Exchange::AUDIT,
            routing_key.as_ref(),
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2), // persistent
        ),
    )
    .await
    .map_err(|_| SagaError::PublishTimeout)??;

    Ok(())
}

#[cfg(test)]
mod test_audit {
    use super::*;

    // Jan 1 2020 and Jan 1 2030 in milliseconds.
    const YEAR_2020_MS: u64 = 1_577_836_800_000;
    const YEAR_2030_MS: u64 = 1_893_456_000_000;

    #[test]
    fn timestamps_are_millisecond_precision() {
        let now = unix_ms();
        assert!(now > YEAR_2020_MS, "timestamp {now} should be after 2020");
        assert!(now < YEAR_2030_MS, "timestamp {now} should be before 2030");
        assert_eq!(now.to_string().len(), 13, "ms timestamps have 13 digits");
    }

    #[test]
    fn records_carry_ms_timestamps() {
        let record = AuditDeadLetterRecord {
            publisher_microservice: "auth".to_string(),
            rejector_microservice: "social".to_string(),
            rejected_event: "auth.new_user".to_string(),
            rejected_at: unix_ms(),
            queue_name: "social_match_commands".to_string(),
            rejection_reason: "fibonacci_strategy".to_string(),
            retry_count: Some(3),
            event_id: "test-uuid".to_string(),
        };
        assert!(record.rejected_at > YEAR_2020_MS);
        assert!(record.rejected_at < YEAR_2030_MS);
    }

    #[test]
    fn records_serialize_snake_case() {
        let record = AuditProcessedRecord {
            publisher_microservice: "auth".to_string(),
            processor_microservice: "social".to_string(),
            processed_event: "auth.new_user".to_string(),
            processed_at: 1_700_000_000_000,
            queue_name: "social_match_commands".to_string(),
            event_id: "0191f0d1-0000-7000-8000-000000000000".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["processor_microservice"], "social");
        assert_eq!(json["processed_at"], 1_700_000_000_000u64);
        assert_eq!(json["event_id"], "0191f0d1-0000-7000-8000-000000000000");
    }

    #[test]
    fn dead_letter_retry_count_is_omitted_when_absent() {
        let record = AuditDeadLetterRecord {
            publisher_microservice: "auth".to_string(),
            rejector_microservice: "social".to_string(),
            rejected_event: "auth.new_user".to_string(),
            rejected_at: 1_700_000_000_000,
            queue_name: "social_match_commands".to_string(),
            rejection_reason: "delay".to_string(),
            retry_count: None,
            event_id: "id".to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("retry_count").is_none());
        assert_eq!(json["rejection_reason"], "delay");
    }

    #[test]
    fn record_routing_keys_match_the_audit_kinds() {
        let published = AuditPublishedRecord {
            publisher_microservice: "auth".to_string(),
            published_event: "auth.new_user".to_string(),
            published_at: 1_700_000_000_000,
            event_id: "id".to_string(),
        };
        assert_eq!(published.event().as_ref(), "audit.published");

        let received = AuditReceivedRecord {
            publisher_microservice: "auth".to_string(),
            receiver_microservice: "social".to_string(),
            received_event: "auth.new_user".to_string(),
            received_at: 1_700_000_000_000,
            queue_name: "social_match_commands".to_string(),
            event_id: "id".to_string(),
        };
        assert_eq!(received.event().as_ref(), "audit.received");
    }
}
