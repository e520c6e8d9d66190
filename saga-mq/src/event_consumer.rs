use crate::audit::{
    publish_audit_event, unix_ms, AuditDeadLetterRecord, AuditProcessedRecord, AuditReceivedRecord,
};
use crate::connect::{AuditEmitter, EventEmitter};
use crate::delivery::DeliveryInfo;
use crate::events::Event;
use crate::names::Queue;
use crate::retry::Retrier;
use crate::session::{SagaError, Session};
use futures_lite::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

/// Handed to an event handler: the decoded body plus the ack/nack surface.
/// Every outcome emits its audit record from a detached task.
#[derive(Clone)]
pub struct EventHandler {
    payload: HashMap<String, Value>,
    channel: EventsConsumeChannel,
    microservice: String,
    event_name: String,
    publisher_microservice: String,
    event_id: String,
}

impl EventHandler {
    /// Identity of the micro that published this event (`app_id`).
    pub fn publisher_microservice(&self) -> &str {
        &self.publisher_microservice
    }

    /// UUIDv7 correlating the audit records of this event (`message_id`).
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn parse_payload<T>(&self) -> Result<T, serde_json::Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        let json_value = serde_json::to_value(self.payload.clone())?;
        serde_json::from_value(json_value)
    }

    pub fn payload(&self) -> &HashMap<String, Value> {
        &self.payload
    }

    pub async fn ack(&self) -> Result<(), SagaError> {
        self.channel.ack().await?;

        let record = AuditProcessedRecord {
            publisher_microservice: self.publisher_microservice.clone(),
            processor_microservice: self.microservice.clone(),
            processed_event: self.event_name.clone(),
            processed_at: unix_ms(),
            queue_name: self.channel.queue_name.clone(),
            event_id: self.event_id.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = publish_audit_event(record).await {
                error!("Failed to emit audit.processed record: {:?}", e);
            }
        });

        Ok(())
    }

    pub async fn nack_with_delay(
        &self,
        delay: Duration,
        max_retries: i32,
    ) -> Result<(i32, Duration), SagaError> {
        let result = self.channel.retrier.with_delay(delay, max_retries).await?;
        self.spawn_dead_letter_record("delay", result.0);
        Ok(result)
    }

    pub async fn nack_with_fibonacci_strategy(
        &self,
        max_occurrence: i32,
        max_retries: i32,
    ) -> Result<(i32, Duration, i32), SagaError> {
        let result = self
            .channel
            .retrier
            .with_fibonacci_strategy(max_occurrence, max_retries)
            .await?;
        self.spawn_dead_letter_record("fibonacci_strategy", result.0);
        Ok(result)
    }

    fn spawn_dead_letter_record(&self, reason: &str, retry_count: i32) {
        let record = AuditDeadLetterRecord {
            publisher_microservice: self.publisher_microservice.clone(),
            rejector_microservice: self.microservice.clone(),
            rejected_event: self.event_name.clone(),
            rejected_at: unix_ms(),
            queue_name: self.channel.queue_name.clone(),
            rejection_reason: reason.to_string(),
            retry_count: Some(retry_count as u32),
            event_id: self.event_id.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = publish_audit_event(record).await {
                error!("Failed to emit audit.dead_letter record: {:?}", e);
            }
        });
    }
}

#[derive(Clone)]
struct EventsConsumeChannel {
    channel: Channel,
    delivery: DeliveryInfo,
    queue_name: String,
    retrier: Retrier,
}

impl EventsConsumeChannel {
    fn new(channel: Channel, delivery: DeliveryInfo, queue_name: String) -> Self {
        Self {
            channel: channel.clone(),
            delivery: delivery.clone(),
            queue_name: queue_name.clone(),
            retrier: Retrier::new(channel, delivery, queue_name),
        }
    }

    async fn ack(&self) -> Result<(), SagaError> {
        self.channel
            .basic_ack(self.delivery.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(SagaError::from)
    }
}

/// Known events found in the delivery headers, in header order.
pub(crate) fn find_known_events(headers: &FieldTable) -> Result<Vec<Event>, SagaError> {
    let events: Vec<Event> = headers
        .inner()
        .values()
        .filter_map(|value| match value {
            AMQPValue::LongString(s) => Event::from_str(&s.to_string()).ok(),
            _ => None,
        })
        .collect();

    if events.is_empty() {
        Err(SagaError::InvalidHeader)
    } else {
        Ok(events)
    }
}

impl Session {
    pub(crate) async fn consume_events(
        &self,
        queue_name: &str,
        registry: EventEmitter,
    ) -> Result<(), SagaError> {
        let channel = self.events_channel().await?;

        let mut consumer = channel
            .basic_consume(
                queue_name,
                "", // server-generated tag, re-subscribing never collides
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    if let Err(e) = self
                        .handle_event(&delivery, &registry, queue_name, &channel)
                        .await
                    {
                        error!("Error handling event: {:?}", e);
                        let _ = delivery.nack(BasicNackOptions::default()).await;
                    }
                }
                Err(e) => {
                    error!("Error receiving message: {:?}", e);
                }
            }
        }
        Ok(())
    }

    async fn handle_event(
        &self,
        delivery: &lapin::message::Delivery,
        registry: &EventEmitter,
        queue_name: &str,
        channel: &Channel,
    ) -> Result<(), SagaError> {
        let payload: HashMap<String, Value> = serde_json::from_slice(&delivery.data)?;

        let matches =
            find_known_events(&delivery.properties.headers().clone().unwrap_or_default())?;
        if matches.len() > 1 {
            warn!("More than one known event header, dispatching the first match");
        }
        let event = matches[0];

        let publisher_microservice = delivery
            .properties
            .app_id()
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| {
                warn!("Delivery without app_id, publisher defaults to 'unknown'");
                "unknown".to_string()
            });

        let event_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| {
                warn!("Delivery without message_id, generating a fresh event id");
                Uuid::now_v7().to_string()
            });

        // The defaults must survive a requeue round trip, so they are pinned
        // onto the snapshot the retrier republishes.
        let delivery = DeliveryInfo::new(delivery)
            .with_app_id(publisher_microservice.clone().into())
            .with_message_id(event_id.clone().into());

        let response_channel =
            EventsConsumeChannel::new(channel.clone(), delivery, queue_name.to_string());

        let record = AuditReceivedRecord {
            publisher_microservice: publisher_microservice.clone(),
            receiver_microservice: self.microservice.as_ref().to_string(),
            received_event: event.as_ref().to_string(),
            received_at: unix_ms(),
            queue_name: queue_name.to_string(),
            event_id: event_id.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = publish_audit_event(record).await {
                error!("Failed to emit audit.received record: {:?}", e);
            }
        });

        registry
            .emit(
                event,
                EventHandler {
                    payload,
                    channel: response_channel,
                    microservice: self.microservice.as_ref().to_string(),
                    event_name: event.as_ref().to_string(),
                    publisher_microservice,
                    event_id,
                },
            )
            .await;

        Ok(())
    }

    /// One consumer loop per audit lifecycle queue; the kind is fixed by the
    /// queue, not by headers.
    pub(crate) async fn consume_audit_queue(
        &self,
        queue_name: &'static str,
        registry: AuditEmitter,
    ) -> Result<(), SagaError> {
        let channel = self.events_channel().await?;

        let mut consumer = channel
            .basic_consume(
                queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    if let Err(e) = self
                        .handle_audit_record(&delivery, &registry, queue_name, &channel)
                        .await
                    {
                        error!("Error handling audit record from {queue_name}: {:?}", e);
                        let _ = delivery.nack(BasicNackOptions::default()).await;
                    }
                }
                Err(e) => {
                    error!("Error receiving audit record from {queue_name}: {:?}", e);
                }
            }
        }
        Ok(())
    }

    async fn handle_audit_record(
        &self,
        delivery: &lapin::message::Delivery,
        registry: &AuditEmitter,
        queue_name: &str,
        channel: &Channel,
    ) -> Result<(), SagaError> {
        let payload: HashMap<String, Value> = serde_json::from_slice(&delivery.data)?;

        let event = match queue_name {
            Queue::AUDIT_PUBLISHED_COMMANDS => Event::AuditPublished,
            Queue::AUDIT_RECEIVED_COMMANDS => Event::AuditReceived,
            Queue::AUDIT_PROCESSED_COMMANDS => Event::AuditProcessed,
            Queue::AUDIT_DEAD_LETTER_COMMANDS => Event::AuditDeadLetter,
            _ => return Err(SagaError::InvalidHeader),
        };

        let delivery = DeliveryInfo::new(delivery);
        let response_channel =
            EventsConsumeChannel::new(channel.clone(), delivery, queue_name.to_string());

        registry
            .emit(
                event,
                AuditHandler {
                    payload,
                    channel: response_channel,
                },
            )
            .await;

        Ok(())
    }
}

/// Handler for the audit microservice's own consumption. Acks and nacks here
/// never emit audit records, otherwise the trail would audit itself.
#[derive(Clone)]
pub struct AuditHandler {
    payload: HashMap<String, Value>,
    channel: EventsConsumeChannel,
}

impl AuditHandler {
    pub fn parse_payload<T>(&self) -> Result<T, serde_json::Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        let json_value = serde_json::to_value(self.payload.clone())?;
        serde_json::from_value(json_value)
    }

    pub fn payload(&self) -> &HashMap<String, Value> {
        &self.payload
    }

    pub async fn ack(&self) -> Result<(), SagaError> {
        self.channel.ack().await
    }

    pub async fn nack_with_delay(
        &self,
        delay: Duration,
        max_retries: i32,
    ) -> Result<(i32, Duration), SagaError> {
        self.channel.retrier.with_delay(delay, max_retries).await
    }

    pub async fn nack_with_fibonacci_strategy(
        &self,
        max_occurrence: i32,
        max_retries: i32,
    ) -> Result<(i32, Duration, i32), SagaError> {
        self.channel
            .retrier
            .with_fibonacci_strategy(max_occurrence, max_retries)
            .await
    }
}

#[cfg(test)]
mod test_headers {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn known_events_are_picked_from_the_headers() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("AUTH.DELETED_USER"),
            AMQPValue::LongString("auth.deleted_user".into()),
        );
        headers.insert(
            ShortString::from("all-micro"),
            AMQPValue::LongString("yes".into()),
        );
        headers.insert(
            ShortString::from("SOCIAL.NEW_USER"),
            AMQPValue::LongString("social.new_user".into()),
        );

        let events = find_known_events(&headers).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.contains(&Event::AuthDeletedUser));
        assert!(events.contains(&Event::SocialNewUser));
    }

    #[test]
    fn non_string_headers_are_skipped() {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from("x-retry-count"), AMQPValue::LongInt(3));
        headers.insert(
            ShortString::from("TEST.MINT"),
            AMQPValue::LongString("test.mint".into()),
        );

        let events = find_known_events(&headers).unwrap();
        assert_eq!(events, vec![Event::TestMint]);
    }

    #[test]
    fn unknown_headers_are_a_poison_delivery() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("event1"),
            AMQPValue::LongString("not_an_event".into()),
        );

        let result = find_known_events(&headers);
        assert!(matches!(result.unwrap_err(), SagaError::InvalidHeader));
    }
}

#[cfg(test)]
mod test_audit_consumer {
    use super::*;
    use crate::audit::AuditProcessedRecord;
    use crate::events::Microservice;
    use crate::test::setup::{TestConfig, TestSetup};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[test]
    fn audit_records_reach_the_audit_micro() {
        let setup = TestSetup::new(Some(TestConfig {
            events: &[],
            microservice: Microservice::AuditEda,
        }));

        setup.rt.block_on(async {
            let audit_emitter = setup
                .session
                .connect_to_audit()
                .await
                .expect("Failed to connect to audit");

            let barrier = Arc::new(Barrier::new(2));
            let barrier_clone = barrier.clone();
            let processed_count = Arc::new(AtomicUsize::new(0));
            let count_clone = processed_count.clone();

            audit_emitter
                .on(Event::AuditProcessed, move |handler| {
                    let barrier = barrier.clone();
                    let count = count_clone.clone();
                    async move {
                        let record: AuditProcessedRecord = handler
                            .parse_payload()
                            .expect("Failed to parse audit record");

                        count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

                        assert_eq!(record.processed_event, "auth.new_user");
                        assert_eq!(record.processor_microservice, "auth");

                        // AuditHandler acks never emit recursive audit records
                        handler.ack().await.expect("Failed to ack audit record");

                        barrier.wait().await;
                    }
                })
                .await;

            let record = AuditProcessedRecord {
                publisher_microservice: "social".to_string(),
                processor_microservice: "auth".to_string(),
                processed_event: "auth.new_user".to_string(),
                processed_at: unix_ms(),
                queue_name: "auth_match_commands".to_string(),
                event_id: Uuid::now_v7().to_string(),
            };

            publish_audit_event(record)
                .await
                .expect("Failed to publish audit record");

            barrier_clone.wait().await;

            let final_count = processed_count.load(std::sync::atomic::Ordering::SeqCst);
            assert!(
                final_count >= 1,
                "At least one audit record should have been processed, got: {}",
                final_count
            );
        });
    }
}
