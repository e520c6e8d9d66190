use crate::delivery::DeliveryInfo;
use crate::names::Exchange;
use crate::session::SagaError;
use lapin::options::{BasicNackOptions, BasicPublishOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Default delay callers pass to `nack_with_delay`.
pub const NACKING_DELAY_MS: u64 = 5000;
/// Default retry cap for both strategies.
pub const MAX_NACK_RETRIES: i32 = 3;
/// Occurrence cap for the fibonacci strategy. At 19 the next delay is already
/// ~1.2 hours and would reach ~21 hours at 25, so the counter resets here.
pub const MAX_OCCURRENCE: i32 = 19;

pub(crate) fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

/// Occurrence for the next nack: resets once the cap is reached so the delay
/// curve starts over instead of growing unbounded.
pub(crate) fn bump_occurrence(current: i32, max_occurrence: i32) -> i32 {
    if current >= max_occurrence {
        1
    } else {
        current + 1
    }
}

pub(crate) fn header_i32(headers: &FieldTable, key: &str) -> i32 {
    match headers.inner().get(key) {
        Some(AMQPValue::LongInt(n)) => *n,
        Some(AMQPValue::LongLongInt(n)) => *n as i32,
        _ => 0,
    }
}

/// Republishes a nacked delivery through the requeue path with a per-message
/// TTL, so the broker dead-letters it back to the live path after the delay.
#[derive(Clone)]
pub(crate) struct Retrier {
    channel: Channel,
    delivery: DeliveryInfo,
    queue_name: String,
}

impl Retrier {
    pub(crate) fn new(channel: Channel, delivery: DeliveryInfo, queue_name: String) -> Self {
        Self {
            channel,
            delivery,
            queue_name,
        }
    }

    fn next_retry_count(&self) -> i32 {
        header_i32(&self.delivery.headers, "x-retry-count") + 1
    }

    pub(crate) async fn with_delay(
        &self,
        delay: Duration,
        max_retries: i32,
    ) -> Result<(i32, Duration), SagaError> {
        self.channel
            .basic_nack(self.delivery.delivery_tag, BasicNackOptions::default())
            .await?;

        let count = self.next_retry_count();
        if count > max_retries {
            info!(
                "MAX NACK RETRIES REACHED: {} - NACKING {} - COUNT {}",
                max_retries, self.queue_name, count
            );
            return Ok((count, delay));
        }

        let mut headers = self.delivery.headers.clone();
        headers.insert("x-retry-count".into(), AMQPValue::LongInt(count));

        self.republish(delay, headers).await?;
        Ok((count, delay))
    }

    pub(crate) async fn with_fibonacci_strategy(
        &self,
        max_occurrence: i32,
        max_retries: i32,
    ) -> Result<(i32, Duration, i32), SagaError> {
        self.channel
            .basic_nack(self.delivery.delivery_tag, BasicNackOptions::default())
            .await?;

        let count = self.next_retry_count();
        let occurrence = bump_occurrence(
            header_i32(&self.delivery.headers, "x-occurrence"),
            max_occurrence,
        );
        let delay = Duration::from_secs(fibonacci(occurrence as u32));

        if count > max_retries {
            info!(
                "MAX NACK RETRIES REACHED: {} - NACKING {}",
                max_retries, self.queue_name
            );
            return Ok((count, delay, occurrence));
        }

        let mut headers = self.delivery.headers.clone();
        headers.insert("x-retry-count".into(), AMQPValue::LongInt(count));
        headers.insert("x-occurrence".into(), AMQPValue::LongInt(occurrence));

        self.republish(delay, headers).await?;
        Ok((count, delay, occurrence))
    }

    async fn republish(&self, delay: Duration, headers: FieldTable) -> Result<(), SagaError> {
        let (exchange, routing_key, headers) =
            if self.delivery.exchange == ShortString::from(Exchange::MATCHING) {
                // The all-micro header would fan the redelivery out to every
                // subscriber; replace it so only the nacking micro gets it.
                let mut map: BTreeMap<ShortString, AMQPValue> = headers.inner().clone();
                map.remove("all-micro");
                map.insert(
                    "micro".into(),
                    AMQPValue::LongString(self.queue_name.clone().into()),
                );
                (
                    Exchange::MATCHING_REQUEUE,
                    String::new(),
                    FieldTable::from(map),
                )
            } else {
                // A saga step from the commands exchange.
                (
                    Exchange::REQUEUE,
                    format!("{}_routing_key", self.queue_name),
                    headers,
                )
            };

        self.channel
            .basic_publish(
                exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &self.delivery.data,
                BasicProperties::default()
                    .with_expiration(delay.as_millis().to_string().into())
                    .with_headers(headers)
                    .with_app_id(self.delivery.app_id.clone().unwrap_or_default())
                    .with_message_id(self.delivery.message_id.clone().unwrap_or_default())
                    .with_delivery_mode(2), // persistent
            )
            .await?;

        Ok(())
    }
}


/// Integration coverage lives with the event consumer tests: nacked events
/// must come back only to the nacking micro after the configured delay.
#[cfg(test)]
mod test_nack_redelivery {
    use crate::events::{AuthLogoutUserPayload, Event, Microservice, SocialBlockChatPayload};
    use crate::publish::publish_event;
    use crate::test::setup::{TestConfig, TestSetup};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio::time::timeout;

    /// Slow integration test: the fibonacci path waits at least 1s per nack.
    #[test]
    fn nacked_events_are_redelivered_to_the_nacking_micro() {
        let setup = TestSetup::new(Some(TestConfig {
            events: &[Event::AuthLogoutUser, Event::SocialBlockChat],
            microservice: Microservice::Auth,
        }));
        setup.rt.block_on(async {
            let e = setup
                .session
                .connect_to_events()
                .await
                .expect("Failed to connect to events");

            let barrier = Arc::new(Barrier::new(3));
            let logout_deliveries = Arc::new(AtomicUsize::new(0));

            let c_barrier = barrier.clone();
            let c_atomic = logout_deliveries.clone();
            // three delay-nacks, then ack
            e.on(Event::AuthLogoutUser, move |handler| {
                let count = c_atomic.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let barrier = c_barrier.clone();

                async move {
                    if count == 3 {
                        let p: AuthLogoutUserPayload =
                            handler.parse_payload().expect("Failed to parse payload");
                        assert_eq!(p.user_id, "123");
                        handler.ack().await.expect("Failed to ack");
                        barrier.wait().await;
                        return;
                    }
                    handler
                        .nack_with_delay(Duration::from_millis(100), 30)
                        .await
                        .expect("Failed to nack");
                }
            })
            .await;

            let block_deliveries = Arc::new(AtomicUsize::new(0));
            let c_barrier = barrier.clone();
            let c_atomic = block_deliveries.clone();
            // two fibonacci-nacks, then ack
            e.on(Event::SocialBlockChat, move |handler| {
                let count = c_atomic.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let barrier = c_barrier.clone();

                async move {
                    // identity props survive the requeue round-trip
                    assert_eq!(handler.publisher_microservice(), "auth");
                    assert!(uuid::Uuid::parse_str(handler.event_id()).is_ok());

                    if count == 2 {
                        let p: SocialBlockChatPayload =
                            handler.parse_payload().expect("Failed to parse payload");
                        assert_eq!(p.user_to_block_id, "blocked_user_456");
                        handler.ack().await.expect("Failed to ack");
                        barrier.wait().await;
                        return;
                    }
                    handler
                        .nack_with_fibonacci_strategy(10, 30)
                        .await
                        .expect("Failed to nack");
                }
            })
            .await;

            publish_event(AuthLogoutUserPayload {
                user_id: "123".to_string(),
            })
            .await
            .expect("Failed to publish event");
            publish_event(SocialBlockChatPayload {
                user_id: "123".to_string(),
                user_to_block_id: "blocked_user_456".to_string(),
            })
            .await
            .expect("Failed to publish event");

            timeout(Duration::from_secs(10), barrier.wait())
                .await
                .expect("Failed to wait for barrier");
            assert_eq!(
                logout_deliveries.load(std::sync::atomic::Ordering::SeqCst),
                4
            );
            assert_eq!(block_deliveries.load(std::sync::atomic::Ordering::SeqCst), 3);
        });
    }
}
