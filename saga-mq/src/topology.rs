use crate::events::Event;
use crate::names::{Exchange, Queue, QueueConsumerProps};
use crate::session::{SagaError, Session};
use lapin::options::{
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::ExchangeKind;
use strum::IntoEnumIterator;

pub(crate) fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

pub(crate) fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

/// The single header entry every publish and binding of `event` carries:
/// `UPPERCASE(name) -> name`.
fn event_header(event: Event) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        event.as_ref().to_uppercase().into(),
        AMQPValue::LongString(event.as_ref().into()),
    );
    headers
}

impl Session {
    /// Declares the full event graph for this microservice: the matching and
    /// matching-requeue entries, one exchange pair per known event, and the
    /// queue bindings for the subscribed ones. Re-invocation is idempotent;
    /// only the micro's own per-event exchanges are ever deleted, and only on
    /// unsubscribe.
    pub(crate) async fn create_header_consumers(
        &self,
        queue_name: &str,
        events: &[Event],
    ) -> Result<(), SagaError> {
        let channel = self.events_channel().await?;
        let requeue_queue = format!("{queue_name}_matching_requeue");

        channel
            .exchange_declare(
                Exchange::MATCHING,
                ExchangeKind::Headers,
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;
        channel
            .exchange_declare(
                Exchange::MATCHING_REQUEUE,
                ExchangeKind::Headers,
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(queue_name, durable_queue(), FieldTable::default())
            .await?;

        // Expired messages re-enter the live path through the matching exchange.
        let mut requeue_args = FieldTable::default();
        requeue_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(Exchange::MATCHING.into()),
        );
        channel
            .queue_declare(&requeue_queue, durable_queue(), requeue_args)
            .await?;

        for event in Event::iter() {
            let event_name = event.as_ref();
            let header = event_header(event);

            channel
                .exchange_declare(
                    event_name,
                    ExchangeKind::Headers,
                    durable_exchange(),
                    FieldTable::default(),
                )
                .await?;

            let mut fanout_args = header.clone();
            fanout_args.insert("all-micro".into(), AMQPValue::LongString("yes".into()));
            fanout_args.insert("x-match".into(), AMQPValue::LongString("all".into()));
            channel
                .exchange_bind(
                    event_name,
                    Exchange::MATCHING,
                    "",
                    ExchangeBindOptions::default(),
                    fanout_args,
                )
                .await?;

            let requeue_exchange = format!("{event_name}_requeue");
            channel
                .exchange_declare(
                    &requeue_exchange,
                    ExchangeKind::Headers,
                    durable_exchange(),
                    FieldTable::default(),
                )
                .await?;
            channel
                .exchange_bind(
                    &requeue_exchange,
                    Exchange::MATCHING_REQUEUE,
                    "",
                    ExchangeBindOptions::default(),
                    header.clone(),
                )
                .await?;

            // Routing for this micro only: micro=<queue> plus the event header.
            let mut micro_args = header.clone();
            micro_args.insert("micro".into(), AMQPValue::LongString(queue_name.into()));
            micro_args.insert("x-match".into(), AMQPValue::LongString("all".into()));

            let micro_event_exchange = format!("{event_name}_{queue_name}");

            if events.contains(&event) {
                channel
                    .queue_bind(
                        queue_name,
                        event_name,
                        "",
                        QueueBindOptions::default(),
                        header.clone(),
                    )
                    .await?;

                channel
                    .queue_bind(
                        &requeue_queue,
                        &requeue_exchange,
                        "",
                        QueueBindOptions::default(),
                        micro_args.clone(),
                    )
                    .await?;

                channel
                    .exchange_declare(
                        &micro_event_exchange,
                        ExchangeKind::Headers,
                        durable_exchange(),
                        FieldTable::default(),
                    )
                    .await?;
                channel
                    .exchange_bind(
                        &micro_event_exchange,
                        Exchange::MATCHING,
                        "",
                        ExchangeBindOptions::default(),
                        micro_args.clone(),
                    )
                    .await?;
                channel
                    .queue_bind(
                        queue_name,
                        &micro_event_exchange,
                        "",
                        QueueBindOptions::default(),
                        micro_args,
                    )
                    .await?;
            } else {
                channel
                    .queue_unbind(queue_name, event_name, "", header)
                    .await?;
                channel
                    .queue_unbind(&requeue_queue, &requeue_exchange, "", micro_args)
                    .await?;
                channel
                    .exchange_delete(
                        &micro_event_exchange,
                        ExchangeDeleteOptions {
                            if_unused: false,
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        self.set_health_check_queue(queue_name);
        Ok(())
    }

    /// Declares the direct-exchange wiring for saga step commands, including
    /// the TTL requeue queue that dead-letters back into the live path.
    pub(crate) async fn create_saga_consumers(
        &self,
        consumers: Vec<QueueConsumerProps>,
    ) -> Result<(), SagaError> {
        let channel = self.saga_channel().await?;

        for consumer in consumers {
            let queue_name = &consumer.queue_name;
            let exchange = consumer.exchange;
            let requeue_queue = format!("{queue_name}_requeue");
            let routing_key = format!("{queue_name}_routing_key");

            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Direct,
                    durable_exchange(),
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_declare(queue_name, durable_queue(), FieldTable::default())
                .await?;
            channel
                .queue_bind(
                    queue_name,
                    exchange,
                    &routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            channel
                .exchange_declare(
                    Exchange::REQUEUE,
                    ExchangeKind::Direct,
                    durable_exchange(),
                    FieldTable::default(),
                )
                .await?;

            let mut requeue_args = FieldTable::default();
            requeue_args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.into()),
            );
            channel
                .queue_declare(&requeue_queue, durable_queue(), requeue_args)
                .await?;
            channel
                .queue_bind(
                    &requeue_queue,
                    Exchange::REQUEUE,
                    &routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            self.set_health_check_queue(queue_name);
        }

        Ok(())
    }

    /// Declares the audit trail wiring: one direct exchange and one queue per
    /// lifecycle kind, bound by the `audit.*` routing key.
    pub(crate) async fn create_audit_resources(&self) -> Result<(), SagaError> {
        let channel = self.events_channel().await?;

        channel
            .exchange_declare(
                Exchange::AUDIT,
                ExchangeKind::Direct,
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;

        for (queue_name, routing_key) in [
            (Queue::AUDIT_PUBLISHED_COMMANDS, "audit.published"),
            (Queue::AUDIT_RECEIVED_COMMANDS, "audit.received"),
            (Queue::AUDIT_PROCESSED_COMMANDS, "audit.processed"),
            (Queue::AUDIT_DEAD_LETTER_COMMANDS, "audit.dead_letter"),
        ] {
            channel
                .queue_declare(queue_name, durable_queue(), FieldTable::default())
                .await?;
            channel
                .queue_bind(
                    queue_name,
                    Exchange::AUDIT,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test_topology {
    use super::*;
    use crate::test::setup::TestSetup;

    #[test]
    fn create_saga_consumers_declares_the_command_wiring() {
        let setup = TestSetup::new(None);

        let consumers = vec![QueueConsumerProps {
            queue_name: "my_cool_microservice".to_string(),
            exchange: Exchange::COMMANDS,
        }];

        setup.rt.block_on(async {
            let result = setup.session.create_saga_consumers(consumers).await;
            assert!(
                result.is_ok(),
                "Failed to create saga consumers: {:?}",
                result.err()
            );
            let conn = setup
                .session
                .current_connection()
                .await
                .expect("Cannot get the connection")
                .read()
                .await;
            let t = conn.topology();

            let exchanges: Vec<String> = t.exchanges.iter().map(|e| e.name.to_string()).collect();
            for exchange in [Exchange::COMMANDS, Exchange::REQUEUE] {
                assert!(
                    exchanges.contains(&exchange.to_string()),
                    "Exchange {exchange} not found"
                );
            }

            let queues: Vec<String> = t.queues.iter().map(|q| q.name.to_string()).collect();
            for queue in ["my_cool_microservice", "my_cool_microservice_requeue"] {
                assert!(queues.contains(&queue.to_string()), "Queue {queue} not found");
            }
        });
    }

    #[test]
    fn create_header_consumers_tracks_the_subscription_set() {
        let setup = TestSetup::new(None);

        setup.rt.block_on(async {
            let events = vec![Event::TestImage, Event::AuthDeletedUser];

            {
                let result = setup
                    .session
                    .create_header_consumers("my_cool_micro", &events)
                    .await;
                assert!(
                    result.is_ok(),
                    "Failed to create header consumers: {:?}",
                    result.err()
                );

                let conn = setup
                    .session
                    .current_connection()
                    .await
                    .expect("Cannot get the connection")
                    .read()
                    .await;
                let t = conn.topology();

                let exchanges: Vec<String> =
                    t.exchanges.iter().map(|e| e.name.to_string()).collect();
                for exchange in ["auth.deleted_user_my_cool_micro", "test.image_my_cool_micro"] {
                    assert!(
                        exchanges.contains(&exchange.to_string()),
                        "Exchange {exchange} not found"
                    );
                }

                let queues: Vec<String> = t.queues.iter().map(|q| q.name.to_string()).collect();
                for queue in ["my_cool_micro", "my_cool_micro_matching_requeue"] {
                    assert!(queues.contains(&queue.to_string()), "Queue {queue} not found");
                }
            }

            // Rebuild with AuthDeletedUser dropped: its per-micro exchange goes away.
            let events = vec![Event::TestImage];

            {
                let result = setup
                    .session
                    .create_header_consumers("my_cool_micro", &events)
                    .await;
                assert!(
                    result.is_ok(),
                    "Failed to create header consumers: {:?}",
                    result.err()
                );

                let conn = setup
                    .session
                    .current_connection()
                    .await
                    .expect("Cannot get the connection")
                    .read()
                    .await;
                let t = conn.topology();

                let exchanges: Vec<String> =
                    t.exchanges.iter().map(|e| e.name.to_string()).collect();
                assert!(
                    !exchanges.contains(&"auth.deleted_user_my_cool_micro".to_string()),
                    "Exchange auth.deleted_user_my_cool_micro should have been deleted"
                );
                assert!(
                    exchanges.contains(&"test.image_my_cool_micro".to_string()),
                    "Exchange test.image_my_cool_micro not found"
                );
            }
        });
    }

    #[test]
    fn create_audit_resources_binds_one_queue_per_kind() {
        let setup = TestSetup::new(None);

        setup.rt.block_on(async {
            let result = setup.session.create_audit_resources().await;
            assert!(
                result.is_ok(),
                "Failed to create audit resources: {:?}",
                result.err()
            );

            let conn = setup
                .session
                .current_connection()
                .await
                .expect("Cannot get the connection")
                .read()
                .await;
            let t = conn.topology();

            let queues: Vec<String> = t.queues.iter().map(|q| q.name.to_string()).collect();
            for queue in [
                Queue::AUDIT_PUBLISHED_COMMANDS,
                Queue::AUDIT_RECEIVED_COMMANDS,
                Queue::AUDIT_PROCESSED_COMMANDS,
                Queue::AUDIT_DEAD_LETTER_COMMANDS,
            ] {
                assert!(queues.contains(&queue.to_string()), "Queue {queue} not found");
            }

            let exchanges: Vec<String> = t.exchanges.iter().map(|e| e.name.to_string()).collect();
            assert!(exchanges.contains(&Exchange::AUDIT.to_string()));
        });
    }
}
