use crate::audit::{publish_audit_event, unix_ms, AuditPublishedRecord};
use crate::events::EventPayload;
use crate::names::Exchange;
use crate::session::{self, SagaError, Session};
use crate::topology::{durable_exchange, durable_queue};
use lapin::options::BasicPublishOptions;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

/// Deadline for every publish the library issues.
pub(crate) const PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

// One send channel per process, shared by the publisher, the saga reply, the
// initiator and the audit pipeline. The mutex serializes writers.
static SEND_CHANNEL: OnceCell<Arc<Mutex<Channel>>> = OnceCell::new();

/// Send channel, (re)opened from the stored uri whenever the cached one or
/// its connection is found dead. Survives broker restarts.
pub(crate) async fn send_channel() -> Result<Arc<Mutex<Channel>>, SagaError> {
    let rabbit_uri = session::stored_uri()?;
    let connection = Session::connection(rabbit_uri).await?.read().await;

    match SEND_CHANNEL.get() {
        Some(cell) => {
            let mut channel = cell.lock().await;
            if !channel.status().connected() {
                *channel = connection.create_channel().await?;
            }
            Ok(cell.clone())
        }
        None => {
            let channel = connection.create_channel().await?;
            // First set wins; the cell is guaranteed populated below.
            SEND_CHANNEL.set(Arc::new(Mutex::new(channel))).unwrap_or(());
            Ok(SEND_CHANNEL.get().unwrap().clone())
        }
    }
}

pub(crate) async fn close_send_channel() {
    if let Some(cell) = SEND_CHANNEL.get() {
        let channel = cell.lock().await;
        if channel.status().connected() {
            if let Err(e) = channel.close(0, "shutdown").await {
                warn!("Error closing send channel: {:?}", e);
            }
        }
    }
}

/// Publishes `payload` to every microservice subscribed to its event.
///
/// The message enters through the matching exchange with the
/// `all-micro`/event headers, tagged with a fresh UUIDv7 event id
/// (`message_id`) and the publisher identity (`app_id`). One
/// `audit.published` record is emitted from a detached task.
pub async fn publish_event<T: EventPayload + Serialize>(payload: T) -> Result<(), SagaError> {
    let cell = send_channel().await?;
    let channel = cell.lock().await;

    let event = payload.event();
    let event_id = Uuid::now_v7().to_string();
    let publisher = session::stored_microservice()?;

    let mut headers = FieldTable::default();
    headers.insert(
        event.as_ref().to_uppercase().into(),
        AMQPValue::LongString(event.as_ref().into()),
    );
    headers.insert("all-micro".into(), AMQPValue::LongString("yes".into()));

    channel
        .exchange_declare(
            Exchange::MATCHING,
            ExchangeKind::Headers,
            durable_exchange(),
            FieldTable::default(),
        )
        .await?;

    let body = serde_json::to_vec(&payload)?;

    tokio::time::timeout(
        PUBLISH_DEADLINE,
        channel.basic_publish(
            Exchange::MATCHING,
            "",
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default()
                .with_headers(headers)
                .with_content_type("application/json".into())
                .with_message_id(event_id.clone().into())
                .with_app_id(publisher.clone().into())
                .with_delivery_mode(2), // persistent
        ),
    )
    .await
    .map_err(|_| SagaError::PublishTimeout)??;

    let record = AuditPublishedRecord {
        publisher_microservice: publisher,
        published_event: event.as_ref().to_string(),
        published_at: unix_ms(),
        event_id,
    };
    tokio::spawn(async move {
        if let Err(e) = publish_audit_event(record).await {
            error!("Failed to emit audit.published record: {:?}", e);
        }
    });

    Ok(())
}

/// Publishes `payload` straight to `queue_name` through the default exchange,
/// declaring the queue first as a safety net. Used for the saga reply and the
/// commence queue, both owned by the orchestrator.
pub(crate) async fn send_to_queue<T: Serialize>(
    queue_name: &str,
    payload: &T,
) -> Result<(), SagaError> {
    let cell = send_channel().await?;
    let channel = cell.lock().await;

    channel
        .queue_declare(queue_name, durable_queue(), FieldTable::default())
        .await?;

    let body = serde_json::to_vec(payload)?;

    tokio::time::timeout(
        PUBLISH_DEADLINE,
        channel.basic_publish(
            "",
            queue_name,
            BasicPublishOptions::default(),
            &body,
            BasicProperties::default()
                .with_delivery_mode(2) // persistent
                .with_content_type("application/json".into()),
        ),
    )
    .await
    .map_err(|_| SagaError::PublishTimeout)??;

    Ok(())
}
