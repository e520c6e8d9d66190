use crate::connect::{AuditEmitter, EventEmitter, SagaEmitter};
use crate::events::{Event, Microservice};
use crate::names::{Exchange, QueueConsumerProps};
use crate::publish;
use backoff::{Error as BackoffError, ExponentialBackoff};
use lapin::options::{BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{Channel, Connection};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SagaError {
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid AMQP uri: {0}")]
    InvalidUri(String),
    #[error("Backoff error: {0}")]
    Backoff(String),
    #[error("Publish timed out")]
    PublishTimeout,
    #[error("Invalid header: no known event found")]
    InvalidHeader,
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0} is not set, configure a session first")]
    NotConfigured(&'static str),
}

#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("Unhealthy {0}")]
    Unhealthy(String),
    #[error("Health check timed out after {0} milliseconds")]
    Timeout(u128),
}

impl From<SagaError> for HealthCheckError {
    fn from(err: SagaError) -> Self {
        HealthCheckError::Unhealthy(err.to_string())
    }
}

// RwLock because status reads vastly outnumber reconnection writes.
static CONNECTION: OnceCell<RwLock<Connection>> = OnceCell::new();

pub(crate) static RABBIT_URI: StdRwLock<Option<String>> = StdRwLock::new(None);

// Identity snapshot read by the publisher on every publish_event call.
pub(crate) static MICROSERVICE: StdRwLock<Option<String>> = StdRwLock::new(None);

pub(crate) fn stored_microservice() -> Result<String, SagaError> {
    MICROSERVICE
        .read()
        .unwrap()
        .clone()
        .ok_or(SagaError::NotConfigured("microservice"))
}

pub(crate) fn stored_uri() -> Result<String, SagaError> {
    RABBIT_URI
        .read()
        .unwrap()
        .clone()
        .ok_or(SagaError::NotConfigured("rabbit_uri"))
}

/// Options for building a [`Session`].
pub struct Config {
    pub rabbit_uri: String,
    pub microservice: Microservice,
    pub events: Option<&'static [Event]>,
}

impl Config {
    /// Validates the options, dials the broker and opens the send channel.
    ///
    /// The uri must parse as an AMQP url; the microservice identity is closed
    /// over the [`Microservice`] enumeration by construction.
    pub async fn connect(self) -> Result<Session, SagaError> {
        self.rabbit_uri
            .parse::<AMQPUri>()
            .map_err(SagaError::InvalidUri)?;

        *RABBIT_URI.write().unwrap() = Some(self.rabbit_uri.clone());
        *MICROSERVICE.write().unwrap() = Some(self.microservice.as_ref().to_string());

        let connected = Arc::new(AtomicBool::new(false));
        {
            let connection = Session::connection(self.rabbit_uri.clone()).await?.read().await;
            connected.store(true, Ordering::SeqCst);
            let flag = connected.clone();
            connection.on_error(move |e| {
                warn!("Broker connection dropped: {:?}", e);
                flag.store(false, Ordering::SeqCst);
            });
        }

        // Open the send channel now so the first publish does not pay for it.
        publish::send_channel().await?;

        let micro = self.microservice.as_ref();
        Ok(Session {
            events_queue: format!("{micro}_match_commands"),
            saga_queue: format!("{micro}_saga_commands"),
            microservice: self.microservice,
            events: self.events.unwrap_or(&[]),
            rabbit_uri: self.rabbit_uri,
            events_channel: Arc::new(Mutex::new(None)),
            saga_channel: Arc::new(Mutex::new(None)),
            health_check_queue: Arc::new(StdRwLock::new(None)),
            connected,
            event_registry: Arc::new(Mutex::new(None)),
            saga_registry: Arc::new(Mutex::new(None)),
            audit_registry: Arc::new(Mutex::new(None)),
            reconnecting: Arc::new(Mutex::new(false)),
        })
    }
}

/// A microservice's runtime session: identity, subscriptions, the per-concern
/// consume channels and the health/shutdown surface.
#[derive(Clone, Debug)]
pub struct Session {
    pub(crate) microservice: Microservice,
    pub(crate) events: &'static [Event],
    pub(crate) events_queue: String,
    pub(crate) saga_queue: String,
    rabbit_uri: String,
    pub(crate) events_channel: Arc<Mutex<Option<Channel>>>,
    pub(crate) saga_channel: Arc<Mutex<Option<Channel>>>,
    health_check_queue: Arc<StdRwLock<Option<String>>>,
    connected: Arc<AtomicBool>,
    pub(crate) event_registry: Arc<Mutex<Option<EventEmitter>>>,
    pub(crate) saga_registry: Arc<Mutex<Option<SagaEmitter>>>,
    pub(crate) audit_registry: Arc<Mutex<Option<AuditEmitter>>>,
    reconnecting: Arc<Mutex<bool>>,
}

impl Session {
    /// Process-wide connection handle, dialed lazily and refreshed when found
    /// disconnected.
    pub(crate) async fn connection(
        rabbit_uri: String,
    ) -> Result<&'static RwLock<Connection>, SagaError> {
        match CONNECTION.get() {
            None => {
                let connection = Self::dial(rabbit_uri.as_str()).await?;
                // First set wins; losers find the cell populated below.
                CONNECTION.set(RwLock::new(connection)).unwrap_or(());
                Ok(CONNECTION.get().unwrap())
            }
            Some(connection) => {
                let read_conn = connection.read().await;
                if !read_conn.status().connected() {
                    drop(read_conn);
                    let mut write_conn = connection.write().await;
                    if !write_conn.status().connected() {
                        *write_conn = Self::dial(rabbit_uri.as_str()).await?;
                    }
                }
                Ok(connection)
            }
        }
    }

    pub(crate) async fn current_connection(&self) -> Result<&'static RwLock<Connection>, SagaError> {
        Self::connection(self.rabbit_uri.clone()).await
    }

    async fn dial(addr: &str) -> Result<Connection, SagaError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        backoff::future::retry(backoff, || async {
            info!("Attempting to connect to RabbitMQ");
            Connection::connect(addr, Default::default())
                .await
                .map_err(BackoffError::transient)
        })
        .await
        .map_err(|e| SagaError::Backoff(e.to_string()))
    }

    /// Consume channel for events, created with prefetch 1 on first use and
    /// whenever the cached one is found dead.
    pub(crate) async fn events_channel(&self) -> Result<Channel, SagaError> {
        self.consume_channel(&self.events_channel).await
    }

    /// Consume channel for saga steps. Never shared with the events channel,
    /// QoS is per-channel.
    pub(crate) async fn saga_channel(&self) -> Result<Channel, SagaError> {
        self.consume_channel(&self.saga_channel).await
    }

    async fn consume_channel(
        &self,
        slot: &Arc<Mutex<Option<Channel>>>,
    ) -> Result<Channel, SagaError> {
        let mut guard = slot.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        let connection = self.current_connection().await?.read().await;
        let channel = connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    pub(crate) fn set_health_check_queue(&self, queue_name: &str) {
        *self.health_check_queue.write().unwrap() = Some(queue_name.to_string());
    }

    /// Checks that the connection is alive and that the queue recorded by the
    /// last topology build still exists (passive declare on a throwaway
    /// channel).
    pub async fn health_check(&self, timeout: Duration) -> Result<(), HealthCheckError> {
        let check = async {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(HealthCheckError::Unhealthy("Connection".to_string()));
            }
            let queue = self
                .health_check_queue
                .read()
                .unwrap()
                .clone()
                .ok_or_else(|| {
                    HealthCheckError::Unhealthy("Health check queue is not set".to_string())
                })?;
            self.probe_queue(&queue).await
        };

        tokio::time::timeout(timeout, check)
            .await
            .map_err(|_| HealthCheckError::Timeout(timeout.as_millis()))?
    }

    async fn probe_queue(&self, queue_name: &str) -> Result<(), HealthCheckError> {
        let connection = self.current_connection().await?.read().await;
        let channel = connection.create_channel().await.map_err(SagaError::from)?;
        let probe = channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        if probe.is_ok() {
            if let Err(e) = channel.close(0, "health check done").await {
                debug!("Error closing health check channel: {:?}", e);
            }
        }
        probe.map_err(SagaError::from)?;
        Ok(())
    }

    /// Like [`Session::health_check`], but a failure kicks off a background
    /// reconnection guarded against concurrent attempts.
    pub async fn health_check_with_reconnection(
        &self,
        timeout: Duration,
    ) -> Result<(), HealthCheckError> {
        let reconnecting = self.reconnecting.lock().await;
        if *reconnecting {
            return Err(HealthCheckError::Unhealthy(
                "Reconnecting the server...".to_string(),
            ));
        }
        drop(reconnecting);
        let hc = self.health_check(timeout).await;
        if hc.is_err() {
            let c_reconnecting = self.reconnecting.clone();
            let session = self.clone();
            tokio::spawn(async move {
                {
                    let mut reconnecting = c_reconnecting.lock().await;
                    *reconnecting = true;
                }
                if let Err(e) = session.reconnect().await {
                    error!("Error reconnecting: {:?}", e);
                    let mut reconnecting = c_reconnecting.lock().await;
                    *reconnecting = false;
                }
            });
        }
        hc
    }

    /// Refreshes the connection, drops the cached channels and rebuilds
    /// topology plus consumers for every emitter that was live.
    pub async fn reconnect(&self) -> Result<(), SagaError> {
        warn!("Attempting to reconnect to RabbitMQ");

        {
            // current_connection redials if the old one is gone
            let connection = self.current_connection().await?.read().await;
            self.connected.store(true, Ordering::SeqCst);
            let flag = self.connected.clone();
            connection.on_error(move |e| {
                warn!("Broker connection dropped: {:?}", e);
                flag.store(false, Ordering::SeqCst);
            });
        }

        *self.events_channel.lock().await = None;
        *self.saga_channel.lock().await = None;

        if self.event_registry.lock().await.is_some() {
            let queue_name = self.events_queue.clone();
            self.create_header_consumers(&queue_name, self.events).await?;
            self.create_audit_resources().await?;
            self.start_consuming_events().await;
            info!("Event consumer resubscribed");
        }
        if self.saga_registry.lock().await.is_some() {
            self.create_saga_consumers(vec![QueueConsumerProps {
                queue_name: self.saga_queue.clone(),
                exchange: Exchange::COMMANDS,
            }])
            .await?;
            self.start_consuming_saga_commands().await;
            info!("Saga consumer resubscribed");
        }
        if self.audit_registry.lock().await.is_some() {
            self.create_audit_resources().await?;
            self.start_consuming_audit().await;
            info!("Audit consumers resubscribed");
        }

        let mut reconnecting = self.reconnecting.lock().await;
        *reconnecting = false;
        info!("Successfully reconnected to RabbitMQ");
        Ok(())
    }

    /// Closes each live channel in order (events, saga, send), then the
    /// connection. Close errors are logged, not propagated.
    pub async fn shutdown(&self) {
        debug!("Shutting down saga session");
        if let Some(channel) = self.events_channel.lock().await.take() {
            if let Err(e) = channel.close(0, "shutdown").await {
                warn!("Error closing events channel: {:?}", e);
            }
        }
        if let Some(channel) = self.saga_channel.lock().await.take() {
            if let Err(e) = channel.close(0, "shutdown").await {
                warn!("Error closing saga channel: {:?}", e);
            }
        }
        publish::close_send_channel().await;
        if let Some(lock) = CONNECTION.get() {
            let connection = lock.read().await;
            if connection.status().connected() {
                if let Err(e) = connection.close(0, "shutdown").await {
                    warn!("Error closing connection: {:?}", e);
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        debug!("Saga session shut down");
    }
}
