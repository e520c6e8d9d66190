use crate::emitter::Emitter;
use crate::event_consumer::{AuditHandler, EventHandler};
use crate::events::Event;
use crate::names::{Exchange, Queue, QueueConsumerProps};
use crate::saga::{CommandHandler, StepCommand};
use crate::session::{SagaError, Session};
use tracing::{error, info};

pub type EventEmitter = Emitter<EventHandler, Event>;
pub type SagaEmitter = Emitter<CommandHandler, StepCommand>;
pub type AuditEmitter = Emitter<AuditHandler, Event>;

impl Session {
    /// Declares the event topology (plus the audit resources every event
    /// consumer feeds) and starts consuming. Returns the handler registry.
    pub async fn connect_to_events(&self) -> Result<EventEmitter, SagaError> {
        let queue_name = self.events_queue.clone();
        self.create_header_consumers(&queue_name, self.events).await?;
        self.create_audit_resources().await?;

        info!(
            "Microservice {:?} listening events {:?}",
            self.microservice, self.events
        );

        Ok(self.start_consuming_events().await)
    }

    pub(crate) async fn start_consuming_events(&self) -> EventEmitter {
        let mut guard = self.event_registry.lock().await;
        let registry = guard.get_or_insert_with(Emitter::new).clone();

        tokio::spawn({
            let session = self.clone();
            let queue_name = self.events_queue.clone();
            let registry = registry.clone();

            async move {
                if let Err(e) = session.consume_events(&queue_name, registry).await {
                    error!("Error consuming events: {:?}", e);
                }
            }
        });

        registry
    }

    /// Declares the saga-command wiring and starts consuming step commands.
    pub async fn connect_to_saga_commands(&self) -> Result<SagaEmitter, SagaError> {
        self.create_saga_consumers(vec![QueueConsumerProps {
            queue_name: self.saga_queue.clone(),
            exchange: Exchange::COMMANDS,
        }])
        .await?;

        Ok(self.start_consuming_saga_commands().await)
    }

    pub(crate) async fn start_consuming_saga_commands(&self) -> SagaEmitter {
        let mut guard = self.saga_registry.lock().await;
        let registry = guard.get_or_insert_with(Emitter::new).clone();

        tokio::spawn({
            let session = self.clone();
            let queue_name = self.saga_queue.clone();
            let registry = registry.clone();

            async move {
                if let Err(e) = session.consume_saga_steps(&queue_name, registry).await {
                    error!("Error consuming saga steps: {:?}", e);
                }
            }
        });

        registry
    }

    /// For the audit microservice only: consumes the four lifecycle queues.
    pub async fn connect_to_audit(&self) -> Result<AuditEmitter, SagaError> {
        self.create_audit_resources().await?;
        self.set_health_check_queue(Queue::AUDIT_PUBLISHED_COMMANDS);

        Ok(self.start_consuming_audit().await)
    }

    pub(crate) async fn start_consuming_audit(&self) -> AuditEmitter {
        let mut guard = self.audit_registry.lock().await;
        let registry = guard.get_or_insert_with(Emitter::new).clone();

        for queue_name in [
            Queue::AUDIT_PUBLISHED_COMMANDS,
            Queue::AUDIT_RECEIVED_COMMANDS,
            Queue::AUDIT_PROCESSED_COMMANDS,
            Queue::AUDIT_DEAD_LETTER_COMMANDS,
        ] {
            tokio::spawn({
                let session = self.clone();
                let registry = registry.clone();

                async move {
                    if let Err(e) = session.consume_audit_queue(queue_name, registry).await {
                        error!("Error consuming audit queue {queue_name}: {:?}", e);
                    }
                }
            });
        }

        registry
    }
}
