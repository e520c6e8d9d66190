/// Well-known queue names shared across the saga platform.
pub struct Queue;

impl Queue {
    /// Global queue the orchestrator consumes step replies from.
    pub const REPLY_TO_SAGA: &'static str = "reply_to_saga";
    /// Global queue the orchestrator consumes saga kick-offs from.
    pub const COMMENCE_SAGA: &'static str = "commence_saga";
    /// Queue for audit.published records.
    pub const AUDIT_PUBLISHED_COMMANDS: &'static str = "audit_published_commands";
    /// Queue for audit.received records.
    pub const AUDIT_RECEIVED_COMMANDS: &'static str = "audit_received_commands";
    /// Queue for audit.processed records.
    pub const AUDIT_PROCESSED_COMMANDS: &'static str = "audit_processed_commands";
    /// Queue for audit.dead_letter records.
    pub const AUDIT_DEAD_LETTER_COMMANDS: &'static str = "audit_dead_letter_commands";
}

/// Well-known exchange names.
pub struct Exchange;

impl Exchange {
    /// Direct exchange that fans saga step commands out to each microservice queue.
    pub const COMMANDS: &'static str = "commands_exchange";
    /// Direct exchange whose queues hold nacked saga steps until their TTL expires.
    pub const REQUEUE: &'static str = "requeue_exchange";
    /// Headers exchange every event publish enters through.
    pub const MATCHING: &'static str = "matching_exchange";
    /// Headers exchange the retry engine republishes nacked events through.
    pub const MATCHING_REQUEUE: &'static str = "matching_requeue_exchange";
    /// Direct exchange for the audit trail.
    pub const AUDIT: &'static str = "audit_exchange";
}

pub type ExchangeName = &'static str;

/// A queue to consume plus the exchange that feeds it.
pub struct QueueConsumerProps {
    pub queue_name: String,
    pub exchange: ExchangeName,
}
