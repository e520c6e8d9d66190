macro_rules! cfg_std {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "std")]
            $item
        )*
    };
}

cfg_std! {
    pub mod audit;
    pub mod commence_saga;
    mod connect;
    mod delivery;
    pub mod emitter;
    mod event_consumer;
    mod names;
    mod publish;
    mod retry;
    pub mod saga;
    pub mod session;
    mod topology;
}

#[cfg(feature = "events")]
pub mod events;

cfg_std! {
    pub use audit::publish_audit_event;
    pub use commence_saga::commence_saga;
    pub use connect::{AuditEmitter, EventEmitter, SagaEmitter};
    pub use event_consumer::{AuditHandler, EventHandler};
    pub use names::{Exchange, Queue};
    pub use publish::publish_event;
    pub use retry::{MAX_NACK_RETRIES, MAX_OCCURRENCE, NACKING_DELAY_MS};
    pub use session::{Config, HealthCheckError, SagaError, Session};
}

#[cfg(test)]
mod test;
