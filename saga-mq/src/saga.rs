use crate::connect::SagaEmitter;
use crate::delivery::DeliveryInfo;
use crate::events::Microservice;
use crate::names::Queue;
use crate::publish;
use crate::retry::Retrier;
use crate::session::{SagaError, Session};
use futures_lite::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use tracing::{error, warn};

/// Step names a saga graph can dispatch to a microservice.
#[derive(
    Debug, Clone, PartialEq, Eq, EnumString, AsRefStr, EnumIter, Serialize, Deserialize, Hash,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepCommand {
    // auth
    CreateUser,

    // test-image
    CreateImage,
    UpdateToken,

    // test-mint
    MintImage,

    // payments
    #[strum(serialize = "resource_purchased:deduct_coins")]
    #[serde(rename = "resource_purchased:deduct_coins")]
    ResourcePurchasedDeductCoins,
    NotifyClient,

    // room-inventory
    #[strum(serialize = "resource_purchased:save_purchased_resource")]
    #[serde(rename = "resource_purchased:save_purchased_resource")]
    ResourcePurchasedSavePurchasedResource,

    // social
    #[strum(serialize = "update_user:image")]
    #[serde(rename = "update_user:image")]
    UpdateUserImage,
    CreateSocialUser,

    // storage
    UploadFile,
}

#[derive(
    Debug, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, AsRefStr, EnumIter, Clone,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub(crate) enum Status {
    Success,
    Failure,
    Sent,
    Pending,
}

/// The on-wire envelope for step dispatch and reply.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SagaStep {
    pub microservice: Microservice,
    pub command: StepCommand,
    pub status: Status,
    pub saga_id: i32,
    pub payload: HashMap<String, Value>,
    pub previous_payload: HashMap<String, Value>,
    pub is_current_step: bool,
}

/// Reply payload: metadata entries (`__` keys) from the previous payload are
/// carried over, then the handler's output is overlaid.
pub(crate) fn merge_step_payload(
    previous: &HashMap<String, Value>,
    next: serde_json::Map<String, Value>,
) -> HashMap<String, Value> {
    let mut merged: HashMap<String, Value> = previous
        .iter()
        .filter(|(key, _)| key.len() > 2 && key.starts_with("__"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    merged.extend(next);
    merged
}

/// Handed to the step handler: the previous step's payload plus the reply and
/// retry surface.
#[derive(Clone)]
pub struct CommandHandler {
    channel: SagaConsumeChannel,
    payload: HashMap<String, Value>,
    saga_id: i32,
}

impl CommandHandler {
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

    pub fn saga_id(&self) -> i32 {
        self.saga_id
    }

    /// Marks the step successful and replies to the orchestrator with
    /// `payload_for_next_step` (must be a JSON object), then acks.
    pub async fn ack(&self, payload_for_next_step: Value) -> Result<(), SagaError> {
        self.channel.ack(payload_for_next_step).await
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

#[derive(Clone)]
struct SagaConsumeChannel {
    channel: Channel,
    delivery: DeliveryInfo,
    step: SagaStep,
    retrier: Retrier,
}

impl SagaConsumeChannel {
    fn new(channel: Channel, delivery: DeliveryInfo, queue_name: String, step: SagaStep) -> Self {
        let retrier = Retrier::new(channel.clone(), delivery.clone(), queue_name);
        Self {
            channel,
            delivery,
            step,
            retrier,
        }
    }

    async fn ack(&self, payload_for_next_step: Value) -> Result<(), SagaError> {
        let Value::Object(next) = payload_for_next_step else {
            return Err(SagaError::InvalidPayload("expected a JSON object".to_string()));
        };

        let mut step = self.step.clone();
        step.status = Status::Success;
        step.payload = merge_step_payload(&step.previous_payload, next);

        publish::send_to_queue(Queue::REPLY_TO_SAGA, &step).await?;

        // The reply is out; a failed ack only means a redelivery the
        // orchestrator dedupes by step id.
        if let Err(e) = self
            .channel
            .basic_ack(self.delivery.delivery_tag, BasicAckOptions::default())
            .await
        {
            warn!("Step replied but ack failed, expecting a redelivery: {:?}", e);
        }
        Ok(())
    }
}

impl Session {
    pub(crate) async fn consume_saga_steps(
        &self,
        queue_name: &str,
        registry: SagaEmitter,
    ) -> Result<(), SagaError> {
        let channel = self.saga_channel().await?;

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
                        .handle_saga_step(&delivery, &registry, queue_name, &channel)
                        .await
                    {
                        error!("Error handling saga step: {:?}", e);
                        let _ = delivery.nack(BasicNackOptions::default()).await;
                    }
                }
                Err(e) => {
                    error!("Error receiving saga step: {:?}", e);
                }
            }
        }
        Ok(())
    }

    async fn handle_saga_step(
        &self,
        delivery: &lapin::message::Delivery,
        registry: &SagaEmitter,
        queue_name: &str,
        channel: &Channel,
    ) -> Result<(), SagaError> {
        let step: SagaStep = serde_json::from_slice(&delivery.data)?;
        let delivery = DeliveryInfo::new(delivery);

        let command = step.command.clone();
        let saga_id = step.saga_id;
        let previous_payload = step.previous_payload.clone();

        let response_channel =
            SagaConsumeChannel::new(channel.clone(), delivery, queue_name.to_string(), step);

        registry
            .emit(
                command,
                CommandHandler {
                    channel: response_channel,
                    payload: previous_payload,
                    saga_id,
                },
            )
            .await;
        Ok(())
    }
}
