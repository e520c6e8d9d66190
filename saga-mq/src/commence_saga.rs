use crate::names::Queue;
use crate::publish;
use crate::session::SagaError;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumIter, EnumString};

/// Saga graphs the orchestrator knows how to materialize. The taxonomy is
/// open on the orchestrator side; initiators only pick a title.
#[derive(
    Debug, Clone, Copy, AsRefStr, EnumString, PartialEq, EnumIter, Hash, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SagaTitle {
    PurchaseResourceFlow,
    RankingsUsersReward,
    TransferCryptoRewardToRankingWinners,
}

/// Type tag linking an initiator payload to the saga graph it commences.
pub trait CommenceSagaPayload {
    fn title(&self) -> SagaTitle;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResourceFlowPayload {
    pub user_id: String,
    pub resource_id: String,
    pub price: i32,
    pub quantity: i32,
}

impl CommenceSagaPayload for PurchaseResourceFlowPayload {
    fn title(&self) -> SagaTitle {
        SagaTitle::PurchaseResourceFlow
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserReward {
    pub user_id: String,
    pub coins: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RankingsUsersRewardPayload {
    pub rewards: Vec<UserReward>,
}

impl CommenceSagaPayload for RankingsUsersRewardPayload {
    fn title(&self) -> SagaTitle {
        SagaTitle::RankingsUsersReward
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CryptoRankingWinner {
    pub user_id: String,
    pub reward: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CompletedCryptoRanking {
    pub wallet_address: String,
    pub winners: Vec<CryptoRankingWinner>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransferCryptoRewardToRankingWinnersPayload {
    pub completed_crypto_rankings: Vec<CompletedCryptoRanking>,
}

impl CommenceSagaPayload for TransferCryptoRewardToRankingWinnersPayload {
    fn title(&self) -> SagaTitle {
        SagaTitle::TransferCryptoRewardToRankingWinners
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CommenceSaga<T> {
    pub title: SagaTitle,
    pub payload: T,
}

/// Posts a saga kick-off to the global commence queue. The orchestrator owns
/// the queue and turns the envelope into steps.
pub async fn commence_saga<T: CommenceSagaPayload + Serialize>(
    payload: T,
) -> Result<(), SagaError> {
    publish::send_to_queue(
        Queue::COMMENCE_SAGA,
        &CommenceSaga {
            title: payload.title(),
            payload: serde_json::to_value(&payload)?,
        },
    )
    .await
}

#[cfg(test)]
mod commence {
    use super::*;
    use crate::test::setup::TestSetup;
    use futures_lite::StreamExt;
    use lapin::options::BasicConsumeOptions;
    use serde_json::json;
    use std::time::Duration;

    /// The kick-off lands on the queue the orchestrator listens on.
    #[test]
    fn commence_envelope_reaches_the_global_queue() {
        let setup = TestSetup::new(None);
        setup.rt.block_on(async {
            let user_id = "user1233";

            let json_payload = json!(
                {
                    "userId": user_id,
                    "resourceId": "resource123",
                    "price": 100,
                    "quantity": 2
                }
            );

            let payload: PurchaseResourceFlowPayload =
                serde_json::from_value(json_payload).unwrap();

            commence_saga(payload).await.unwrap();

            let mut consumer = setup
                .session
                .consume_messages::<CommenceSaga<PurchaseResourceFlowPayload>>(
                    Queue::COMMENCE_SAGA,
                    BasicConsumeOptions::default(),
                )
                .await
                .expect("Failed to create consumer");

            let received = tokio::time::timeout(Duration::from_secs(2), consumer.next())
                .await
                .expect("Timed out waiting for message")
                .expect("Failed to receive message")
                .expect("Error in received message");
            assert_eq!(received.title, SagaTitle::PurchaseResourceFlow);
            assert_eq!(received.payload.user_id, user_id);
            assert_eq!(received.payload.quantity, 2);
        });
    }

    #[test]
    fn rankings_reward_envelope_round_trips() {
        let setup = TestSetup::new(None);
        setup.rt.block_on(async {
            let rewards = vec![
                UserReward {
                    user_id: "user123".to_string(),
                    coins: 100,
                },
                UserReward {
                    user_id: "user456".to_string(),
                    coins: 200,
                },
            ];

            commence_saga(RankingsUsersRewardPayload {
                rewards: rewards.clone(),
            })
            .await
            .unwrap();

            let mut consumer = setup
                .session
                .consume_messages::<CommenceSaga<RankingsUsersRewardPayload>>(
                    Queue::COMMENCE_SAGA,
                    BasicConsumeOptions::default(),
                )
                .await
                .expect("Failed to create consumer");

            let received = tokio::time::timeout(Duration::from_secs(2), consumer.next())
                .await
                .expect("Timed out waiting for message")
                .expect("Failed to receive message")
                .expect("Error in received message");

            assert_eq!(received.title, SagaTitle::RankingsUsersReward);
            assert_eq!(received.payload.rewards, rewards);
        });
    }

    #[test]
    fn title_serializes_snake_case() {
        let title = serde_json::to_value(SagaTitle::PurchaseResourceFlow).unwrap();
        assert_eq!(title, "purchase_resource_flow");
        assert_eq!(
            SagaTitle::TransferCryptoRewardToRankingWinners.as_ref(),
            "transfer_crypto_reward_to_ranking_winners"
        );
    }
}
