use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{AsRefStr, EnumIter, EnumString};

/// Identities a microservice can run under. Serialized kebab-case on the wire
/// (`app_id`, saga step envelopes).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Microservice {
    TestImage,
    TestMint,
    Auth,
    Payments,
    RoomCreator,
    RoomInventory,
    RoomSnapshot,
    Social,
    Storage,
    AuditEda,
}

/// Every event that can travel through the matching exchange, including the
/// audit lifecycle kinds the audit microservice consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString, EnumIter)]
pub enum Event {
    #[strum(serialize = "test.image")]
    TestImage,
    #[strum(serialize = "test.mint")]
    TestMint,
    #[strum(serialize = "auth.deleted_user")]
    AuthDeletedUser,
    #[strum(serialize = "auth.logout_user")]
    AuthLogoutUser,
    #[strum(serialize = "auth.new_user")]
    AuthNewUser,
    #[strum(serialize = "payments.notify_client")]
    PaymentsNotifyClient,
    #[strum(serialize = "room_creator.created_room")]
    RoomCreatorCreatedRoom,
    #[strum(serialize = "room_inventory.update_building_image")]
    RoomInventoryUpdateBuildingImage,
    #[strum(serialize = "room_snapshot.first_snapshot")]
    RoomSnapshotFirstSnapshot,
    #[strum(serialize = "social.block_chat")]
    SocialBlockChat,
    #[strum(serialize = "social.new_user")]
    SocialNewUser,
    #[strum(serialize = "social.unblock_chat")]
    SocialUnblockChat,
    #[strum(serialize = "social.updated_user")]
    SocialUpdatedUser,
    #[strum(serialize = "audit.published")]
    AuditPublished,
    #[strum(serialize = "audit.received")]
    AuditReceived,
    #[strum(serialize = "audit.processed")]
    AuditProcessed,
    #[strum(serialize = "audit.dead_letter")]
    AuditDeadLetter,
}

/// Type tag linking a payload struct to the event it is published as.
pub trait EventPayload {
    fn event(&self) -> Event;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TestImagePayload {
    pub image: String,
}

impl EventPayload for TestImagePayload {
    fn event(&self) -> Event {
        Event::TestImage
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TestMintPayload {
    pub mint: String,
}

impl EventPayload for TestMintPayload {
    fn event(&self) -> Event {
        Event::TestMint
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthDeletedUserPayload {
    pub user_id: String,
}

impl EventPayload for AuthDeletedUserPayload {
    fn event(&self) -> Event {
        Event::AuthDeletedUser
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthLogoutUserPayload {
    pub user_id: String,
}

impl EventPayload for AuthLogoutUserPayload {
    fn event(&self) -> Event {
        Event::AuthLogoutUser
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthNewUserPayload {
    pub id: String,
    pub email: String,
    pub username: String,
}

impl EventPayload for AuthNewUserPayload {
    fn event(&self) -> Event {
        Event::AuthNewUser
    }
}

/// Pushed to the realtime gateway so the client in `room` sees the payment outcome.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentsNotifyClientPayload {
    pub room: String,
    pub message: HashMap<String, String>,
}

impl EventPayload for PaymentsNotifyClientPayload {
    fn event(&self) -> Event {
        Event::PaymentsNotifyClient
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "type")]
    pub room_type: String,
    pub name: String,
    pub owner_id: String,
    pub owner_email: String,
    pub max_players: i32,
    pub template_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RoomCreatorCreatedRoomPayload {
    pub room: Room,
}

impl EventPayload for RoomCreatorCreatedRoomPayload {
    fn event(&self) -> Event {
        Event::RoomCreatorCreatedRoom
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomInventoryUpdateBuildingImagePayload {
    pub images: Vec<String>,
    pub room_type: String,
    pub user_id: String,
}

impl EventPayload for RoomInventoryUpdateBuildingImagePayload {
    fn event(&self) -> Event {
        Event::RoomInventoryUpdateBuildingImage
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshotFirstSnapshotPayload {
    pub slug: String,
}

impl EventPayload for RoomSnapshotFirstSnapshotPayload {
    fn event(&self) -> Event {
        Event::RoomSnapshotFirstSnapshot
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SocialBlockChatPayload {
    pub user_id: String,
    pub user_to_block_id: String,
}

impl EventPayload for SocialBlockChatPayload {
    fn event(&self) -> Event {
        Event::SocialBlockChat
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SocialUnblockChatPayload {
    pub user_id: String,
    pub user_to_unblock_id: String,
}

impl EventPayload for SocialUnblockChatPayload {
    fn event(&self) -> Event {
        Event::SocialUnblockChat
    }
}

/// Genders a social user can declare.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Gender {
    Male,
    Female,
    Undefined,
}

/// The social user model as the social microservice publishes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub username: String,
    pub email: String,
    pub gender: Gender,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub followers: Vec<String>,
    pub following: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthday: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub preferences: Vec<String>,
    pub blocked_users: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SocialNewUserPayload {
    pub social_user: SocialUser,
}

impl EventPayload for SocialNewUserPayload {
    fn event(&self) -> Event {
        Event::SocialNewUser
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SocialUpdatedUserPayload {
    pub social_user: SocialUser,
}

impl EventPayload for SocialUpdatedUserPayload {
    fn event(&self) -> Event {
        Event::SocialUpdatedUser
    }
}
