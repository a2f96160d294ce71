use serde::{Deserialize, Serialize};
use validator::Validate;

/// Which of a session's two rooms a participant wants to join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Audio,
    Editor,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RoomTokenRequest {
    #[validate(length(min = 1))]
    pub session_id: String,
    pub room: RoomKind,
    #[validate(length(min = 1))]
    pub participant_identity: String,
    #[validate(length(min = 1))]
    pub participant_name: String,
}

#[derive(Debug, Serialize)]
pub struct RoomTokenResponse {
    pub token: String,
    pub room: String,
    pub expires_in_seconds: i64,
}

/// Grant embedded in room-join tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomClaims {
    pub iss: String,
    pub sub: String,
    pub name: String,
    pub nbf: i64,
    pub exp: i64,
    pub video: RoomGrant,
}
