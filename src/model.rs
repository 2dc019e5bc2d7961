use serde::{Deserialize, Serialize};

use crate::error::RoomNameError;

/// The one room guaranteed to exist; never a delete target.
pub const DEFAULT_ROOM_NAME: &str = "default";

/// Shown for users without a profile image, and substituted when
/// resolving a stored image reference fails.
pub const DEFAULT_PROFILE_IMAGE_URL: &str = "img/default-profile-image.png";

// The default room is written at priority 1 and user-created rooms at
// priority 2, so the default room always sorts first in the room list.
pub const DEFAULT_ROOM_PRIORITY: f64 = 1.0;
pub const USER_ROOM_PRIORITY: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub nickname: String,
    #[serde(rename = "profileImageLocation", skip_serializing_if = "Option::is_none")]
    pub profile_image_location: Option<String>,
    /// Resolved download URL, cached locally after resolution. Never
    /// written back to the store.
    #[serde(skip)]
    pub profile_image_url: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "createdByUID")]
    pub created_by_uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub uid: String,
    pub text: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    /// Embedded copy of the favorited message, so the favorites list
    /// survives deletion of the source room.
    pub message: Message,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

const FORBIDDEN_NAME_CHARS: [char; 6] = ['.', '$', '#', '[', ']', '/'];

/// Validates a room name for creation. Returns the trimmed name.
pub fn validate_room_name(
    name: &str,
    name_taken: impl Fn(&str) -> bool,
) -> std::result::Result<String, RoomNameError> {
    let name = name.trim();

    if let Some(bad) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return Err(RoomNameError::ForbiddenCharacter(bad));
    }

    let len = name.chars().count();
    if !(1..=20).contains(&len) {
        return Err(RoomNameError::Length(len));
    }

    if name_taken(name) {
        return Err(RoomNameError::Duplicate(name.to_string()));
    }

    Ok(name.to_string())
}
