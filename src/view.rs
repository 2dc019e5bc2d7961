use std::collections::HashMap;

use crate::model::{Favorite, Message, User, DEFAULT_PROFILE_IMAGE_URL, DEFAULT_ROOM_NAME};

/// One rendered chat message. `own` drives sent/received alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub message_id: String,
    pub uid: String,
    pub nickname: Option<String>,
    pub profile_image_url: Option<String>,
    pub text: String,
    pub time: i64,
    pub own: bool,
    pub favorited: bool,
}

/// One entry in the favorites list, self-contained per the embedded copy.
#[derive(Debug, Clone, PartialEq)]
pub struct FavoriteRow {
    pub message_id: String,
    pub uid: String,
    pub nickname: Option<String>,
    pub profile_image_url: Option<String>,
    pub text: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomListEntry {
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavbarView {
    pub room_title: String,
    pub nickname: String,
    pub profile_image_url: String,
    /// The delete menu item is disabled for the default room.
    pub can_delete_room: bool,
}

/// View-model diff applied by the renderer adapter. The reconciliation
/// core only ever talks to the UI through these.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewPatch {
    /// Back to the signed-out blank state.
    Reset,
    ClearMessages,
    AppendMessage(MessageRow),
    SetRoomList(Vec<RoomListEntry>),
    SetNavbar(NavbarView),
    SetNickname { uid: String, nickname: String },
    /// Updates every rendered element carrying this user's marker.
    SetProfileImage { uid: String, url: String },
    AppendFavorite(FavoriteRow),
    RemoveFavorite { message_id: String },
    SetFavoriteMarker { message_id: String, favorited: bool },
}

/// Applies view-model diffs to a concrete UI. Implementations hold no
/// reconciliation state.
pub trait Renderer {
    fn apply(&mut self, patch: ViewPatch);
}

/// Renderer that logs every patch; used by the demo binary.
#[derive(Debug, Default)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn apply(&mut self, patch: ViewPatch) {
        log::info!("render: {patch:?}");
    }
}

pub(crate) fn message_row(
    message_id: &str,
    message: &Message,
    users: &HashMap<String, User>,
    current_uid: &str,
    favorited: bool,
) -> MessageRow {
    let user = users.get(&message.uid);
    MessageRow {
        message_id: message_id.to_string(),
        uid: message.uid.clone(),
        nickname: user.map(|u| u.nickname.clone()),
        profile_image_url: user.and_then(|u| u.profile_image_url.clone()),
        text: message.text.clone(),
        time: message.time,
        own: message.uid == current_uid,
        favorited,
    }
}

pub(crate) fn favorite_row(
    message_id: &str,
    favorite: &Favorite,
    users: &HashMap<String, User>,
) -> FavoriteRow {
    let user = users.get(&favorite.message.uid);
    FavoriteRow {
        message_id: message_id.to_string(),
        uid: favorite.message.uid.clone(),
        nickname: user.map(|u| u.nickname.clone()),
        profile_image_url: user.and_then(|u| u.profile_image_url.clone()),
        text: favorite.message.text.clone(),
        time: favorite.message.time,
    }
}

pub(crate) fn room_list(rooms: &[(String, crate::model::Room)], active: Option<&str>) -> Vec<RoomListEntry> {
    rooms
        .iter()
        .map(|(name, _)| RoomListEntry {
            name: name.clone(),
            active: Some(name.as_str()) == active,
        })
        .collect()
}

pub(crate) fn navbar(room: &str, current_user: Option<&User>) -> NavbarView {
    NavbarView {
        room_title: format!("Room: {room}"),
        nickname: current_user.map(|u| u.nickname.clone()).unwrap_or_default(),
        profile_image_url: current_user
            .and_then(|u| u.profile_image_url.clone())
            .unwrap_or_else(|| DEFAULT_PROFILE_IMAGE_URL.to_string()),
        can_delete_room: room != DEFAULT_ROOM_NAME,
    }
}
