use std::collections::HashMap;

use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::error::{Error, Result};
use crate::model::{
    validate_room_name, Favorite, Message, Room, User, DEFAULT_PROFILE_IMAGE_URL,
    DEFAULT_ROOM_NAME, DEFAULT_ROOM_PRIORITY, USER_ROOM_PRIORITY,
};
use crate::store::{paths, server_timestamp, EventKind, Snapshot};
use crate::view::{self, ViewPatch};

/// Store and environment events consumed by the core, already routed and
/// decoded by the driver.
#[derive(Debug, Clone)]
pub enum Event {
    AuthChanged(Option<AuthUser>),
    UsersSnapshot(Snapshot),
    RoomsSnapshot(Snapshot),
    MessageAdded {
        room: String,
        message_id: String,
        message: Message,
    },
    FavoriteAdded {
        message_id: String,
        favorite: Favorite,
    },
    FavoriteRemoved {
        message_id: String,
    },
    /// The address-bar fragment changed; carries the decoded room name.
    FragmentChanged(Option<String>),
    ProfileImageResolved {
        uid: String,
        url: String,
    },
}

/// Effects requested by the core. The driver executes them in order and
/// aborts the rest of a batch on the first remote failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set {
        path: String,
        value: Value,
    },
    SetWithPriority {
        path: String,
        value: Value,
        priority: f64,
    },
    Update {
        path: String,
        value: Value,
    },
    Remove {
        path: String,
    },
    Push {
        path: String,
        value: Value,
    },
    Subscribe {
        path: String,
        kind: EventKind,
    },
    Unsubscribe {
        path: String,
        kind: EventKind,
    },
    /// Write the decoded room name into the address-bar fragment. The
    /// echoed `FragmentChanged` performs the actual room switch.
    SetFragment(Option<String>),
    ResolveProfileImage {
        uid: String,
        location: String,
    },
    /// Upload new profile image bytes, then point the user record at them.
    StoreProfileImage {
        uid: String,
        bytes: Vec<u8>,
        content_type: String,
    },
    Render(ViewPatch),
}

/// User-initiated actions. These never mutate collection state directly;
/// the store's echoed events converge the view.
#[derive(Debug, Clone)]
pub enum Action {
    SelectRoom(String),
    PostMessage(String),
    CreateRoom(String),
    DeleteRoom(String),
    ToggleFavorite { message_id: String, message: Message },
    SetNickname(String),
    SetProfileImage { bytes: Vec<u8>, content_type: String },
}

/// Latest known full snapshots of the users and rooms collections.
/// Replaced wholesale per snapshot, owned by the reconciler, reset on
/// sign-out.
#[derive(Debug, Default)]
pub struct Mirror {
    users: Option<HashMap<String, User>>,
    rooms: Option<Vec<(String, Room)>>,
}

impl Mirror {
    pub fn room_exists(&self, name: &str) -> bool {
        self.rooms
            .as_deref()
            .is_some_and(|rooms| rooms.iter().any(|(n, _)| n == name))
    }

    pub fn user(&self, uid: &str) -> Option<&User> {
        self.users.as_ref()?.get(uid)
    }

    fn reset(&mut self) {
        self.users = None;
        self.rooms = None;
    }
}

// Missing default records are re-synthesized by writing them and waiting
// for the snapshot echo; `AwaitingWrite` suppresses reconciliation of the
// inconsistent intermediate snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bootstrap {
    Idle,
    AwaitingWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomSelection {
    Unselected,
    Selected(String),
}

/// The pure reconciliation core: consumes events, produces commands.
/// No I/O and no async anywhere in here.
pub struct Reconciler {
    current_uid: Option<String>,
    current_email: Option<String>,
    mirror: Mirror,
    favorites: HashMap<String, Favorite>,
    selection: RoomSelection,
    users_bootstrap: Bootstrap,
    rooms_bootstrap: Bootstrap,
    /// Last known address-bar fragment (decoded room name).
    fragment: Option<String>,
    initial_selection_done: bool,
}

impl Reconciler {
    pub fn new(initial_fragment: Option<String>) -> Self {
        Reconciler {
            current_uid: None,
            current_email: None,
            mirror: Mirror::default(),
            favorites: HashMap::new(),
            selection: RoomSelection::Unselected,
            users_bootstrap: Bootstrap::Idle,
            rooms_bootstrap: Bootstrap::Idle,
            fragment: initial_fragment,
            initial_selection_done: false,
        }
    }

    pub fn selection(&self) -> &RoomSelection {
        &self.selection
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn is_favorite(&self, message_id: &str) -> bool {
        self.favorites.contains_key(message_id)
    }

    pub fn handle_event(&mut self, event: Event) -> Vec<Command> {
        match event {
            Event::AuthChanged(user) => self.on_auth_changed(user),
            Event::UsersSnapshot(snapshot) => self.on_users_snapshot(&snapshot),
            Event::RoomsSnapshot(snapshot) => self.on_rooms_snapshot(&snapshot),
            Event::MessageAdded {
                room,
                message_id,
                message,
            } => self.on_message_added(&room, &message_id, &message),
            Event::FavoriteAdded {
                message_id,
                favorite,
            } => self.on_favorite_added(message_id, favorite),
            Event::FavoriteRemoved { message_id } => self.on_favorite_removed(&message_id),
            Event::FragmentChanged(fragment) => self.on_fragment_changed(fragment),
            Event::ProfileImageResolved { uid, url } => self.on_profile_image_resolved(&uid, url),
        }
    }

    pub fn handle_action(&mut self, action: Action) -> Result<Vec<Command>> {
        match action {
            Action::SelectRoom(name) => Ok(vec![Command::SetFragment(Some(name))]),
            Action::PostMessage(text) => self.post_message(text),
            Action::CreateRoom(name) => self.create_room(&name),
            Action::DeleteRoom(name) => Self::delete_room(&name),
            Action::ToggleFavorite {
                message_id,
                message,
            } => self.toggle_favorite(&message_id, message),
            Action::SetNickname(nickname) => self.set_nickname(&nickname),
            Action::SetProfileImage {
                bytes,
                content_type,
            } => self.set_profile_image(bytes, content_type),
        }
    }

    // --- auth lifecycle ---

    fn on_auth_changed(&mut self, user: Option<AuthUser>) -> Vec<Command> {
        match user {
            Some(user) => {
                // Token refreshes re-announce the same identity.
                if self.current_uid.as_deref() == Some(user.uid.as_str()) {
                    debug!("ignoring auth notification for current user");
                    return vec![];
                }
                info!("signed in as {}", user.email);
                self.clear_session_state();
                self.current_uid = Some(user.uid.clone());
                self.current_email = Some(user.email);

                vec![
                    Command::Render(ViewPatch::Reset),
                    Command::Subscribe {
                        path: paths::USERS.to_string(),
                        kind: EventKind::Value,
                    },
                    Command::Subscribe {
                        path: paths::ROOMS.to_string(),
                        kind: EventKind::Value,
                    },
                    Command::Subscribe {
                        path: paths::favorites(&user.uid),
                        kind: EventKind::ChildAdded,
                    },
                    Command::Subscribe {
                        path: paths::favorites(&user.uid),
                        kind: EventKind::ChildRemoved,
                    },
                ]
            }
            None => {
                let Some(uid) = self.current_uid.take() else {
                    return vec![];
                };
                info!("signed out");

                let mut commands = vec![
                    Command::Unsubscribe {
                        path: paths::USERS.to_string(),
                        kind: EventKind::Value,
                    },
                    Command::Unsubscribe {
                        path: paths::ROOMS.to_string(),
                        kind: EventKind::Value,
                    },
                    Command::Unsubscribe {
                        path: paths::favorites(&uid),
                        kind: EventKind::ChildAdded,
                    },
                    Command::Unsubscribe {
                        path: paths::favorites(&uid),
                        kind: EventKind::ChildRemoved,
                    },
                ];
                if let RoomSelection::Selected(room) = &self.selection {
                    commands.push(Command::Unsubscribe {
                        path: paths::messages(room),
                        kind: EventKind::ChildAdded,
                    });
                }
                self.clear_session_state();
                commands.push(Command::Render(ViewPatch::Reset));
                commands.push(Command::SetFragment(None));
                commands
            }
        }
    }

    fn clear_session_state(&mut self) {
        self.current_uid = None;
        self.current_email = None;
        self.mirror.reset();
        self.favorites.clear();
        self.selection = RoomSelection::Unselected;
        self.users_bootstrap = Bootstrap::Idle;
        self.rooms_bootstrap = Bootstrap::Idle;
        self.initial_selection_done = false;
    }

    // --- local mirror: users ---

    fn on_users_snapshot(&mut self, snapshot: &Snapshot) -> Vec<Command> {
        let Some(uid) = self.current_uid.clone() else {
            return vec![];
        };

        let mut users = HashMap::new();
        let mut order = Vec::new();
        for (key, value) in &snapshot.entries {
            match serde_json::from_value::<User>(value.clone()) {
                Ok(user) => {
                    users.insert(key.clone(), user);
                    order.push(key.clone());
                }
                Err(err) => warn!("malformed user record {key}: {err}"),
            }
        }
        self.mirror.users = Some(users);

        if !order.contains(&uid) {
            if self.users_bootstrap == Bootstrap::AwaitingWrite {
                debug!("user record write still in flight");
                return vec![];
            }
            let Some(email) = self.current_email.clone() else {
                return vec![];
            };
            info!("creating user record for {uid}");
            self.users_bootstrap = Bootstrap::AwaitingWrite;
            return vec![Command::Set {
                path: paths::user(&uid),
                value: json!({
                    "nickname": email,
                    "createdAt": server_timestamp(),
                    "updatedAt": server_timestamp(),
                }),
            }];
        }
        self.users_bootstrap = Bootstrap::Idle;

        let mut commands = Vec::new();
        for key in &order {
            commands.extend(self.refresh_user_display(key));
        }

        // Initial room selection waits until both collections have arrived.
        if self.rooms_ready() {
            commands.extend(self.select_current_room());
        }
        commands
    }

    // Readiness barrier, one flag per collection: snapshots that are still
    // awaiting a bootstrap echo don't count as arrived.
    fn rooms_ready(&self) -> bool {
        self.rooms_bootstrap == Bootstrap::Idle && self.mirror.rooms.is_some()
    }

    fn users_ready(&self) -> bool {
        self.mirror
            .users
            .as_ref()
            .is_some_and(|users| !users.is_empty())
    }

    /// Nickname refresh plus profile image resolution for one user.
    fn refresh_user_display(&mut self, uid: &str) -> Vec<Command> {
        let Some(users) = self.mirror.users.as_mut() else {
            return vec![];
        };
        let Some(user) = users.get_mut(uid) else {
            return vec![];
        };

        let mut commands = vec![Command::Render(ViewPatch::SetNickname {
            uid: uid.to_string(),
            nickname: user.nickname.clone(),
        })];
        match &user.profile_image_location {
            Some(location) => commands.push(Command::ResolveProfileImage {
                uid: uid.to_string(),
                location: location.clone(),
            }),
            None => {
                user.profile_image_url = Some(DEFAULT_PROFILE_IMAGE_URL.to_string());
                commands.push(Command::Render(ViewPatch::SetProfileImage {
                    uid: uid.to_string(),
                    url: DEFAULT_PROFILE_IMAGE_URL.to_string(),
                }));
            }
        }
        commands
    }

    fn on_profile_image_resolved(&mut self, uid: &str, url: String) -> Vec<Command> {
        if let Some(users) = self.mirror.users.as_mut() {
            if let Some(user) = users.get_mut(uid) {
                user.profile_image_url = Some(url.clone());
            }
        }
        vec![Command::Render(ViewPatch::SetProfileImage {
            uid: uid.to_string(),
            url,
        })]
    }

    // --- local mirror: rooms ---

    fn on_rooms_snapshot(&mut self, snapshot: &Snapshot) -> Vec<Command> {
        let Some(uid) = self.current_uid.clone() else {
            return vec![];
        };

        let mut rooms = Vec::new();
        for (key, value) in &snapshot.entries {
            match serde_json::from_value::<Room>(value.clone()) {
                Ok(room) => rooms.push((key.clone(), room)),
                Err(err) => warn!("malformed room record {key}: {err}"),
            }
        }
        self.mirror.rooms = Some(rooms);

        if !self.mirror.room_exists(DEFAULT_ROOM_NAME) {
            if self.rooms_bootstrap == Bootstrap::AwaitingWrite {
                debug!("default room write still in flight");
                return vec![];
            }
            info!("creating the {DEFAULT_ROOM_NAME} room");
            self.rooms_bootstrap = Bootstrap::AwaitingWrite;
            return vec![Command::SetWithPriority {
                path: paths::room(DEFAULT_ROOM_NAME),
                value: json!({
                    "createdAt": server_timestamp(),
                    "createdByUID": uid,
                }),
                priority: DEFAULT_ROOM_PRIORITY,
            }];
        }
        self.rooms_bootstrap = Bootstrap::Idle;

        let mut commands = vec![Command::Render(ViewPatch::SetRoomList(view::room_list(
            self.mirror.rooms.as_deref().unwrap_or_default(),
            self.active_room(),
        )))];

        // Room selection additionally needs the users snapshot.
        if !self.users_ready() {
            return commands;
        }
        commands.extend(self.select_current_room());
        commands
    }

    // --- room navigator ---

    fn active_room(&self) -> Option<&str> {
        match &self.selection {
            RoomSelection::Selected(room) => Some(room),
            RoomSelection::Unselected => None,
        }
    }

    /// Arbitrates "which room should be shown" against the mirror: the
    /// deleted-room fallback when selected, the fragment-or-default choice
    /// on first load.
    fn select_current_room(&mut self) -> Vec<Command> {
        match self.selection.clone() {
            RoomSelection::Selected(room) => {
                if self.mirror.room_exists(&room) {
                    vec![]
                } else {
                    info!("room {room} vanished, falling back to {DEFAULT_ROOM_NAME}");
                    vec![Command::SetFragment(Some(DEFAULT_ROOM_NAME.to_string()))]
                }
            }
            RoomSelection::Unselected => {
                if self.initial_selection_done {
                    return vec![];
                }
                self.initial_selection_done = true;
                match self.fragment.clone() {
                    Some(room) if self.mirror.room_exists(&room) => self.switch_to(&room),
                    _ => vec![Command::SetFragment(Some(DEFAULT_ROOM_NAME.to_string()))],
                }
            }
        }
    }

    fn on_fragment_changed(&mut self, fragment: Option<String>) -> Vec<Command> {
        self.fragment = fragment.clone();
        if self.current_uid.is_none() {
            return vec![];
        }
        match fragment {
            Some(room) => self.switch_to(&room),
            None => vec![],
        }
    }

    fn switch_to(&mut self, room: &str) -> Vec<Command> {
        if !self.mirror.room_exists(room) {
            warn!("no such room: {room}");
            return vec![];
        }

        let mut commands = Vec::new();
        if let RoomSelection::Selected(previous) = &self.selection {
            commands.push(Command::Unsubscribe {
                path: paths::messages(previous),
                kind: EventKind::ChildAdded,
            });
        }
        self.selection = RoomSelection::Selected(room.to_string());

        commands.push(Command::Render(ViewPatch::ClearMessages));
        commands.push(Command::Subscribe {
            path: paths::messages(room),
            kind: EventKind::ChildAdded,
        });
        commands.push(Command::Render(ViewPatch::SetRoomList(view::room_list(
            self.mirror.rooms.as_deref().unwrap_or_default(),
            Some(room),
        ))));
        let current_user = self
            .current_uid
            .as_deref()
            .and_then(|uid| self.mirror.user(uid));
        commands.push(Command::Render(ViewPatch::SetNavbar(view::navbar(
            room,
            current_user,
        ))));
        commands
    }

    fn on_message_added(&mut self, room: &str, message_id: &str, message: &Message) -> Vec<Command> {
        // Compare against the active room at delivery time; events for a
        // room left behind during a switch are dropped.
        if self.active_room() != Some(room) {
            warn!("discarding message {message_id} for inactive room {room}");
            return vec![];
        }
        let Some(uid) = self.current_uid.as_deref() else {
            return vec![];
        };

        let empty = HashMap::new();
        let users = self.mirror.users.as_ref().unwrap_or(&empty);
        vec![Command::Render(ViewPatch::AppendMessage(view::message_row(
            message_id,
            message,
            users,
            uid,
            self.favorites.contains_key(message_id),
        )))]
    }

    // --- favorites reconciler ---

    fn on_favorite_added(&mut self, message_id: String, favorite: Favorite) -> Vec<Command> {
        let empty = HashMap::new();
        let users = self.mirror.users.as_ref().unwrap_or(&empty);
        let row = view::favorite_row(&message_id, &favorite, users);
        self.favorites.insert(message_id.clone(), favorite);
        vec![
            Command::Render(ViewPatch::AppendFavorite(row)),
            Command::Render(ViewPatch::SetFavoriteMarker {
                message_id,
                favorited: true,
            }),
        ]
    }

    fn on_favorite_removed(&mut self, message_id: &str) -> Vec<Command> {
        if self.favorites.remove(message_id).is_none() {
            debug!("favorite {message_id} already absent");
            return vec![];
        }
        vec![
            Command::Render(ViewPatch::RemoveFavorite {
                message_id: message_id.to_string(),
            }),
            Command::Render(ViewPatch::SetFavoriteMarker {
                message_id: message_id.to_string(),
                favorited: false,
            }),
        ]
    }

    fn toggle_favorite(&mut self, message_id: &str, message: Message) -> Result<Vec<Command>> {
        let uid = self.current_uid.as_deref().ok_or(Error::NotSignedIn)?;

        // Only the write; the echoed add/remove event converges the set
        // and the view, so a racing echo can never double-apply.
        if self.favorites.contains_key(message_id) {
            Ok(vec![Command::Remove {
                path: paths::favorite(uid, message_id),
            }])
        } else {
            Ok(vec![Command::Set {
                path: paths::favorite(uid, message_id),
                value: json!({
                    "message": message,
                    "createdAt": server_timestamp(),
                }),
            }])
        }
    }

    // --- remaining actions ---

    fn post_message(&self, text: String) -> Result<Vec<Command>> {
        if text.is_empty() {
            return Ok(vec![]);
        }
        let uid = self.current_uid.as_deref().ok_or(Error::NotSignedIn)?;
        let RoomSelection::Selected(room) = &self.selection else {
            return Err(Error::NoRoomSelected);
        };
        Ok(vec![Command::Push {
            path: paths::messages(room),
            value: json!({
                "uid": uid,
                "text": text,
                "time": server_timestamp(),
            }),
        }])
    }

    fn create_room(&self, name: &str) -> Result<Vec<Command>> {
        let uid = self.current_uid.as_deref().ok_or(Error::NotSignedIn)?;
        let name = validate_room_name(name, |candidate| self.mirror.room_exists(candidate))
            .map_err(Error::RoomName)?;

        Ok(vec![
            Command::SetWithPriority {
                path: paths::room(&name),
                value: json!({
                    "createdAt": server_timestamp(),
                    "createdByUID": uid,
                }),
                priority: USER_ROOM_PRIORITY,
            },
            // Runs only if the write succeeded; navigates into the room.
            Command::SetFragment(Some(name)),
        ])
    }

    fn delete_room(name: &str) -> Result<Vec<Command>> {
        if name == DEFAULT_ROOM_NAME {
            return Err(Error::ProtectedRoom(name.to_string()));
        }
        Ok(vec![
            Command::Remove {
                path: paths::room(name),
            },
            Command::Remove {
                path: paths::messages(name),
            },
        ])
    }

    fn set_nickname(&self, nickname: &str) -> Result<Vec<Command>> {
        if nickname.is_empty() {
            return Ok(vec![]);
        }
        let uid = self.current_uid.as_deref().ok_or(Error::NotSignedIn)?;
        Ok(vec![Command::Update {
            path: paths::user(uid),
            value: json!({
                "nickname": nickname,
                "updatedAt": server_timestamp(),
            }),
        }])
    }

    fn set_profile_image(&self, bytes: Vec<u8>, content_type: String) -> Result<Vec<Command>> {
        let uid = self.current_uid.as_deref().ok_or(Error::NotSignedIn)?;
        Ok(vec![Command::StoreProfileImage {
            uid: uid.to_string(),
            bytes,
            content_type,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoomNameError;

    const UID: &str = "u1";
    const EMAIL: &str = "alice@example.com";

    fn auth_user() -> AuthUser {
        AuthUser {
            uid: UID.to_string(),
            email: EMAIL.to_string(),
        }
    }

    fn users_snapshot(uids: &[&str]) -> Snapshot {
        Snapshot {
            entries: uids
                .iter()
                .map(|uid| {
                    (
                        (*uid).to_string(),
                        json!({ "nickname": format!("nick-{uid}"), "createdAt": 1, "updatedAt": 1 }),
                    )
                })
                .collect(),
        }
    }

    fn rooms_snapshot(names: &[&str]) -> Snapshot {
        Snapshot {
            entries: names
                .iter()
                .map(|name| ((*name).to_string(), json!({ "createdAt": 1, "createdByUID": UID })))
                .collect(),
        }
    }

    fn message(uid: &str, text: &str) -> Message {
        Message {
            uid: uid.to_string(),
            text: text.to_string(),
            time: 5,
        }
    }

    fn is_write(command: &Command) -> bool {
        matches!(
            command,
            Command::Set { .. }
                | Command::SetWithPriority { .. }
                | Command::Update { .. }
                | Command::Remove { .. }
                | Command::Push { .. }
        )
    }

    /// Signed in, both snapshots arrived, default room selected.
    fn ready() -> Reconciler {
        let mut r = Reconciler::new(None);
        r.handle_event(Event::AuthChanged(Some(auth_user())));
        r.handle_event(Event::UsersSnapshot(users_snapshot(&[UID, "u2"])));
        let commands =
            r.handle_event(Event::RoomsSnapshot(rooms_snapshot(&["default", "general", "team"])));
        assert!(commands.contains(&Command::SetFragment(Some("default".to_string()))));
        r.handle_event(Event::FragmentChanged(Some("default".to_string())));
        assert_eq!(r.selection(), &RoomSelection::Selected("default".to_string()));
        r
    }

    #[test]
    fn missing_default_room_issues_exactly_one_creation_write() {
        let mut r = Reconciler::new(None);
        r.handle_event(Event::AuthChanged(Some(auth_user())));
        r.handle_event(Event::UsersSnapshot(users_snapshot(&[UID])));

        let commands = r.handle_event(Event::RoomsSnapshot(rooms_snapshot(&["general"])));
        assert_eq!(commands.len(), 1, "bootstrap must be terminal: {commands:?}");
        match &commands[0] {
            Command::SetWithPriority { path, priority, .. } => {
                assert_eq!(path, "rooms/default");
                assert_eq!(*priority, DEFAULT_ROOM_PRIORITY);
            }
            other => panic!("expected default room write, got {other:?}"),
        }

        // Re-delivery while the write is in flight stays quiet.
        assert!(r
            .handle_event(Event::RoomsSnapshot(rooms_snapshot(&["general"])))
            .is_empty());

        // The echo containing the default room resumes reconciliation.
        let commands = r.handle_event(Event::RoomsSnapshot(rooms_snapshot(&["default", "general"])));
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::Render(ViewPatch::SetRoomList(_)))));
    }

    #[test]
    fn missing_user_record_issues_exactly_one_creation_write() {
        let mut r = Reconciler::new(None);
        r.handle_event(Event::AuthChanged(Some(auth_user())));

        let commands = r.handle_event(Event::UsersSnapshot(users_snapshot(&[])));
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            Command::Set { path, value } => {
                assert_eq!(path, "users/u1");
                assert_eq!(value["nickname"], EMAIL);
            }
            other => panic!("expected user record write, got {other:?}"),
        }

        assert!(r.handle_event(Event::UsersSnapshot(users_snapshot(&[]))).is_empty());

        let commands = r.handle_event(Event::UsersSnapshot(users_snapshot(&[UID])));
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::Render(ViewPatch::SetNickname { .. }))));
    }

    #[test]
    fn favorite_membership_follows_last_event() {
        let mut r = ready();
        let favorite = Favorite {
            message: message(UID, "hello"),
            created_at: 9,
        };

        r.handle_event(Event::FavoriteAdded {
            message_id: "m1".to_string(),
            favorite: favorite.clone(),
        });
        assert!(r.is_favorite("m1"));

        r.handle_event(Event::FavoriteRemoved {
            message_id: "m1".to_string(),
        });
        assert!(!r.is_favorite("m1"));

        r.handle_event(Event::FavoriteAdded {
            message_id: "m1".to_string(),
            favorite,
        });
        assert!(r.is_favorite("m1"));
    }

    #[test]
    fn favorite_toggle_writes_but_never_mutates_locally() {
        let mut r = ready();

        let commands = r
            .handle_action(Action::ToggleFavorite {
                message_id: "m1".to_string(),
                message: message("u2", "hello"),
            })
            .unwrap();
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            Command::Set { path, value } => {
                assert_eq!(path, "favorites/u1/m1");
                // Self-contained copy of the message.
                assert_eq!(value["message"]["text"], "hello");
                assert_eq!(value["message"]["uid"], "u2");
            }
            other => panic!("expected favorite write, got {other:?}"),
        }
        assert!(!r.is_favorite("m1"), "toggle must not touch the local set");

        r.handle_event(Event::FavoriteAdded {
            message_id: "m1".to_string(),
            favorite: Favorite {
                message: message("u2", "hello"),
                created_at: 9,
            },
        });

        let commands = r
            .handle_action(Action::ToggleFavorite {
                message_id: "m1".to_string(),
                message: message("u2", "hello"),
            })
            .unwrap();
        assert_eq!(
            commands,
            vec![Command::Remove {
                path: "favorites/u1/m1".to_string()
            }]
        );
        assert!(r.is_favorite("m1"), "toggle must not touch the local set");
    }

    #[test]
    fn initial_selection_prefers_existing_fragment_room() {
        let mut r = Reconciler::new(Some("general".to_string()));
        r.handle_event(Event::AuthChanged(Some(auth_user())));
        r.handle_event(Event::UsersSnapshot(users_snapshot(&[UID])));

        let commands = r.handle_event(Event::RoomsSnapshot(rooms_snapshot(&["default", "general"])));
        assert_eq!(r.selection(), &RoomSelection::Selected("general".to_string()));
        assert!(commands.contains(&Command::Subscribe {
            path: "messages/general".to_string(),
            kind: EventKind::ChildAdded,
        }));
        assert!(!commands.iter().any(|c| matches!(c, Command::SetFragment(_))));
    }

    #[test]
    fn initial_selection_falls_back_when_fragment_room_missing() {
        let mut r = Reconciler::new(Some("missing".to_string()));
        r.handle_event(Event::AuthChanged(Some(auth_user())));
        r.handle_event(Event::UsersSnapshot(users_snapshot(&[UID])));

        let commands = r.handle_event(Event::RoomsSnapshot(rooms_snapshot(&["default"])));
        assert!(commands.contains(&Command::SetFragment(Some(DEFAULT_ROOM_NAME.to_string()))));
        assert_eq!(r.selection(), &RoomSelection::Unselected);
    }

    #[test]
    fn initial_selection_triggers_exactly_once() {
        let mut r = Reconciler::new(None);
        r.handle_event(Event::AuthChanged(Some(auth_user())));
        r.handle_event(Event::UsersSnapshot(users_snapshot(&[UID])));

        let commands = r.handle_event(Event::RoomsSnapshot(rooms_snapshot(&["default"])));
        assert_eq!(
            commands
                .iter()
                .filter(|c| matches!(c, Command::SetFragment(_)))
                .count(),
            1
        );

        // Another snapshot before the fragment echo must not re-trigger.
        let commands = r.handle_event(Event::RoomsSnapshot(rooms_snapshot(&["default"])));
        assert!(!commands.iter().any(|c| matches!(c, Command::SetFragment(_))));
    }

    #[test]
    fn stale_message_events_are_discarded_after_switch() {
        let mut r = ready();

        let commands = r.handle_event(Event::FragmentChanged(Some("team".to_string())));
        assert!(commands.contains(&Command::Unsubscribe {
            path: "messages/default".to_string(),
            kind: EventKind::ChildAdded,
        }));
        assert_eq!(r.selection(), &RoomSelection::Selected("team".to_string()));

        // Event for the room left behind, delivered after the switch.
        let commands = r.handle_event(Event::MessageAdded {
            room: "default".to_string(),
            message_id: "m1".to_string(),
            message: message(UID, "late"),
        });
        assert!(commands.is_empty());

        let commands = r.handle_event(Event::MessageAdded {
            room: "team".to_string(),
            message_id: "m2".to_string(),
            message: message(UID, "fresh"),
        });
        match &commands[..] {
            [Command::Render(ViewPatch::AppendMessage(row))] => {
                assert!(row.own);
                assert_eq!(row.text, "fresh");
            }
            other => panic!("expected one rendered message, got {other:?}"),
        }
    }

    #[test]
    fn deleting_the_default_room_is_rejected_without_writes() {
        let mut r = ready();
        let err = r
            .handle_action(Action::DeleteRoom(DEFAULT_ROOM_NAME.to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::ProtectedRoom(_)));

        let commands = r.handle_action(Action::DeleteRoom("team".to_string())).unwrap();
        assert_eq!(
            commands,
            vec![
                Command::Remove {
                    path: "rooms/team".to_string()
                },
                Command::Remove {
                    path: "messages/team".to_string()
                },
            ]
        );
    }

    #[test]
    fn vanished_selected_room_falls_back_to_default() {
        let mut r = ready();
        r.handle_event(Event::FragmentChanged(Some("team".to_string())));

        let commands = r.handle_event(Event::RoomsSnapshot(rooms_snapshot(&["default", "general"])));
        assert!(commands.contains(&Command::SetFragment(Some(DEFAULT_ROOM_NAME.to_string()))));

        r.handle_event(Event::FragmentChanged(Some(DEFAULT_ROOM_NAME.to_string())));
        assert_eq!(r.selection(), &RoomSelection::Selected(DEFAULT_ROOM_NAME.to_string()));
    }

    #[test]
    fn create_room_validates_before_writing() {
        let mut r = ready();

        let err = r.handle_action(Action::CreateRoom("general".to_string())).unwrap_err();
        assert!(matches!(
            err,
            Error::RoomName(RoomNameError::Duplicate(_))
        ));
        let err = r.handle_action(Action::CreateRoom("a/b".to_string())).unwrap_err();
        assert!(matches!(
            err,
            Error::RoomName(RoomNameError::ForbiddenCharacter('/'))
        ));

        let commands = r.handle_action(Action::CreateRoom("team-1".to_string())).unwrap();
        match &commands[..] {
            [Command::SetWithPriority { path, priority, .. }, Command::SetFragment(Some(name))] => {
                assert_eq!(path, "rooms/team-1");
                assert_eq!(*priority, USER_ROOM_PRIORITY);
                assert_eq!(name, "team-1");
            }
            other => panic!("expected write then navigation, got {other:?}"),
        }
    }

    #[test]
    fn post_message_requires_text_and_selection() {
        let mut r = Reconciler::new(None);
        r.handle_event(Event::AuthChanged(Some(auth_user())));
        assert!(matches!(
            r.handle_action(Action::PostMessage("hi".to_string())),
            Err(Error::NoRoomSelected)
        ));

        let mut r = ready();
        assert!(r.handle_action(Action::PostMessage(String::new())).unwrap().is_empty());

        let commands = r.handle_action(Action::PostMessage("hi".to_string())).unwrap();
        match &commands[..] {
            [Command::Push { path, value }] => {
                assert_eq!(path, "messages/default");
                assert_eq!(value["uid"], UID);
                assert_eq!(value["time"], server_timestamp());
            }
            other => panic!("expected one push, got {other:?}"),
        }
    }

    #[test]
    fn nickname_update_is_a_merge_write() {
        let mut r = ready();
        assert!(r.handle_action(Action::SetNickname(String::new())).unwrap().is_empty());

        let commands = r.handle_action(Action::SetNickname("Alice".to_string())).unwrap();
        match &commands[..] {
            [Command::Update { path, value }] => {
                assert_eq!(path, "users/u1");
                assert_eq!(value["nickname"], "Alice");
            }
            other => panic!("expected one update, got {other:?}"),
        }
    }

    #[test]
    fn resolved_profile_image_is_cached_and_rendered() {
        let mut r = ready();
        let commands = r.handle_event(Event::ProfileImageResolved {
            uid: UID.to_string(),
            url: "data:image/png;base64,xyz".to_string(),
        });
        assert!(commands.contains(&Command::Render(ViewPatch::SetProfileImage {
            uid: UID.to_string(),
            url: "data:image/png;base64,xyz".to_string(),
        })));
        assert_eq!(
            r.mirror().user(UID).unwrap().profile_image_url.as_deref(),
            Some("data:image/png;base64,xyz")
        );
    }

    #[test]
    fn sign_out_unsubscribes_and_clears_state() {
        let mut r = ready();
        r.handle_event(Event::FavoriteAdded {
            message_id: "m1".to_string(),
            favorite: Favorite {
                message: message(UID, "hello"),
                created_at: 9,
            },
        });

        let commands = r.handle_event(Event::AuthChanged(None));
        for (path, kind) in [
            ("users", EventKind::Value),
            ("rooms", EventKind::Value),
            ("favorites/u1", EventKind::ChildAdded),
            ("favorites/u1", EventKind::ChildRemoved),
            ("messages/default", EventKind::ChildAdded),
        ] {
            assert!(
                commands.contains(&Command::Unsubscribe {
                    path: path.to_string(),
                    kind,
                }),
                "missing unsubscribe for {path}"
            );
        }
        assert!(commands.contains(&Command::Render(ViewPatch::Reset)));
        assert!(commands.contains(&Command::SetFragment(None)));

        assert_eq!(r.selection(), &RoomSelection::Unselected);
        assert!(!r.is_favorite("m1"));
        assert!(r.mirror().user(UID).is_none());
        assert!(!commands.iter().any(is_write));
    }

    #[test]
    fn duplicate_auth_notification_is_ignored() {
        let mut r = ready();
        assert!(r.handle_event(Event::AuthChanged(Some(auth_user()))).is_empty());
        assert_eq!(r.selection(), &RoomSelection::Selected("default".to_string()));
    }
}
