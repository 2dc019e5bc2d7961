use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid room name: {0}")]
    RoomName(#[from] RoomNameError),

    /// Deleting the protected default room is an invariant violation,
    /// not reachable through a well-behaved UI.
    #[error("the {0:?} room is protected and cannot be deleted")]
    ProtectedRoom(String),

    #[error("no room is currently selected")]
    NoRoomSelected,

    #[error("no user is signed in")]
    NotSignedIn,

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("auth operation failed: {0}")]
    Auth(String),

    #[error("blob operation failed: {0}")]
    Blob(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomNameError {
    #[error("room names may not contain any of . $ # [ ] / (found {0:?})")]
    ForbiddenCharacter(char),

    #[error("room names must be between 1 and 20 characters (got {0})")]
    Length(usize),

    #[error("a room named {0:?} already exists")]
    Duplicate(String),
}
