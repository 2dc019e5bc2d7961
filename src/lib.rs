//! Client-side mirror of a hosted realtime chat database.
//!
//! The [`reconciler`] module holds the synchronous core that folds auth
//! and store notifications into view patches and write commands; the
//! [`session`] module drives it against pluggable backends.

pub mod auth;
pub mod blob;
pub mod error;
pub mod model;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod view;

pub use auth::{AuthUser, Authenticator, MemoryAuth};
pub use blob::{BlobStore, MemoryBlobStore};
pub use error::{Error, Result, RoomNameError};
pub use reconciler::{Action, Command, Event, Reconciler};
pub use session::Session;
pub use store::{MemoryStore, RemoteStore};
pub use view::{LogRenderer, Renderer, ViewPatch};
