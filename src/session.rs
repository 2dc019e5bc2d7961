use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, warn};
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::auth::{AuthUser, Authenticator};
use crate::blob::BlobStore;
use crate::error::Result;
use crate::model::{Favorite, Message, DEFAULT_PROFILE_IMAGE_URL};
use crate::reconciler::{Action, Command, Event, Reconciler};
use crate::store::{paths, server_timestamp, Notification, RemoteStore};
use crate::view::Renderer;

/// Driver around the reconciliation core: executes its commands against
/// the backends, routes store notifications back into it, and applies
/// view patches through the renderer. Single consumer of all channels,
/// so every mirror mutation happens on one logical event loop.
pub struct Session<R: Renderer> {
    store: Arc<dyn RemoteStore>,
    auth: Arc<dyn Authenticator>,
    blobs: Arc<dyn BlobStore>,
    renderer: R,
    core: Reconciler,
    store_tx: tokio::sync::mpsc::UnboundedSender<Notification>,
    store_rx: UnboundedReceiver<Notification>,
    auth_rx: UnboundedReceiver<Option<AuthUser>>,
    /// Stand-in for the address-bar fragment, stored URL-encoded.
    fragment: Option<String>,
}

impl<R: Renderer> Session<R> {
    /// Wires a session to its backends. `initial_fragment` is the raw
    /// URL-encoded fragment present at load time, without the `#`.
    pub async fn connect(
        store: Arc<dyn RemoteStore>,
        auth: Arc<dyn Authenticator>,
        blobs: Arc<dyn BlobStore>,
        renderer: R,
        initial_fragment: Option<String>,
    ) -> Result<Self> {
        let (store_tx, store_rx) = unbounded_channel();
        let (auth_tx, auth_rx) = unbounded_channel();
        auth.subscribe(auth_tx).await?;

        let decoded = initial_fragment.as_deref().map(decode_fragment);
        Ok(Session {
            store,
            auth,
            blobs,
            renderer,
            core: Reconciler::new(decoded),
            store_tx,
            store_rx,
            auth_rx,
            fragment: initial_fragment,
        })
    }

    pub fn core(&self) -> &Reconciler {
        &self.core
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    /// Current URL-encoded fragment value.
    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    pub async fn sign_up(&mut self, email: &str, password: &str) -> Result<AuthUser> {
        let user = self.auth.sign_up(email, password).await?;
        self.settle().await?;
        Ok(user)
    }

    pub async fn sign_in(&mut self, email: &str, password: &str) -> Result<AuthUser> {
        let user = self.auth.sign_in(email, password).await?;
        self.settle().await?;
        Ok(user)
    }

    pub async fn sign_out(&mut self) -> Result<()> {
        self.auth.sign_out().await?;
        self.settle().await
    }

    /// Runs a user action, then processes whatever it stirred up.
    pub async fn act(&mut self, action: Action) -> Result<()> {
        let commands = self.core.handle_action(action)?;
        let mut queue = VecDeque::new();
        self.execute(commands, &mut queue).await;
        self.pump(queue).await
    }

    /// Processes pending notifications until the session is quiescent.
    pub async fn settle(&mut self) -> Result<()> {
        self.pump(VecDeque::new()).await
    }

    async fn pump(&mut self, mut queue: VecDeque<Event>) -> Result<()> {
        loop {
            while let Ok(user) = self.auth_rx.try_recv() {
                queue.push_back(Event::AuthChanged(user));
            }
            self.drain_store(&mut queue);

            let Some(event) = queue.pop_front() else {
                return Ok(());
            };
            let commands = self.core.handle_event(event);
            self.execute(commands, &mut queue).await;
        }
    }

    fn drain_store(&mut self, queue: &mut VecDeque<Event>) {
        while let Ok(notification) = self.store_rx.try_recv() {
            if let Some(event) = route_notification(notification) {
                queue.push_back(event);
            }
        }
    }

    async fn execute(&mut self, commands: Vec<Command>, queue: &mut VecDeque<Event>) {
        for command in commands {
            if let Err(err) = self.run_command(command, queue).await {
                // Failed writes leave the UI in its pre-write state; the
                // rest of the batch is abandoned and nothing is retried.
                error!("command failed: {err}");
                break;
            }
        }
    }

    async fn run_command(&mut self, command: Command, queue: &mut VecDeque<Event>) -> Result<()> {
        match command {
            Command::Set { path, value } => self.store.set(&path, value).await,
            Command::SetWithPriority {
                path,
                value,
                priority,
            } => self.store.set_with_priority(&path, value, priority).await,
            Command::Update { path, value } => self.store.update(&path, value).await,
            Command::Remove { path } => self.store.remove(&path).await,
            Command::Push { path, value } => {
                self.store.push(&path, value).await?;
                Ok(())
            }
            Command::Subscribe { path, kind } => {
                self.store.subscribe(&path, kind, self.store_tx.clone()).await
            }
            Command::Unsubscribe { path, kind } => self.store.unsubscribe(&path, kind).await,
            Command::SetFragment(room) => {
                let encoded = room
                    .as_deref()
                    .map(|name| urlencoding::encode(name).into_owned());
                if encoded == self.fragment {
                    return Ok(());
                }
                self.fragment = encoded;
                // Store callbacks already pending fire before the
                // fragment-change notification, matching the hosted
                // store's synchronous local echo.
                self.drain_store(queue);
                queue.push_back(Event::FragmentChanged(room));
                Ok(())
            }
            Command::ResolveProfileImage { uid, location } => {
                let url = match self.blobs.download_url(&location).await {
                    Ok(url) => url,
                    Err(err) => {
                        error!("profile image download failed for {uid}: {err}");
                        DEFAULT_PROFILE_IMAGE_URL.to_string()
                    }
                };
                queue.push_back(Event::ProfileImageResolved { uid, url });
                Ok(())
            }
            Command::StoreProfileImage {
                uid,
                bytes,
                content_type,
            } => {
                let location = self
                    .blobs
                    .put(&format!("profile-images/{uid}"), bytes, &content_type)
                    .await?;
                self.store
                    .update(
                        &paths::user(&uid),
                        json!({
                            "profileImageLocation": location,
                            "updatedAt": server_timestamp(),
                        }),
                    )
                    .await
            }
            Command::Render(patch) => {
                self.renderer.apply(patch);
                Ok(())
            }
        }
    }
}

fn decode_fragment(fragment: &str) -> String {
    match urlencoding::decode(fragment) {
        Ok(decoded) => decoded.into_owned(),
        Err(err) => {
            warn!("undecodable fragment {fragment:?}: {err}");
            fragment.to_string()
        }
    }
}

/// Maps a raw store notification onto a core event, by path shape.
fn route_notification(notification: Notification) -> Option<Event> {
    match notification {
        Notification::Value { path, snapshot } => match path.as_str() {
            paths::USERS => Some(Event::UsersSnapshot(snapshot)),
            paths::ROOMS => Some(Event::RoomsSnapshot(snapshot)),
            other => {
                debug!("ignoring value snapshot for {other}");
                None
            }
        },
        Notification::ChildAdded { path, key, value } => {
            if let Some(room) = path.strip_prefix("messages/") {
                match serde_json::from_value::<Message>(value) {
                    Ok(message) => Some(Event::MessageAdded {
                        room: room.to_string(),
                        message_id: key,
                        message,
                    }),
                    Err(err) => {
                        warn!("malformed message {key}: {err}");
                        None
                    }
                }
            } else if path.starts_with("favorites/") {
                match serde_json::from_value::<Favorite>(value) {
                    Ok(favorite) => Some(Event::FavoriteAdded {
                        message_id: key,
                        favorite,
                    }),
                    Err(err) => {
                        warn!("malformed favorite {key}: {err}");
                        None
                    }
                }
            } else {
                debug!("ignoring child event for {path}");
                None
            }
        }
        Notification::ChildRemoved { path, key } => {
            if path.starts_with("favorites/") {
                Some(Event::FavoriteRemoved { message_id: key })
            } else {
                None
            }
        }
    }
}
