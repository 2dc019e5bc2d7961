use std::sync::Arc;

use log::info;

use chat_mirror::reconciler::Action;
use chat_mirror::{LogRenderer, MemoryAuth, MemoryBlobStore, MemoryStore, Session};

/// Scripted walkthrough of a session against the in-memory backends.
/// Run with RUST_LOG=debug to watch the patch stream.
#[tokio::main]
async fn main() {
    env_logger::init();

    let store = Arc::new(MemoryStore::default());
    let auth = Arc::new(MemoryAuth::default());
    let blobs = Arc::new(MemoryBlobStore::default());

    let mut session = Session::connect(store, auth, blobs, LogRenderer, None)
        .await
        .expect("backends are in-memory");

    let user = session
        .sign_up("alice@example.com", "hunter2")
        .await
        .expect("fresh account");
    info!("signed in as {} ({})", user.email, user.uid);

    session
        .act(Action::SetNickname("alice".to_string()))
        .await
        .expect("nickname write");

    session
        .act(Action::PostMessage("hello, room".to_string()))
        .await
        .expect("message write");

    session
        .act(Action::CreateRoom("team-1".to_string()))
        .await
        .expect("room create");
    session
        .act(Action::PostMessage("first post in team-1".to_string()))
        .await
        .expect("message write");

    session.sign_out().await.expect("sign out");
    info!("session complete");
}
