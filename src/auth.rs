use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque identity delivered by the auth backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub uid: String,
    pub email: String,
}

/// Auth backend: credential mutation plus auth-state notifications. `None`
/// on the subscription channel means signed out.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser>;

    async fn sign_out(&self) -> Result<()>;

    /// Registers `tx` for auth-state changes; the current state is
    /// delivered immediately.
    async fn subscribe(&self, tx: UnboundedSender<Option<AuthUser>>) -> Result<()>;
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, (String, String)>, // email -> (password, uid)
    current: Option<AuthUser>,
    listeners: Vec<UnboundedSender<Option<AuthUser>>>,
}

impl Inner {
    fn notify(&self) {
        for tx in &self.listeners {
            let _ = tx.send(self.current.clone());
        }
    }
}

/// In-process auth backend for tests and the demo binary.
#[derive(Clone, Default)]
pub struct MemoryAuth {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Authenticator for MemoryAuth {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser> {
        let mut inner = self.inner.write().await;
        if inner.accounts.contains_key(email) {
            return Err(Error::Auth(format!("account already exists: {email}")));
        }

        let uid = Uuid::new_v4().to_string();
        inner
            .accounts
            .insert(email.to_string(), (password.to_string(), uid.clone()));

        let user = AuthUser {
            uid,
            email: email.to_string(),
        };
        inner.current = Some(user.clone());
        inner.notify();
        Ok(user)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser> {
        let mut inner = self.inner.write().await;
        let user = match inner.accounts.get(email) {
            Some((stored, uid)) if stored == password => AuthUser {
                uid: uid.clone(),
                email: email.to_string(),
            },
            Some(_) => return Err(Error::Auth("wrong password".to_string())),
            None => return Err(Error::Auth(format!("no such account: {email}"))),
        };

        inner.current = Some(user.clone());
        inner.notify();
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.current = None;
        inner.notify();
        Ok(())
    }

    async fn subscribe(&self, tx: UnboundedSender<Option<AuthUser>>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let _ = tx.send(inner.current.clone());
        inner.listeners.push(tx);
        Ok(())
    }
}
