//! Authenticated sessions and the collaborators the coordinator drives.
//!
//! The coordinator never talks to an identity provider or a server itself.
//! It is handed an [`Authenticator`], a [`TransportFactory`] and a
//! [`HydrationPlan`], and sequences them.

use crate::client::CacheClient;
use crate::error::CacheResult;
use crate::transport::Transport;
use crate::watch::SubscriptionHandle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Length of the hashed user directory name.
const USER_DIR_LEN: usize = 16;

/// An authenticated session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Local identifier of this session
    pub session_id: String,
    /// Remote user identifier
    pub user_id: String,
    /// Bearer token handed to the transport
    pub token: String,
    /// When the token stops being accepted
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a session with a fresh local id.
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            token: token.into(),
            expires_at: None,
        }
    }

    /// Set the expiry.
    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check if the token has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }

    /// Replace the token after a refresh, keeping the local id.
    pub(crate) fn refreshed(&self, next: Session) -> Session {
        Session {
            session_id: self.session_id.clone(),
            ..next
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Sign-in input.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identifier: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Identity provider.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Restore a persisted session at launch, if any.
    async fn restore_session(&self) -> CacheResult<Option<Session>>;

    /// Exchange credentials for a session.
    async fn sign_in(&self, credentials: &Credentials) -> CacheResult<Session>;

    /// Renew the session token.
    async fn refresh(&self, session: &Session) -> CacheResult<Session>;

    /// Revoke the session remotely and forget any persisted token.
    async fn sign_out(&self, session: &Session) -> CacheResult<()>;
}

/// Builds the transport bound to one session.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, session: &Session) -> CacheResult<Arc<dyn Transport>>;
}

/// Baseline fetches and long-lived watches opened while hydrating.
#[async_trait]
pub trait HydrationPlan: Send + Sync {
    /// Populate the fresh cache and return the subscriptions the session
    /// keeps open until sign-out.
    async fn hydrate(&self, client: &CacheClient) -> CacheResult<Vec<SubscriptionHandle>>;
}

/// Durable tier directory of one user under `cache_root`.
pub fn user_cache_dir(cache_root: &Path, user_id: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(user_id.as_bytes()));
    cache_root.join(&digest[..USER_DIR_LEN])
}
