/// Session lifecycle coordination.
///
/// The [`LifecycleCoordinator`] drives the application from launch through
/// authentication and hydration to the ready state and back out through
/// sign-out. It exclusively owns the [`CacheClient`] of the current session:
/// the cache is created when the session starts hydrating and torn down
/// when it signs out, never shared across sessions.
///
/// ## Rules
///
/// - Phase changes are serialized. A request made while another one is
///   still running waits its turn.
/// - Loading phases stay visible for at least
///   [`LifecycleConfig::min_loading_duration`].
/// - Sign-out cancels every watch before the cache is cleared.
/// - An authentication failure while [`SessionPhase::Hydrated`] forces a
///   sign-out. Any failure while hydrating ends in [`SessionPhase::Error`],
///   from which [`LifecycleCoordinator::retry`] starts over.
///
/// ```text
/// start() ─▶ Initializing ─▶ Authenticating ─▶ restored? ─▶ Authenticated ─▶ Hydrating ─▶ Hydrated
///                                                   └──────▶ Unauthenticated ◀── sign_out()
/// ```
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{CacheClient, SessionEvent};
use crate::error::{CacheError, CacheResult};
use crate::store::{CacheConfig, DurableConfig, VolatileConfig};
use crate::watch::SubscriptionHandle;

mod phase;
mod session;

pub use phase::{PhaseState, SessionPhase};
pub use session::{
    Authenticator, Credentials, HydrationPlan, Session, TransportFactory, user_cache_dir,
};

/// Lifecycle configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Minimum time a loading phase stays visible (default: 500ms)
    pub min_loading_duration: Duration,

    /// Root directory for per-user durable tiers
    pub cache_root: PathBuf,

    /// Volatile tier capacity of each session cache
    pub volatile_capacity: usize,

    /// Back session caches with a durable tier
    pub durable_enabled: bool,

    /// Capacity of each session's change broadcast
    pub change_channel_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_loading_duration: Duration::from_millis(500),
            cache_root: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("pantry-cache"),
            volatile_capacity: VolatileConfig::default().capacity,
            durable_enabled: true,
            change_channel_capacity: 256,
        }
    }
}

impl LifecycleConfig {
    /// Cache configuration for one session.
    pub fn cache_config(&self, session: &Session) -> CacheConfig {
        CacheConfig {
            volatile: VolatileConfig {
                capacity: self.volatile_capacity,
            },
            durable: self
                .durable_enabled
                .then(|| DurableConfig::new(user_cache_dir(&self.cache_root, &session.user_id))),
            change_channel_capacity: self.change_channel_capacity,
        }
    }
}

/// Everything that lives exactly as long as one authenticated session.
struct ActiveSession {
    session: Session,
    client: Option<CacheClient>,
    handles: Vec<SubscriptionHandle>,
    auth_watch: Option<CancellationToken>,
    /// Authentication failure reported before the session was hydrated
    rejected: Option<CacheError>,
}

impl ActiveSession {
    fn new(session: Session) -> Self {
        Self {
            session,
            client: None,
            handles: Vec::new(),
            auth_watch: None,
            rejected: None,
        }
    }

    /// Sign-out teardown. Watches go first so clearing the cache cannot
    /// reach a live watch.
    fn teardown(mut self) -> Session {
        if let Some(token) = self.auth_watch.take() {
            token.cancel();
        }
        if let Some(client) = self.client.take() {
            client.teardown();
            self.handles.clear();
        }
        self.session
    }

    /// Drop a half-built session. Durable data is left on disk.
    fn abandon(mut self) {
        if let Some(token) = self.auth_watch.take() {
            token.cancel();
        }
        if let Some(client) = self.client.take() {
            client.close();
            client.cancel_all();
            client.cancel_listeners();
            self.handles.clear();
        }
    }
}

struct Inner {
    config: LifecycleConfig,
    authenticator: Arc<dyn Authenticator>,
    transports: Arc<dyn TransportFactory>,
    hydration: Arc<dyn HydrationPlan>,
    ops: AsyncMutex<()>,
    state: watch::Sender<PhaseState>,
    entered_at: Mutex<Instant>,
    active: Mutex<Option<ActiveSession>>,
}

/// Session phase state machine owning the session's cache.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    inner: Arc<Inner>,
}

impl LifecycleCoordinator {
    /// Create a coordinator in [`SessionPhase::Launching`].
    pub fn new(
        config: LifecycleConfig,
        authenticator: Arc<dyn Authenticator>,
        transports: Arc<dyn TransportFactory>,
        hydration: Arc<dyn HydrationPlan>,
    ) -> Self {
        let (state, _) = watch::channel(PhaseState::initial());
        Self {
            inner: Arc::new(Inner {
                config,
                authenticator,
                transports,
                hydration,
                ops: AsyncMutex::new(()),
                state,
                entered_at: Mutex::new(Instant::now()),
                active: Mutex::new(None),
            }),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.borrow().phase
    }

    /// Current published state.
    pub fn state(&self) -> PhaseState {
        self.inner.state.borrow().clone()
    }

    /// Receiver for phase changes.
    pub fn phases(&self) -> watch::Receiver<PhaseState> {
        self.inner.state.subscribe()
    }

    /// Cache client of the current session.
    pub fn client(&self) -> Option<CacheClient> {
        self.inner
            .active
            .lock()
            .as_ref()
            .and_then(|active| active.client.clone())
    }

    /// The current session.
    pub fn session(&self) -> Option<Session> {
        self.inner.active.lock().as_ref().map(|active| active.session.clone())
    }

    /// Leave `Launching`: restore a persisted session if there is one and
    /// hydrate it, otherwise settle in `Unauthenticated`.
    pub async fn start(&self) -> CacheResult<SessionPhase> {
        let _ops = self.inner.ops.lock().await;
        self.transition(SessionPhase::Initializing, None).await?;
        self.boot().await
    }

    /// Start over from `Error`.
    pub async fn retry(&self) -> CacheResult<SessionPhase> {
        let _ops = self.inner.ops.lock().await;
        self.transition(SessionPhase::Initializing, None).await?;
        self.boot().await
    }

    /// Sign in from `Unauthenticated` and hydrate the new session.
    pub async fn sign_in(&self, credentials: &Credentials) -> CacheResult<SessionPhase> {
        let _ops = self.inner.ops.lock().await;
        self.transition(SessionPhase::Authenticating, None).await?;
        match self.inner.authenticator.sign_in(credentials).await {
            Ok(session) => self.establish(session).await,
            Err(e) => self.authentication_failed(e).await,
        }
    }

    /// Sign out and tear the session down.
    pub async fn sign_out(&self) -> CacheResult<SessionPhase> {
        let _ops = self.inner.ops.lock().await;
        self.sign_out_locked(None).await
    }

    /// Renew the session token in place. A rejected refresh signs out.
    pub async fn refresh_session(&self) -> CacheResult<()> {
        let _ops = self.inner.ops.lock().await;
        let Some(current) = self.session() else {
            return Err(CacheError::SessionUnavailable(
                "no session to refresh".to_string(),
            ));
        };

        match self.inner.authenticator.refresh(&current).await {
            Ok(next) => {
                if let Some(active) = self.inner.active.lock().as_mut() {
                    active.session = active.session.refreshed(next);
                }
                debug!(user = %current.user_id, "Session refreshed");
                Ok(())
            }
            Err(e) if e.is_authentication() => {
                warn!(error = %e, "Session refresh rejected, signing out");
                self.sign_out_locked(Some(e.clone())).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the volatile tier of the current session's cache.
    pub fn handle_memory_pressure(&self) -> usize {
        self.client()
            .map(|client| client.handle_memory_pressure())
            .unwrap_or(0)
    }

    async fn boot(&self) -> CacheResult<SessionPhase> {
        self.transition(SessionPhase::Authenticating, None).await?;
        match self.inner.authenticator.restore_session().await {
            Ok(Some(session)) if session.is_expired() => {
                debug!(user = %session.user_id, "Restored session expired, refreshing");
                match self.inner.authenticator.refresh(&session).await {
                    Ok(next) => self.establish(session.refreshed(next)).await,
                    Err(e) => self.authentication_failed(e).await,
                }
            }
            Ok(Some(session)) => self.establish(session).await,
            Ok(None) => {
                self.transition(SessionPhase::Unauthenticated, None).await?;
                Ok(SessionPhase::Unauthenticated)
            }
            Err(e) => self.authentication_failed(e).await,
        }
    }

    async fn authentication_failed(&self, error: CacheError) -> CacheResult<SessionPhase> {
        let next = if error.is_authentication() {
            SessionPhase::Unauthenticated
        } else {
            SessionPhase::Error
        };
        warn!(error = %error, next = %next, "Authentication failed");
        self.transition(next, Some(error)).await?;
        Ok(next)
    }

    async fn establish(&self, session: Session) -> CacheResult<SessionPhase> {
        *self.inner.active.lock() = Some(ActiveSession::new(session.clone()));
        self.transition(SessionPhase::Authenticated, None).await?;
        self.transition(SessionPhase::Hydrating, None).await?;

        let transport = match self.inner.transports.connect(&session).await {
            Ok(transport) => transport,
            Err(e) => return self.hydration_failed(e).await,
        };

        let client = CacheClient::new(self.inner.config.cache_config(&session), transport);
        let auth_watch = self.watch_authentication(&client, &session);
        if let Some(active) = self.inner.active.lock().as_mut() {
            active.client = Some(client.clone());
            active.auth_watch = Some(auth_watch);
        }

        match self.inner.hydration.hydrate(&client).await {
            Ok(handles) => {
                if let Some(active) = self.inner.active.lock().as_mut() {
                    active.handles = handles;
                }
                if let Some(error) = self.take_rejection() {
                    return self.hydration_failed(error).await;
                }
                self.transition(SessionPhase::Hydrated, None).await?;

                // Rejections reported while the loading phase was still shown.
                if let Some(error) = self.take_rejection() {
                    warn!(error = %error, "Session rejected while hydrating, forcing sign-out");
                    return self.sign_out_locked(Some(error)).await;
                }
                Ok(SessionPhase::Hydrated)
            }
            Err(e) => self.hydration_failed(e).await,
        }
    }

    async fn hydration_failed(&self, error: CacheError) -> CacheResult<SessionPhase> {
        let active = self.inner.active.lock().take();
        if let Some(active) = active {
            active.abandon();
        }
        warn!(error = %error, "Hydration failed");
        self.transition(SessionPhase::Error, Some(error)).await?;
        Ok(SessionPhase::Error)
    }

    async fn sign_out_locked(&self, reason: Option<CacheError>) -> CacheResult<SessionPhase> {
        self.transition(SessionPhase::SigningOut, None).await?;

        let active = self.inner.active.lock().take();
        if let Some(active) = active {
            let session = active.teardown();
            if let Err(e) = self.inner.authenticator.sign_out(&session).await {
                warn!(error = %e, "Remote sign-out failed, local session dropped anyway");
            }
        }

        self.transition(SessionPhase::Unauthenticated, reason).await?;
        Ok(SessionPhase::Unauthenticated)
    }

    fn take_rejection(&self) -> Option<CacheError> {
        self.inner
            .active
            .lock()
            .as_mut()
            .and_then(|active| active.rejected.take())
    }

    /// Record a rejection of the current session. Returns false if the
    /// rejected session is no longer current.
    fn record_rejection(&self, session_id: &str, error: CacheError) -> bool {
        let mut active = self.inner.active.lock();
        match active.as_mut() {
            Some(active) if active.session.session_id == session_id => {
                active.rejected.get_or_insert(error);
                true
            }
            _ => false,
        }
    }

    /// Forced sign-out after the remote rejected the session. Ignored unless
    /// the rejected session is still the current, hydrated one.
    async fn force_sign_out(&self, session_id: &str, error: CacheError) -> bool {
        let _ops = self.inner.ops.lock().await;
        let current = self
            .inner
            .active
            .lock()
            .as_ref()
            .is_some_and(|active| active.session.session_id == session_id);
        if !current || self.phase() != SessionPhase::Hydrated {
            return false;
        }

        warn!(error = %error, "Session rejected by remote, forcing sign-out");
        self.sign_out_locked(Some(error)).await.is_ok()
    }

    fn watch_authentication(&self, client: &CacheClient, session: &Session) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let mut events = client.session_events();
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let session_id = session.session_id.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(SessionEvent::AuthenticationFailed { operation, message }) => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        let coordinator = LifecycleCoordinator { inner };
                        let error = CacheError::Authentication(message);
                        // Recorded first so hydration sees it if the phase
                        // has not reached Hydrated yet.
                        if !coordinator.record_rejection(&session_id, error.clone()) {
                            break;
                        }
                        if coordinator.phase() != SessionPhase::Hydrated {
                            debug!(operation = %operation, "Authentication failure while hydrating");
                            continue;
                        }
                        if coordinator
                            .force_sign_out(&session_id, error)
                            .await
                        {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        token
    }

    async fn transition(&self, next: SessionPhase, error: Option<CacheError>) -> CacheResult<()> {
        let current = self.phase();
        if !current.can_transition_to(next) {
            return Err(CacheError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        if current.is_loading() {
            let entered = *self.inner.entered_at.lock();
            let shown = entered.elapsed();
            let minimum = self.inner.config.min_loading_duration;
            if shown < minimum {
                tokio::time::sleep(minimum - shown).await;
            }
        }

        let user = self
            .inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.session.user_id.clone());
        *self.inner.entered_at.lock() = Instant::now();
        self.inner.state.send_replace(PhaseState {
            phase: next,
            since: Utc::now(),
            last_error: error,
            user,
        });

        info!(from = %current, to = %next, "Session phase changed");
        Ok(())
    }
}
