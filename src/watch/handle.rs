//! Subscription handles.

use crate::operation::DedupKey;
use crate::watch::WatchRegistry;
use crate::watch::query_watch::{QueryWatch, SubscriberId, WatchSnapshot};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A subscriber's attachment to a shared [`QueryWatch`].
///
/// Dropping the handle (or calling [`SubscriptionHandle::unsubscribe`])
/// detaches the subscriber; the watch is cancelled when its last subscriber
/// leaves. The handle's token is cancelled synchronously on detach and
/// whenever the whole watch is cancelled.
pub struct SubscriptionHandle {
    registry: Arc<WatchRegistry>,
    watch: Arc<QueryWatch>,
    subscriber: SubscriberId,
    token: CancellationToken,
    detached: bool,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        registry: Arc<WatchRegistry>,
        watch: Arc<QueryWatch>,
        subscriber: SubscriberId,
        token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            watch,
            subscriber,
            token,
            detached: false,
        }
    }

    /// Dedup key of the underlying watch.
    pub fn key(&self) -> &DedupKey {
        self.watch.key()
    }

    /// The shared watch.
    pub fn watch(&self) -> &Arc<QueryWatch> {
        &self.watch
    }

    /// Latest snapshot of the underlying watch.
    pub fn snapshot(&self) -> WatchSnapshot {
        self.watch.snapshot()
    }

    /// True once this subscription can no longer receive callbacks.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancellation token of this subscription.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Detach from the watch.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.registry.detach(&self.watch, self.subscriber);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", self.watch.key())
            .field("subscriber", &self.subscriber)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
