//! # Pantry Cache: normalized, reactive, offline-first
//!
//! `pantry-cache` is the client-side data layer of the pantry app. It gives
//! view-models and business services:
//! - **A normalized cache** - every entity stored once under `type:id`, deep-merged
//! - **Two tiers** - a bounded in-memory tier over an on-disk tier that survives restarts
//! - **Live queries** - deduplicated watches that re-emit only when their data changes
//! - **Session lifecycle** - one cache per signed-in user, torn down in a safe order
//!
//! ## Quick Start
//!
//! ```ignore
//! use pantry_cache::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run(transport: Arc<dyn Transport>) -> CacheResult<()> {
//! let client = CacheClient::new(CacheConfig::in_memory(), transport);
//!
//! let items = Operation::query(
//!     "pantryItems",
//!     Selection::all().nested("items", Selection::fields(["name", "quantity"])),
//! );
//!
//! // Live subscription: called on loading, on the value, and on every change
//! let handle = client.subscribe(
//!     items.clone(),
//!     json!({"household": "h1"}),
//!     CachePolicy::CacheThenNetwork,
//!     |snapshot| println!("{:?}", snapshot.value),
//! );
//!
//! // One-shot read
//! let value = client.query(items, json!({"household": "h1"}), CachePolicy::CacheElseNetwork).await?;
//!
//! drop(handle); // last subscriber gone: the watch is cancelled
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! 1. **Storage** (`store`) - [`VolatileStore`] and [`DurableStore`] behind the
//!    [`RecordStore`] trait, combined by [`TieredCache`]
//! 2. **Reactivity** (`notifier`, `projection`, `watch`) - merges report changed
//!    keys, the [`ChangeNotifier`] maps them to the watches that read them, and
//!    each [`QueryWatch`] re-projects its result
//! 3. **Facade** (`client`) - [`CacheClient`] drives fetches through a
//!    [`Transport`] and serializes every merge
//! 4. **Lifecycle** (`lifecycle`) - [`LifecycleCoordinator`] creates and tears
//!    down the client at session boundaries
//!
//! ## Thread Safety
//!
//! [`CacheClient`] and [`LifecycleCoordinator`] are cheap to clone (Arc
//! internally) and can be shared across tasks.

// Internal modules
mod error;
mod types;

pub mod client;
pub mod lifecycle;
pub mod notifier;
pub mod operation;
pub mod projection;
pub mod store;
pub mod transport;
pub mod watch;

// Public API exports
pub use client::{CacheClient, ClientStats, ListenHandle, SessionEvent};
pub use error::{CacheError, CacheResult};
pub use types::{CacheKey, FieldValue, Record, RecordSet};

pub use lifecycle::{
    Authenticator, Credentials, HydrationPlan, LifecycleConfig, LifecycleCoordinator,
    PhaseState, Session, SessionPhase, TransportFactory,
};
pub use notifier::{ChangeBatch, ChangeNotifier, ChangeSource, NotifierStats, WatchId};
pub use operation::{CachePolicy, DedupKey, Operation, OperationKind, Selection};
pub use projection::Projection;
pub use store::{
    CacheConfig, DurableConfig, DurableStore, KeyPattern, RecordStore, TieredCache, TieredStats,
    VolatileConfig, VolatileStore,
};
pub use transport::{OperationResult, RecordStream, Transport};
pub use watch::{
    DataSource, FetchPhase, QueryWatch, SubscriptionHandle, WatchInfo, WatchRegistry,
    WatchSnapshot,
};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use pantry_cache::prelude::*;
/// ```
pub mod prelude {
    pub use crate::client::{CacheClient, ListenHandle, SessionEvent};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::operation::{CachePolicy, Operation, Selection};
    pub use crate::store::{CacheConfig, DurableConfig, KeyPattern};
    pub use crate::transport::{OperationResult, Transport};
    pub use crate::types::{CacheKey, FieldValue, Record, RecordSet};
    pub use crate::watch::{DataSource, SubscriptionHandle, WatchSnapshot};
    pub use serde_json::{Value as JsonValue, json};

    // Lifecycle types
    pub use crate::lifecycle::{
        Authenticator, Credentials, HydrationPlan, LifecycleConfig, LifecycleCoordinator,
        Session, SessionPhase, TransportFactory,
    };
}
