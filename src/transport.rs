//! The remote transport collaborator.
//!
//! The cache does not speak any wire protocol. A [`Transport`] executes
//! operations against the server and hands back normalized records; the
//! cache merges them exactly the same way whether they came from a query,
//! a mutation or a push stream.

use crate::error::CacheResult;
use crate::operation::{CachePolicy, Operation};
use crate::types::{FieldValue, RecordSet};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value as JsonValue;

/// Normalized response of one operation.
#[derive(Debug, Clone)]
pub struct OperationResult {
    /// Every entity in the response, normalized
    pub records: RecordSet,
    /// The top-level result: usually a reference or a reference list
    pub root: FieldValue,
}

impl OperationResult {
    /// Build a result.
    pub fn new(records: RecordSet, root: impl Into<FieldValue>) -> Self {
        Self {
            records,
            root: root.into(),
        }
    }
}

/// Stream of server-pushed record sets.
pub type RecordStream = BoxStream<'static, CacheResult<RecordSet>>;

/// Remote execution of operations.
///
/// Implementations run on their own concurrency domain; the cache
/// marshals completions back onto its owner path before touching state.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One-shot fetch or mutation.
    async fn execute(
        &self,
        operation: &Operation,
        arguments: &JsonValue,
        policy: CachePolicy,
    ) -> CacheResult<OperationResult>;

    /// Open a server-push stream.
    async fn listen(&self, operation: &Operation, arguments: &JsonValue)
    -> CacheResult<RecordStream>;
}
