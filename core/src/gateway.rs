//! The remote inventory authority, as seen from this layer.
//!
//! Transport, authentication (bearer tokens, single-flight refresh on 401) and
//! retries belong to the implementor. The core only needs three calls that may
//! take arbitrarily long and may fail.

use crate::error::GatewayError;
use crate::types::{HolderId, ItemId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type returned by gateway calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// A mutation submitted for confirmation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Entity kind, used for routing (e.g. `"event"`)
    pub kind: String,
    /// Entity identifier
    pub entity_id: String,
    /// The locally computed provisional value
    pub payload: serde_json::Value,
}

/// Remote authority trait
///
/// Returns boxed futures so it stays dyn-compatible and can be shared as
/// `Arc<dyn RemoteAuthority>`.
pub trait RemoteAuthority: Send + Sync {
    /// Tell the server a hold was placed.
    ///
    /// # Errors
    ///
    /// Returns error if the server could not be notified.
    fn notify_hold(
        &self,
        item_id: ItemId,
        quantity: u32,
        holder_id: HolderId,
    ) -> BoxFuture<'_, GatewayResult<()>>;

    /// Tell the server a hold was released.
    ///
    /// # Errors
    ///
    /// Returns error if the server could not be notified.
    fn notify_release(&self, item_id: ItemId, holder_id: HolderId) -> BoxFuture<'_, GatewayResult<()>>;

    /// Submit a mutation and receive the canonical value.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the mutation or cannot be reached.
    fn submit_mutation(&self, request: MutationRequest) -> BoxFuture<'_, GatewayResult<serde_json::Value>>;
}

/// Which best-effort notification failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOp {
    /// `notify_hold`
    Hold,
    /// `notify_release`
    Release,
}

impl NotifyOp {
    /// Metric/log label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::Release => "release",
        }
    }
}

impl fmt::Display for NotifyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A best-effort notification failed after the local change was committed.
///
/// The local hold state is not rolled back. Subscribers decide whether to
/// show a banner, retry, or resync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayWarning {
    /// Which call failed
    pub op: NotifyOp,
    /// Item involved
    pub item_id: ItemId,
    /// Holder involved
    pub holder_id: HolderId,
    /// What went wrong
    pub error: GatewayError,
    /// When the failure was observed
    pub observed_at: DateTime<Utc>,
}

impl fmt::Display for GatewayWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} notification for {}/{} failed: {}",
            self.op, self.item_id, self.holder_id, self.error
        )
    }
}
