//! Best-effort hold notifications.
//!
//! The local ledger is the source of truth for holds. The remote authority is
//! told about each placement and release from a spawned task that the caller
//! never waits for. A failed notification does not undo the local change: it
//! is logged, counted and broadcast as a [`GatewayWarning`] so a subscriber can
//! surface it or trigger a resync.

use crate::metrics;
use std::sync::Arc;
use tickethold_core::environment::Clock;
use tickethold_core::gateway::{GatewayWarning, NotifyOp, RemoteAuthority};
use tickethold_core::types::{Hold, HolderId, ItemId};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

/// Spawns gateway notifications and publishes their failures.
#[derive(Clone)]
pub struct GatewayNotifier {
    gateway: Arc<dyn RemoteAuthority>,
    warnings: broadcast::Sender<GatewayWarning>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
}

impl std::fmt::Debug for GatewayNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayNotifier")
            .field("subscribers", &self.warnings.receiver_count())
            .finish_non_exhaustive()
    }
}

impl GatewayNotifier {
    /// Creates a notifier whose warning channel buffers `warning_capacity`
    /// warnings per subscriber.
    ///
    /// `warning_capacity` must be non-zero.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn RemoteAuthority>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
        warning_capacity: usize,
    ) -> Self {
        let (warnings, _) = broadcast::channel(warning_capacity.max(1));
        Self {
            gateway,
            warnings,
            clock,
            runtime,
        }
    }

    /// The gateway notifications are sent to
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn RemoteAuthority> {
        &self.gateway
    }

    /// Subscribes to notification failures from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayWarning> {
        self.warnings.subscribe()
    }

    /// Tells the gateway `hold` was placed.
    pub fn hold(&self, hold: &Hold) {
        let hold = hold.clone();
        let notifier = self.clone();
        self.runtime.spawn(async move { notifier.send_hold(hold).await });
    }

    /// Tells the gateway `hold` was released.
    pub fn release(&self, hold: &Hold) {
        let hold = hold.clone();
        let notifier = self.clone();
        self.runtime.spawn(async move { notifier.send_release(hold).await });
    }

    /// Tells the gateway `previous` was released and then `hold` placed.
    ///
    /// Both go out from one task, so the release never overtakes the hold.
    pub fn replace(&self, previous: &Hold, hold: &Hold) {
        let previous = previous.clone();
        let hold = hold.clone();
        let notifier = self.clone();
        self.runtime.spawn(async move {
            notifier.send_release(previous).await;
            notifier.send_hold(hold).await;
        });
    }

    async fn send_hold(&self, hold: Hold) {
        let result = self
            .gateway
            .notify_hold(hold.item_id.clone(), hold.quantity, hold.holder_id.clone())
            .await;
        if let Err(error) = result {
            self.report(NotifyOp::Hold, hold.item_id, hold.holder_id, error);
        }
    }

    async fn send_release(&self, hold: Hold) {
        let result = self
            .gateway
            .notify_release(hold.item_id.clone(), hold.holder_id.clone())
            .await;
        if let Err(error) = result {
            self.report(NotifyOp::Release, hold.item_id, hold.holder_id, error);
        }
    }

    fn report(
        &self,
        op: NotifyOp,
        item_id: ItemId,
        holder_id: HolderId,
        error: tickethold_core::GatewayError,
    ) {
        tracing::warn!(
            op = %op,
            item = %item_id,
            holder = %holder_id,
            error = %error,
            "Gateway notification failed; local hold state kept"
        );
        metrics::record_notify_failure(op.as_str());

        // No subscribers is fine: the warning has been logged and counted.
        let _ = self.warnings.send(GatewayWarning {
            op,
            item_id,
            holder_id,
            error,
            observed_at: self.clock.now(),
        });
    }
}
