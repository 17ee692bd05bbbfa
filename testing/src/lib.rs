//! # Tickethold Testing
//!
//! Testing utilities for the tickethold reservation layer.
//!
//! This crate provides:
//! - Deterministic clocks (`FixedClock`, `ManualClock`)
//! - `ScriptedAuthority`, an in-memory remote authority that records calls and
//!   replays scripted outcomes
//! - Fixtures for inventory items and events
//! - Proptest strategies for hold operation sequences
//!
//! ## Example
//!
//! ```ignore
//! use tickethold_testing::{ScriptedAuthority, fixtures, test_clock};
//!
//! #[tokio::test]
//! async fn test_hold_is_notified() {
//!     let gateway = Arc::new(ScriptedAuthority::new());
//!     let ctx = ReservationContext::new(config, gateway.clone(), Arc::new(test_clock()))?;
//!     ctx.sync_collection(&fixtures::collection(), vec![fixtures::ticket_type("ga", 100, 80, 5)])?;
//!
//!     ctx.holds().request_hold(&ItemId::new("ga"), 2, &HolderId::new("alice"))?;
//!     gateway.wait_for_calls(1).await;
//! }
//! ```

use chrono::{DateTime, Utc};
use tickethold_core::environment::Clock;

/// Mock implementations of the environment and the remote authority
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::Duration;
    use tickethold_core::error::GatewayError;
    use tickethold_core::gateway::{GatewayResult, MutationRequest, RemoteAuthority};
    use tickethold_core::types::{HolderId, ItemId};
    use tokio::sync::{Notify, watch};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use tickethold_testing::mocks::FixedClock;
    /// use tickethold_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Share it as `Arc<ManualClock>` between the code under test and the test
    /// body, then [`advance`](Self::advance) it alongside
    /// `tokio::time::advance` or on its own to simulate a stalled timer.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use tickethold_testing::mocks::ManualClock;
    /// use tickethold_core::environment::Clock;
    ///
    /// let clock = ManualClock::starting_at_test_epoch();
    /// let start = clock.now();
    /// clock.advance(Duration::from_secs(60));
    /// assert_eq!((clock.now() - start).num_seconds(), 60);
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Create a manual clock at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Create a manual clock at the same instant as [`test_clock`]
        #[must_use]
        pub fn starting_at_test_epoch() -> Self {
            Self::new(test_clock().now())
        }

        /// Move the clock forward by `by`.
        pub fn advance(&self, by: Duration) {
            let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            let mut time = lock(&self.time);
            *time = time.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *lock(&self.time) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *lock(&self.time)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// A call received by [`ScriptedAuthority`].
    #[derive(Debug, Clone, PartialEq)]
    pub enum AuthorityCall {
        /// `notify_hold`
        Hold {
            /// Item held
            item_id: ItemId,
            /// Units held
            quantity: u32,
            /// Holder
            holder_id: HolderId,
        },
        /// `notify_release`
        Release {
            /// Item released
            item_id: ItemId,
            /// Holder
            holder_id: HolderId,
        },
        /// `submit_mutation`
        Mutation(MutationRequest),
    }

    /// How [`ScriptedAuthority`] answers the next mutation.
    #[derive(Debug, Clone, PartialEq)]
    pub enum MutationResponse {
        /// Accept and return the submitted payload unchanged
        Echo,
        /// Accept and return this canonical value
        Respond(serde_json::Value),
        /// Fail with this error
        Reject(GatewayError),
    }

    #[derive(Debug)]
    struct Script {
        calls: Vec<AuthorityCall>,
        notify_failure: Option<GatewayError>,
        responses: VecDeque<MutationResponse>,
    }

    /// In-memory remote authority.
    ///
    /// Records every call in arrival order. Notifications succeed unless
    /// [`fail_notifications`](Self::fail_notifications) is set. Mutations
    /// consume scripted responses in order and echo the payload once the
    /// script runs out.
    #[derive(Debug)]
    pub struct ScriptedAuthority {
        script: Mutex<Script>,
        latency: Duration,
        gate: watch::Sender<bool>,
        changed: Notify,
    }

    impl Default for ScriptedAuthority {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ScriptedAuthority {
        /// Create an authority that accepts everything immediately
        #[must_use]
        pub fn new() -> Self {
            let (gate, _) = watch::channel(true);
            Self {
                script: Mutex::new(Script {
                    calls: Vec::new(),
                    notify_failure: None,
                    responses: VecDeque::new(),
                }),
                latency: Duration::ZERO,
                gate,
                changed: Notify::new(),
            }
        }

        /// Delay every answer by `latency` (tokio time)
        #[must_use]
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        /// Make hold/release notifications fail with `error` from now on
        pub fn fail_notifications(&self, error: GatewayError) {
            lock(&self.script).notify_failure = Some(error);
        }

        /// Make hold/release notifications succeed again
        pub fn succeed_notifications(&self) {
            lock(&self.script).notify_failure = None;
        }

        /// Queue the answer to a future mutation
        pub fn push_response(&self, response: MutationResponse) {
            lock(&self.script).responses.push_back(response);
        }

        /// Hold mutation answers until [`resume_mutations`](Self::resume_mutations)
        pub fn pause_mutations(&self) {
            self.gate.send_replace(false);
        }

        /// Release held mutation answers
        pub fn resume_mutations(&self) {
            self.gate.send_replace(true);
        }

        /// Every call received so far
        #[must_use]
        pub fn calls(&self) -> Vec<AuthorityCall> {
            lock(&self.script).calls.clone()
        }

        /// Submitted mutations, in order
        #[must_use]
        pub fn mutations(&self) -> Vec<MutationRequest> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    AuthorityCall::Mutation(request) => Some(request),
                    _ => None,
                })
                .collect()
        }

        /// Number of `notify_release` calls received
        #[must_use]
        pub fn release_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|call| matches!(call, AuthorityCall::Release { .. }))
                .count()
        }

        /// Wait until at least `count` calls have been received.
        pub async fn wait_for_calls(&self, count: usize) {
            loop {
                let notified = self.changed.notified();
                if lock(&self.script).calls.len() >= count {
                    return;
                }
                notified.await;
            }
        }

        fn record(&self, call: AuthorityCall) {
            lock(&self.script).calls.push(call);
            self.changed.notify_waiters();
        }

        async fn delay(&self) {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
        }

        fn notification_result(&self) -> GatewayResult<()> {
            lock(&self.script).notify_failure.clone().map_or(Ok(()), Err)
        }
    }

    impl RemoteAuthority for ScriptedAuthority {
        fn notify_hold(
            &self,
            item_id: ItemId,
            quantity: u32,
            holder_id: HolderId,
        ) -> BoxFuture<'_, GatewayResult<()>> {
            Box::pin(async move {
                self.record(AuthorityCall::Hold {
                    item_id,
                    quantity,
                    holder_id,
                });
                self.delay().await;
                self.notification_result()
            })
        }

        fn notify_release(
            &self,
            item_id: ItemId,
            holder_id: HolderId,
        ) -> BoxFuture<'_, GatewayResult<()>> {
            Box::pin(async move {
                self.record(AuthorityCall::Release { item_id, holder_id });
                self.delay().await;
                self.notification_result()
            })
        }

        fn submit_mutation(
            &self,
            request: MutationRequest,
        ) -> BoxFuture<'_, GatewayResult<serde_json::Value>> {
            Box::pin(async move {
                self.record(AuthorityCall::Mutation(request.clone()));
                self.delay().await;

                let mut gate = self.gate.subscribe();
                // The sender lives in `self`, so this only errors if we are gone.
                let _ = gate.wait_for(|open| *open).await;

                let response = lock(&self.script)
                    .responses
                    .pop_front()
                    .unwrap_or(MutationResponse::Echo);
                match response {
                    MutationResponse::Echo => Ok(request.payload),
                    MutationResponse::Respond(value) => Ok(value),
                    MutationResponse::Reject(error) => Err(error),
                }
            })
        }
    }
}

/// Ready-made domain values.
pub mod fixtures {
    use super::mocks::test_clock;
    use tickethold_core::environment::Clock;
    use tickethold_core::types::{CollectionId, EventId, EventRecord, InventoryItem, ItemId};

    /// The collection every fixture item belongs to
    #[must_use]
    pub fn collection() -> CollectionId {
        CollectionId::new("summer-fest")
    }

    /// A ticket type in [`collection`] with the given counters
    #[must_use]
    pub fn ticket_type(id: &str, capacity: u32, sold: u32, reserved: u32) -> InventoryItem {
        InventoryItem::new(ItemId::new(id), collection(), id.to_uppercase(), capacity)
            .with_committed(sold, reserved)
    }

    /// A draft event stamped at the test epoch
    #[must_use]
    pub fn event(id: &str, title: &str) -> EventRecord {
        EventRecord::new(EventId::new(id), title, test_clock().now())
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// One step of a hold workload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum HoldOp {
        /// Holder `holder` requests `quantity` units
        Request {
            /// Index into the holder pool
            holder: usize,
            /// Units requested (may be zero)
            quantity: u32,
        },
        /// Holder `holder` releases
        Release {
            /// Index into the holder pool
            holder: usize,
        },
        /// Time moves forward and the sweep runs
        Advance {
            /// Minutes elapsed
            minutes: u32,
        },
    }

    /// Sequences of up to `max_len` operations over `holders` holders.
    pub fn hold_ops(
        holders: usize,
        max_quantity: u32,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<HoldOp>> {
        let holders = holders.max(1);
        let op = prop_oneof![
            4 => (0..holders, 0..=max_quantity)
                .prop_map(|(holder, quantity)| HoldOp::Request { holder, quantity }),
            2 => (0..holders).prop_map(|holder| HoldOp::Release { holder }),
            1 => (0u32..30).prop_map(|minutes| HoldOp::Advance { minutes }),
        ];
        prop::collection::vec(op, 0..max_len)
    }

    /// `(capacity, sold, reserved)` triples with `sold + reserved <= capacity`.
    pub fn valid_counters(max_capacity: u32) -> impl Strategy<Value = (u32, u32, u32)> {
        (0..=max_capacity)
            .prop_flat_map(|capacity| (Just(capacity), 0..=capacity))
            .prop_flat_map(|(capacity, sold)| (Just(capacity), Just(sold), 0..=capacity - sold))
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Install a test-writer tracing subscriber filtered by `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use mocks::{
    AuthorityCall, FixedClock, ManualClock, MutationResponse, ScriptedAuthority, test_clock,
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tickethold_core::error::GatewayError;
    use tickethold_core::gateway::{MutationRequest, RemoteAuthority};
    use tickethold_core::types::{HolderId, ItemId};

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_at_test_epoch();
        let start = clock.now();
        clock.advance(Duration::from_secs(15 * 60));
        assert_eq!(clock.now() - start, chrono::Duration::minutes(15));
    }

    #[tokio::test]
    async fn test_scripted_authority_records_and_fails_notifications() {
        let authority = ScriptedAuthority::new();
        authority
            .notify_hold(ItemId::new("ga"), 2, HolderId::new("alice"))
            .await
            .unwrap();

        authority.fail_notifications(GatewayError::Timeout);
        let err = authority
            .notify_release(ItemId::new("ga"), HolderId::new("alice"))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout);
        assert_eq!(authority.calls().len(), 2);
        assert_eq!(authority.release_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_mutations_replay_in_order() {
        let authority = ScriptedAuthority::new();
        authority.push_response(MutationResponse::Reject(GatewayError::Rejected(
            "locked".to_string(),
        )));
        authority.push_response(MutationResponse::Respond(serde_json::json!({"v": 2})));

        let request = MutationRequest {
            kind: "event".to_string(),
            entity_id: "e1".to_string(),
            payload: serde_json::json!({"v": 1}),
        };
        assert!(authority.submit_mutation(request.clone()).await.is_err());
        assert_eq!(
            authority.submit_mutation(request.clone()).await.unwrap(),
            serde_json::json!({"v": 2})
        );
        // Script exhausted: echo
        assert_eq!(
            authority.submit_mutation(request).await.unwrap(),
            serde_json::json!({"v": 1})
        );
        assert_eq!(authority.mutations().len(), 3);
    }
}
