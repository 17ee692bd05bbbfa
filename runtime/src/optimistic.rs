//! Optimistic mutation coordination.
//!
//! A mutation is applied to the cache immediately, so every reader sees the
//! provisional value, and then confirmed with the remote authority in a
//! spawned task:
//!
//! ```text
//! apply_optimistic ──► Pending ──┬── gateway Ok(canonical) ──► Committed  (cache := canonical)
//!                                └── gateway Err / garbage  ──► RolledBack (cache := previous snapshot)
//! ```
//!
//! While an entity is pending, the coordinator owns its cache entry: a second
//! mutation fails fast with [`ReservationError::ConflictingMutation`] and
//! snapshot upserts are skipped. If the reconciliation task dies before the
//! authority answers, the previous snapshot is restored all the same.
//!
//! Entities whose invariants depend on state outside the cache admit edits
//! through a [`MutationGate`]; ticket types go through the hold ledger.

use crate::cache::{EntityCache, UpsertOutcome};
use crate::metrics;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tickethold_core::entity::Entity;
use tickethold_core::error::{GatewayError, ReservationError, Result};
use tickethold_core::gateway::{MutationRequest, RemoteAuthority};
use tickethold_core::types::{EventId, EventRecord, EventStatus};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Lifecycle of an optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Applied locally, awaiting the remote answer
    Pending,
    /// Confirmed; the cache holds the canonical value
    Committed,
    /// Refused; the cache holds the previous snapshot again
    RolledBack,
}

/// Bookkeeping for one in-flight mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticMutation<E: Entity> {
    entity_id: E::Id,
    previous_snapshot: E,
    pending_value: E,
    state: MutationState,
}

impl<E: Entity> OptimisticMutation<E> {
    /// Starts tracking a mutation from `previous_snapshot` to `pending_value`.
    #[must_use]
    pub fn new(previous_snapshot: E, pending_value: E) -> Self {
        Self {
            entity_id: previous_snapshot.id().clone(),
            previous_snapshot,
            pending_value,
            state: MutationState::Pending,
        }
    }

    /// Target entity
    #[must_use]
    pub const fn entity_id(&self) -> &E::Id {
        &self.entity_id
    }

    /// The value before the mutation
    #[must_use]
    pub const fn previous_snapshot(&self) -> &E {
        &self.previous_snapshot
    }

    /// The locally computed value
    #[must_use]
    pub const fn pending_value(&self) -> &E {
        &self.pending_value
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> MutationState {
        self.state
    }

    /// Marks the mutation committed.
    pub fn commit(&mut self) {
        self.state = MutationState::Committed;
    }

    /// Marks the mutation rolled back and returns the value to restore.
    #[must_use]
    pub fn roll_back(&mut self) -> E {
        self.state = MutationState::RolledBack;
        self.previous_snapshot.clone()
    }
}

/// A boxed edit of a cached entity.
pub type Edit<'a, E> = Box<dyn FnOnce(&E) -> E + 'a>;

/// Decides whether an optimistic edit may enter the cache.
pub trait MutationGate<E: Entity>: Send + Sync {
    /// Applies `edit` to the cached entry of `id` and marks it pending.
    ///
    /// Returns `(previous, provisional)`.
    ///
    /// # Errors
    ///
    /// Returns error if the edit is refused; the entry is left untouched.
    fn begin(&self, cache: &EntityCache<E>, id: &E::Id, edit: Edit<'_, E>) -> Result<(E, E)>;
}

/// Admits every edit that passes [`Entity::validate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Ungated;

impl<E: Entity> MutationGate<E> for Ungated {
    fn begin(&self, cache: &EntityCache<E>, id: &E::Id, edit: Edit<'_, E>) -> Result<(E, E)> {
        cache.begin_mutation(id, edit, |_, _| Ok(()))
    }
}

/// Handle to a mutation that has been applied locally.
///
/// Dropping it does not cancel reconciliation.
#[derive(Debug)]
pub struct PendingMutation<E: Entity> {
    provisional: E,
    outcome: oneshot::Receiver<Result<E>>,
}

impl<E: Entity> PendingMutation<E> {
    /// The value every reader sees until the mutation settles
    #[must_use]
    pub const fn provisional(&self) -> &E {
        &self.provisional
    }

    /// Waits for the remote answer.
    ///
    /// # Errors
    ///
    /// [`ReservationError::MutationRejected`] if the authority refused the
    /// mutation or reconciliation ended without an answer. The cache has
    /// already been restored either way.
    pub async fn settled(self) -> Result<E> {
        self.outcome
            .await
            .unwrap_or(Err(ReservationError::ShuttingDown))
    }
}

/// Applies mutations locally and reconciles them with the remote authority.
pub struct OptimisticCoordinator<E: Entity> {
    cache: Arc<EntityCache<E>>,
    gate: Arc<dyn MutationGate<E>>,
    gateway: Arc<dyn RemoteAuthority>,
    runtime: Handle,
    closed: AtomicBool,
}

impl<E: Entity> std::fmt::Debug for OptimisticCoordinator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticCoordinator")
            .field("kind", &E::KIND)
            .field("cached", &self.cache.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<E: Entity> OptimisticCoordinator<E> {
    /// Creates a coordinator over `cache`, spawning reconciliation on `runtime`.
    #[must_use]
    pub fn new(cache: Arc<EntityCache<E>>, gateway: Arc<dyn RemoteAuthority>, runtime: Handle) -> Self {
        Self::with_gate(cache, Arc::new(Ungated), gateway, runtime)
    }

    /// Like [`new`](Self::new), with edits admitted by `gate`.
    #[must_use]
    pub fn with_gate(
        cache: Arc<EntityCache<E>>,
        gate: Arc<dyn MutationGate<E>>,
        gateway: Arc<dyn RemoteAuthority>,
        runtime: Handle,
    ) -> Self {
        Self {
            cache,
            gate,
            gateway,
            runtime,
            closed: AtomicBool::new(false),
        }
    }

    /// The cache this coordinator writes to
    #[must_use]
    pub const fn cache(&self) -> &Arc<EntityCache<E>> {
        &self.cache
    }

    /// Current cached value, provisional while a mutation is pending.
    #[must_use]
    pub fn get(&self, id: &E::Id) -> Option<E> {
        self.cache.get(id)
    }

    /// Whether `id` has an unsettled mutation
    #[must_use]
    pub fn is_pending(&self, id: &E::Id) -> bool {
        self.cache.is_pending(id)
    }

    /// Seeds the cache with a fetched snapshot; pending entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot fails validation.
    pub fn upsert(&self, entity: E) -> Result<UpsertOutcome> {
        self.cache.upsert(entity)
    }

    /// Refuses further mutations. In-flight ones still settle.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Applies `mutate` to the cached entity now and confirms it in the
    /// background.
    ///
    /// # Errors
    ///
    /// Fails without changing anything with:
    /// - [`ReservationError::ShuttingDown`] after [`close`](Self::close)
    /// - [`ReservationError::UnknownEntity`] if `id` is not cached
    /// - [`ReservationError::ConflictingMutation`] if `id` is already pending
    /// - [`ReservationError::Serialization`] if the provisional value cannot
    ///   be encoded
    /// - any validation or gate error of the provisional value
    pub fn apply_optimistic(
        &self,
        id: &E::Id,
        mutate: impl FnOnce(&E) -> E,
    ) -> Result<PendingMutation<E>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReservationError::ShuttingDown);
        }

        let (previous, provisional) = match self.gate.begin(&self.cache, id, Box::new(mutate)) {
            Ok(values) => values,
            Err(err) => {
                if matches!(err, ReservationError::ConflictingMutation { .. }) {
                    tracing::debug!(kind = E::KIND, entity = %id, "Mutation refused: already pending");
                    metrics::record_mutation("conflict", None);
                }
                return Err(err);
            },
        };

        let payload = match serde_json::to_value(&provisional) {
            Ok(payload) => payload,
            Err(e) => {
                self.cache.settle_mutation(id, previous);
                return Err(ReservationError::Serialization(e.to_string()));
            },
        };

        tracing::debug!(kind = E::KIND, entity = %id, "Mutation applied optimistically");

        let request = MutationRequest {
            kind: E::KIND.to_string(),
            entity_id: id.to_string(),
            payload,
        };
        let (reply, outcome) = oneshot::channel();
        let mut reconciliation = Reconciliation {
            cache: Arc::clone(&self.cache),
            mutation: OptimisticMutation::new(previous, provisional.clone()),
            reply: Some(reply),
            started: Instant::now(),
        };
        let gateway = Arc::clone(&self.gateway);

        // If the task never runs to completion, dropping `reconciliation`
        // rolls the entry back.
        self.runtime.spawn(async move {
            let answer = gateway.submit_mutation(request).await;
            reconciliation.settle(answer);
        });

        Ok(PendingMutation {
            provisional,
            outcome,
        })
    }

    /// Applies `mutate` and waits for the remote answer.
    ///
    /// # Errors
    ///
    /// Everything [`apply_optimistic`](Self::apply_optimistic) and
    /// [`PendingMutation::settled`] return.
    pub async fn mutate(&self, id: &E::Id, mutate: impl FnOnce(&E) -> E) -> Result<E> {
        self.apply_optimistic(id, mutate)?.settled().await
    }
}

/// Settles one mutation. Rolls back on drop if no answer was applied.
struct Reconciliation<E: Entity> {
    cache: Arc<EntityCache<E>>,
    mutation: OptimisticMutation<E>,
    reply: Option<oneshot::Sender<Result<E>>>,
    started: Instant,
}

impl<E: Entity> Reconciliation<E> {
    fn settle(&mut self, answer: std::result::Result<serde_json::Value, GatewayError>) {
        let result = match answer.and_then(|value| decode_canonical(&self.mutation, value)) {
            Ok(canonical) => {
                self.cache
                    .settle_mutation(self.mutation.entity_id(), canonical.clone());
                self.mutation.commit();
                tracing::debug!(kind = E::KIND, entity = %self.mutation.entity_id(), "Mutation committed");
                metrics::record_mutation("committed", Some(self.started.elapsed()));
                Ok(canonical)
            },
            Err(error) => Err(self.roll_back("rolled_back", &error.to_string())),
        };
        self.reply(result);
    }

    fn roll_back(&mut self, outcome: &'static str, reason: &str) -> ReservationError {
        let restored = self.mutation.roll_back();
        self.cache.settle_mutation(self.mutation.entity_id(), restored);
        tracing::warn!(
            kind = E::KIND,
            entity = %self.mutation.entity_id(),
            reason,
            "Mutation rejected; rolled back"
        );
        metrics::record_mutation(outcome, Some(self.started.elapsed()));
        ReservationError::MutationRejected {
            entity: self.mutation.entity_id().to_string(),
            reason: reason.to_string(),
        }
    }

    fn reply(&mut self, result: Result<E>) {
        if let Some(reply) = self.reply.take() {
            // The caller may have dropped its handle; the cache is settled either way.
            let _ = reply.send(result);
        }
    }
}

impl<E: Entity> Drop for Reconciliation<E> {
    fn drop(&mut self) {
        if self.mutation.state() == MutationState::Pending {
            let error = self.roll_back("abandoned", "reconciliation ended before the authority answered");
            self.reply(Err(error));
        }
    }
}

fn decode_canonical<E: Entity>(
    mutation: &OptimisticMutation<E>,
    value: serde_json::Value,
) -> std::result::Result<E, GatewayError> {
    let canonical: E =
        serde_json::from_value(value).map_err(|e| GatewayError::Malformed(e.to_string()))?;
    if canonical.id() != mutation.entity_id() {
        return Err(GatewayError::Malformed(format!(
            "answer for {} does not match {}",
            canonical.id(),
            mutation.entity_id()
        )));
    }
    canonical
        .validate()
        .map_err(|e| GatewayError::Malformed(e.to_string()))?;
    Ok(canonical)
}

// ========== Event helpers ==========

impl OptimisticCoordinator<EventRecord> {
    /// Changes an event's title.
    ///
    /// # Errors
    ///
    /// See [`apply_optimistic`](Self::apply_optimistic).
    pub fn rename_event(
        &self,
        id: &EventId,
        title: impl Into<String>,
    ) -> Result<PendingMutation<EventRecord>> {
        let title = title.into();
        self.apply_optimistic(id, move |event| EventRecord {
            title,
            ..event.clone()
        })
    }

    /// Puts an event on sale.
    ///
    /// # Errors
    ///
    /// See [`apply_optimistic`](Self::apply_optimistic).
    pub fn publish_event(&self, id: &EventId) -> Result<PendingMutation<EventRecord>> {
        self.set_status(id, EventStatus::Published)
    }

    /// Takes an event back to draft.
    ///
    /// # Errors
    ///
    /// See [`apply_optimistic`](Self::apply_optimistic).
    pub fn unpublish_event(&self, id: &EventId) -> Result<PendingMutation<EventRecord>> {
        self.set_status(id, EventStatus::Draft)
    }

    fn set_status(&self, id: &EventId, status: EventStatus) -> Result<PendingMutation<EventRecord>> {
        self.apply_optimistic(id, move |event| EventRecord {
            status,
            ..event.clone()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tickethold_testing::fixtures;
    use tickethold_testing::mocks::{MutationResponse, ScriptedAuthority};

    fn coordinator() -> (OptimisticCoordinator<EventRecord>, Arc<ScriptedAuthority>) {
        let gateway = Arc::new(ScriptedAuthority::new());
        let coordinator = OptimisticCoordinator::new(
            Arc::new(EntityCache::new()),
            Arc::clone(&gateway) as Arc<dyn RemoteAuthority>,
            Handle::current(),
        );
        coordinator.upsert(fixtures::event("e1", "Old")).unwrap();
        (coordinator, gateway)
    }

    #[test]
    fn test_mutation_state_transitions() {
        let old = fixtures::event("e1", "Old");
        let new = EventRecord {
            title: "New".to_string(),
            ..old.clone()
        };
        let mut mutation = OptimisticMutation::new(old.clone(), new);
        assert_eq!(mutation.state(), MutationState::Pending);
        assert_eq!(mutation.roll_back(), old);
        assert_eq!(mutation.state(), MutationState::RolledBack);
    }

    #[tokio::test]
    async fn test_rename_is_visible_before_confirmation() {
        let (coordinator, gateway) = coordinator();
        let id = EventId::new("e1");

        let pending = coordinator.rename_event(&id, "New").unwrap();
        assert_eq!(pending.provisional().title, "New");
        assert_eq!(coordinator.get(&id).unwrap().title, "New");
        assert!(coordinator.is_pending(&id));

        let settled = pending.settled().await.unwrap();
        assert_eq!(settled.title, "New");
        assert!(!coordinator.is_pending(&id));

        let submitted = gateway.mutations();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].kind, "event");
        assert_eq!(submitted[0].entity_id, "e1");
        assert_eq!(submitted[0].payload["title"], "New");
    }

    #[tokio::test]
    async fn test_rejection_restores_previous_snapshot() {
        let (coordinator, gateway) = coordinator();
        let id = EventId::new("e1");
        let before = coordinator.get(&id).unwrap();
        gateway.push_response(MutationResponse::Reject(GatewayError::Unavailable(
            "connection reset".to_string(),
        )));

        let err = coordinator
            .mutate(&id, |event| EventRecord {
                title: "New".to_string(),
                ..event.clone()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ReservationError::MutationRejected { ref entity, .. } if entity == "e1"));
        assert_eq!(coordinator.get(&id).unwrap(), before);
        assert!(!coordinator.is_pending(&id));
    }

    #[tokio::test]
    async fn test_answer_for_another_entity_rolls_back() {
        let (coordinator, gateway) = coordinator();
        let id = EventId::new("e1");
        let stranger = serde_json::to_value(fixtures::event("e2", "Other")).unwrap();
        gateway.push_response(MutationResponse::Respond(stranger));

        let err = coordinator.publish_event(&id).unwrap().settled().await.unwrap_err();
        assert!(matches!(err, ReservationError::MutationRejected { .. }));
        assert_eq!(coordinator.get(&id).unwrap().status, EventStatus::Draft);
    }

    #[tokio::test]
    async fn test_undecodable_answer_rolls_back() {
        let (coordinator, gateway) = coordinator();
        let id = EventId::new("e1");
        gateway.push_response(MutationResponse::Respond(serde_json::json!({"ok": true})));

        let err = coordinator.rename_event(&id, "New").unwrap().settled().await.unwrap_err();
        assert!(matches!(err, ReservationError::MutationRejected { .. }));
        assert_eq!(coordinator.get(&id).unwrap().title, "Old");
    }

    #[tokio::test]
    async fn test_unknown_entity_and_closed_coordinator() {
        let (coordinator, gateway) = coordinator();
        let err = coordinator
            .rename_event(&EventId::new("missing"), "x")
            .unwrap_err();
        assert!(matches!(err, ReservationError::UnknownEntity { .. }));

        coordinator.close();
        let err = coordinator.rename_event(&EventId::new("e1"), "x").unwrap_err();
        assert_eq!(err, ReservationError::ShuttingDown);
        assert!(gateway.calls().is_empty());
    }
}
