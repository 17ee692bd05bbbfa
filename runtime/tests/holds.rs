//! Hold placement, release and notification through the reservation context.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use tickethold_core::error::{GatewayError, ReservationError};
use tickethold_core::gateway::NotifyOp;
use tickethold_core::types::{HolderId, InventoryItem, ItemId, ReleaseOutcome};
use tickethold_runtime::{ReservationConfig, ReservationContext, UpsertOutcome};
use tickethold_testing::mocks::{AuthorityCall, ScriptedAuthority, test_clock};
use tickethold_testing::{fixtures, helpers};

fn context() -> (ReservationContext, Arc<ScriptedAuthority>) {
    helpers::init_tracing();
    let gateway = Arc::new(ScriptedAuthority::new());
    let ctx = ReservationContext::new(
        ReservationConfig::default(),
        gateway.clone(),
        Arc::new(test_clock()),
    )
    .unwrap();
    ctx.sync_collection(
        &fixtures::collection(),
        vec![
            fixtures::ticket_type("ga", 100, 80, 5),
            fixtures::ticket_type("vip", 10, 0, 0),
        ],
    )
    .unwrap();
    (ctx, gateway)
}

fn ga() -> ItemId {
    ItemId::new("ga")
}

#[tokio::test]
async fn test_second_holder_is_refused_when_stock_runs_out() {
    let (ctx, _gateway) = context();
    let holds = ctx.holds();
    assert_eq!(holds.available_quantity(&ga()), 15);

    let hold = holds.request_hold(&ga(), 10, &HolderId::new("A")).unwrap();
    assert_eq!(hold.quantity, 10);
    assert_eq!(holds.available_quantity(&ga()), 5);

    let err = holds
        .request_hold(&ga(), 10, &HolderId::new("B"))
        .unwrap_err();
    assert_eq!(
        err,
        ReservationError::OutOfStock {
            item: ga(),
            requested: 10,
            available: 5,
        }
    );
    assert_eq!(holds.holds_for(&ga()), vec![hold]);
    assert_eq!(holds.available_quantity(&ga()), 5);
}

#[tokio::test]
async fn test_release_restores_availability_before_any_timer() {
    let (ctx, _gateway) = context();
    let holds = ctx.holds();
    holds.request_hold(&ga(), 10, &HolderId::new("A")).unwrap();

    assert!(holds.release(&ga(), &HolderId::new("A")).is_released());
    assert_eq!(holds.available_quantity(&ga()), 15);
    assert_eq!(holds.armed_timer_count(), 0);
}

#[tokio::test]
async fn test_releasing_unknown_holder_is_a_noop() {
    let (ctx, gateway) = context();
    let holds = ctx.holds();
    holds.request_hold(&ga(), 10, &HolderId::new("A")).unwrap();
    gateway.wait_for_calls(1).await;

    let outcome = holds.release(&ga(), &HolderId::new("nonexistent-holder"));
    assert_eq!(outcome, ReleaseOutcome::NoOp);
    assert_eq!(holds.available_quantity(&ga()), 5);

    // Twice is the same as once
    holds.release(&ga(), &HolderId::new("A"));
    assert_eq!(holds.release(&ga(), &HolderId::new("A")), ReleaseOutcome::NoOp);
    gateway.wait_for_calls(2).await;
    tokio::task::yield_now().await;
    assert_eq!(gateway.release_count(), 1);
}

#[tokio::test]
async fn test_unknown_item_is_out_of_stock() {
    let (ctx, _gateway) = context();
    let err = ctx
        .holds()
        .request_hold(&ItemId::new("backstage"), 1, &HolderId::new("A"))
        .unwrap_err();
    assert!(matches!(err, ReservationError::OutOfStock { available: 0, .. }));
    assert_eq!(ctx.holds().active_hold_count(), 0);
}

#[tokio::test]
async fn test_zero_quantity_is_invalid() {
    let (ctx, _gateway) = context();
    let err = ctx
        .holds()
        .request_hold(&ga(), 0, &HolderId::new("A"))
        .unwrap_err();
    assert_eq!(err, ReservationError::InvalidQuantity { item: ga() });
}

#[tokio::test]
async fn test_holder_can_resize_their_hold() {
    let (ctx, _gateway) = context();
    let holds = ctx.holds();
    let vip = ItemId::new("vip");
    let alice = HolderId::new("alice");

    holds.request_hold(&vip, 6, &alice).unwrap();
    holds.request_hold(&vip, 3, &HolderId::new("bob")).unwrap();
    assert_eq!(holds.available_quantity(&vip), 1);

    // Alice's own 6 units do not count against her new request
    let resized = holds.request_hold(&vip, 7, &alice).unwrap();
    assert_eq!(holds.available_quantity(&vip), 0);
    assert_eq!(holds.hold(&vip, &alice), Some(resized));
    assert_eq!(holds.active_hold_count(), 2);

    // A failed resize keeps the current hold
    assert!(holds.request_hold(&vip, 8, &alice).is_err());
    assert_eq!(holds.hold(&vip, &alice).unwrap().quantity, 7);
}

#[tokio::test]
async fn test_gateway_is_told_about_holds_and_releases() {
    let (ctx, gateway) = context();
    let alice = HolderId::new("alice");

    ctx.holds().request_hold(&ga(), 2, &alice).unwrap();
    gateway.wait_for_calls(1).await;
    ctx.holds().release(&ga(), &alice);
    gateway.wait_for_calls(2).await;

    assert_eq!(
        gateway.calls(),
        vec![
            AuthorityCall::Hold {
                item_id: ga(),
                quantity: 2,
                holder_id: alice.clone(),
            },
            AuthorityCall::Release {
                item_id: ga(),
                holder_id: alice,
            },
        ]
    );
}

#[tokio::test]
async fn test_resize_tells_gateway_release_then_hold() {
    let (ctx, gateway) = context();
    let alice = HolderId::new("alice");

    ctx.holds().request_hold(&ga(), 2, &alice).unwrap();
    gateway.wait_for_calls(1).await;
    ctx.holds().request_hold(&ga(), 3, &alice).unwrap();
    gateway.wait_for_calls(3).await;

    assert_eq!(
        gateway.calls()[1..],
        [
            AuthorityCall::Release {
                item_id: ga(),
                holder_id: alice.clone(),
            },
            AuthorityCall::Hold {
                item_id: ga(),
                quantity: 3,
                holder_id: alice,
            },
        ]
    );
}

#[tokio::test]
async fn test_sync_item_applies_fresher_counters() {
    let (ctx, _gateway) = context();
    ctx.holds().request_hold(&ga(), 4, &HolderId::new("alice")).unwrap();

    let outcome = ctx
        .holds()
        .sync_item(fixtures::ticket_type("ga", 100, 85, 5))
        .unwrap();

    assert_eq!(outcome, UpsertOutcome::Stored);
    assert_eq!(ctx.holds().available_quantity(&ga()), 6);
    assert_eq!(ctx.holds().active_hold_count(), 1);
}

#[tokio::test]
async fn test_sync_item_leaves_edited_ticket_type_alone() {
    let (ctx, gateway) = context();
    gateway.pause_mutations();
    let pending = ctx
        .ticket_types()
        .apply_optimistic(&ga(), |item| InventoryItem {
            name: "General Admission".to_string(),
            ..item.clone()
        })
        .unwrap();

    let outcome = ctx
        .holds()
        .sync_item(fixtures::ticket_type("ga", 100, 90, 5))
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::SkippedPending);
    assert_eq!(ctx.holds().available_quantity(&ga()), 15);
    assert_eq!(ctx.ticket_types().get(&ga()).unwrap().name, "General Admission");

    gateway.resume_mutations();
    pending.settled().await.unwrap();
    assert_eq!(
        ctx.holds()
            .sync_item(fixtures::ticket_type("ga", 100, 90, 5))
            .unwrap(),
        UpsertOutcome::Stored
    );
    assert_eq!(ctx.holds().available_quantity(&ga()), 5);
}

#[tokio::test]
async fn test_failed_notification_is_broadcast_and_hold_kept() {
    let (ctx, gateway) = context();
    let mut warnings = ctx.warnings();
    gateway.fail_notifications(GatewayError::Unavailable("offline".to_string()));

    let hold = ctx
        .holds()
        .request_hold(&ga(), 4, &HolderId::new("alice"))
        .unwrap();

    let warning = warnings.recv().await.unwrap();
    assert_eq!(warning.op, NotifyOp::Hold);
    assert_eq!(warning.item_id, ga());
    assert_eq!(warning.holder_id, HolderId::new("alice"));
    assert_eq!(warning.error, GatewayError::Unavailable("offline".to_string()));
    assert_eq!(warning.observed_at, test_clock_now());

    // The local hold is not rolled back
    assert_eq!(ctx.holds().holds_for(&ga()), vec![hold]);
    assert_eq!(ctx.holds().available_quantity(&ga()), 11);

    ctx.holds().release(&ga(), &HolderId::new("alice"));
    let warning = warnings.recv().await.unwrap();
    assert_eq!(warning.op, NotifyOp::Release);
}

#[tokio::test]
async fn test_sync_drops_holds_of_removed_items() {
    let (ctx, _gateway) = context();
    ctx.holds()
        .request_hold(&ItemId::new("vip"), 2, &HolderId::new("alice"))
        .unwrap();
    ctx.holds().request_hold(&ga(), 1, &HolderId::new("bob")).unwrap();
    assert_eq!(ctx.holds().armed_timer_count(), 2);

    let report = ctx
        .sync_collection(
            &fixtures::collection(),
            vec![fixtures::ticket_type("ga", 100, 82, 5)],
        )
        .unwrap();

    assert_eq!(report.removed, vec![ItemId::new("vip")]);
    assert_eq!(report.dropped_holds.len(), 1);
    assert_eq!(ctx.holds().armed_timer_count(), 1);
    assert_eq!(ctx.holds().available_quantity(&ItemId::new("vip")), 0);
    // Fresher counters apply to the surviving item
    assert_eq!(ctx.holds().available_quantity(&ga()), 12);
    assert_eq!(ctx.holds().available_in_collection(&fixtures::collection()), 12);
}

#[tokio::test]
async fn test_invalid_snapshot_changes_nothing() {
    let (ctx, _gateway) = context();
    let err = ctx
        .sync_collection(
            &fixtures::collection(),
            vec![fixtures::ticket_type("ga", 100, 90, 20)],
        )
        .unwrap_err();
    assert!(matches!(err, ReservationError::InvariantViolation { .. }));
    assert_eq!(ctx.holds().available_quantity(&ga()), 15);
    assert_eq!(ctx.holds().available_quantity(&ItemId::new("vip")), 10);
}

fn test_clock_now() -> chrono::DateTime<chrono::Utc> {
    use tickethold_core::environment::Clock;
    test_clock().now()
}
