//! Holds Demo
//!
//! Walks through the client-side reservation layer against a simulated remote
//! authority:
//! - Placing holds until stock runs out
//! - Explicit and idempotent releases
//! - A hold expiring on its own
//! - An optimistic event rename that the server refuses, and one it accepts
//! - Gateway warnings while the server is unreachable
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=info,tickethold_runtime=debug cargo run -p holds-demo
//! ```
//!
//! The hold TTL is shortened to a few seconds unless
//! `TICKETHOLD_HOLD_TTL_SECS` is set.

use anyhow::Context as _;
use chrono::Utc;
use futures::future::BoxFuture;
use rand::Rng;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tickethold_core::error::GatewayError;
use tickethold_core::gateway::{GatewayResult, MutationRequest, RemoteAuthority};
use tickethold_core::types::{
    CollectionId, EventId, EventRecord, HolderId, InventoryItem, ItemId, ReleaseOutcome,
};
use tickethold_runtime::config::HOLD_TTL_ENV;
use tickethold_runtime::metrics::MetricsExporter;
use tickethold_runtime::{ReservationConfig, ReservationContext};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Remote authority living in-process, with jittery latency and an off switch.
struct SimulatedAuthority {
    offline: AtomicBool,
}

impl SimulatedAuthority {
    const fn new() -> Self {
        Self {
            offline: AtomicBool::new(false),
        }
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn jitter() -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(5..=40))
    }

    async fn round_trip(&self) -> GatewayResult<()> {
        tokio::time::sleep(Self::jitter()).await;
        if self.offline.load(Ordering::Acquire) {
            return Err(GatewayError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

impl RemoteAuthority for SimulatedAuthority {
    fn notify_hold(
        &self,
        item_id: ItemId,
        quantity: u32,
        holder_id: HolderId,
    ) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.round_trip().await?;
            tracing::info!(item = %item_id, holder = %holder_id, quantity, "Server recorded hold");
            Ok(())
        })
    }

    fn notify_release(&self, item_id: ItemId, holder_id: HolderId) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.round_trip().await?;
            tracing::info!(item = %item_id, holder = %holder_id, "Server recorded release");
            Ok(())
        })
    }

    fn submit_mutation(&self, request: MutationRequest) -> BoxFuture<'_, GatewayResult<serde_json::Value>> {
        Box::pin(async move {
            self.round_trip().await?;
            // The server stamps its own modification time
            let mut canonical = request.payload;
            if let Some(fields) = canonical.as_object_mut() {
                fields.insert(
                    "updated_at".to_string(),
                    serde_json::Value::String(Utc::now().to_rfc3339()),
                );
            }
            Ok(canonical)
        })
    }
}

fn demo_config() -> ReservationConfig {
    let config = ReservationConfig::from_env();
    if env::var(HOLD_TTL_ENV).is_ok() {
        return config;
    }
    ReservationConfig::builder()
        .hold_ttl(Duration::from_secs(3))
        .sweep_interval(Duration::from_secs(1))
        .warning_capacity(config.warning_capacity)
        .build()
}

#[tokio::main]
#[allow(clippy::too_many_lines)] // Linear walkthrough
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tickethold_runtime=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut exporter = MetricsExporter::new();
    exporter.start().context("installing metrics exporter")?;

    println!("\n============================================");
    println!("   Tickethold - Holds Demo");
    println!("============================================\n");

    let authority = Arc::new(SimulatedAuthority::new());
    let config = demo_config();
    let ctx = ReservationContext::with_system_clock(config.clone(), authority.clone())
        .context("building reservation context")?;

    let mut warnings = ctx.warnings();
    let warning_printer = tokio::spawn(async move {
        while let Ok(warning) = warnings.recv().await {
            println!("   ⚠️  {warning}");
        }
    });

    // ========== Seed ==========

    let festival = CollectionId::new("summer-fest");
    let ga = ItemId::new("ga");
    let vip = ItemId::new("vip");
    ctx.sync_collection(
        &festival,
        vec![
            InventoryItem::new(ga.clone(), festival.clone(), "General Admission", 100)
                .with_committed(80, 5),
            InventoryItem::new(vip.clone(), festival.clone(), "VIP", 10),
        ],
    )?;
    let launch = EventId::new("launch-party");
    ctx.sync_events(vec![EventRecord::new(launch.clone(), "Old", Utc::now())])?;

    println!("📋 Inventory synced");
    println!("   GA available:  {}", ctx.holds().available_quantity(&ga));
    println!("   VIP available: {}", ctx.holds().available_quantity(&vip));
    println!(
        "   Festival total: {}\n",
        ctx.holds().available_in_collection(&festival)
    );

    // ========== Holds until stock runs out ==========

    let alice = HolderId::new("alice");
    let bob = HolderId::new("bob");

    println!("🎫 Alice holds 10 GA");
    let hold = ctx.holds().request_hold(&ga, 10, &alice)?;
    println!("   {} expires at {}", hold.id, hold.expires_at);
    println!("   GA available: {}", ctx.holds().available_quantity(&ga));

    println!("🎫 Bob tries to hold 10 GA");
    match ctx.holds().request_hold(&ga, 10, &bob) {
        Ok(_) => println!("   unexpectedly admitted"),
        Err(err) => println!("   refused: {err}"),
    }

    // ========== Releases ==========

    println!("\n↩️  Alice releases");
    ctx.holds().release(&ga, &alice);
    println!("   GA available: {}", ctx.holds().available_quantity(&ga));

    println!("↩️  Someone who holds nothing releases");
    let outcome = ctx.holds().release(&ga, &HolderId::new("nobody"));
    println!(
        "   {}",
        if outcome == ReleaseOutcome::NoOp { "no-op" } else { "released?" }
    );

    // ========== Expiry ==========

    println!("\n⏳ Bob holds 5 VIP and walks away");
    ctx.holds().request_hold(&vip, 5, &bob)?;
    println!("   VIP available: {}", ctx.holds().available_quantity(&vip));
    tokio::time::sleep(config.hold_ttl + Duration::from_millis(200)).await;
    println!(
        "   after {:?}: VIP available: {}",
        config.hold_ttl,
        ctx.holds().available_quantity(&vip)
    );

    // ========== Optimistic edits ==========

    println!("\n✏️  Renaming \"Old\" → \"New\" while the server is down");
    authority.set_offline(true);
    let pending = ctx.rename_event(&launch, "New")?;
    println!(
        "   immediately reads: {:?}",
        ctx.events().get(&launch).map(|event| event.title)
    );
    match pending.settled().await {
        Ok(_) => println!("   unexpectedly committed"),
        Err(err) => println!("   {err}"),
    }
    println!(
        "   after rollback reads: {:?}",
        ctx.events().get(&launch).map(|event| event.title)
    );

    println!("\n📡 A hold while the server is down still counts locally");
    ctx.holds().request_hold(&ga, 2, &alice)?;
    println!("   GA available: {}", ctx.holds().available_quantity(&ga));
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\n✏️  Back online: rename and publish");
    authority.set_offline(false);
    let renamed = ctx.rename_event(&launch, "New")?.settled().await?;
    let published = ctx.publish_event(&launch)?.settled().await?;
    println!(
        "   committed: {:?} ({}) at {}",
        renamed.title, published.status, published.updated_at
    );

    // ========== Shutdown ==========

    let dropped = ctx.shutdown();
    println!("\n🛑 Shut down, {dropped} hold(s) dropped");
    drop(ctx);
    warning_printer.abort();

    if let Some(rendered) = exporter.render() {
        println!("\n📈 Metrics snapshot\n");
        for line in rendered.lines().filter(|line| line.starts_with("tickethold_")) {
            println!("   {line}");
        }
    }

    Ok(())
}
