//! rentcache - scripted rent-collection session over the sync layer.
//!
//! Runs two managers against one in-memory backend: approvals, a rejection
//! by the second manager, an undo and a failed write, printing the cached
//! view and sync status after each step. `--print-config` shows the loaded
//! configuration; `--fetch <topic>` queries the configured REST backend.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::json;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rentcache_core::backend::Backend;
use rentcache_core::{
    BackendError, CacheEntry, MemoryBackend, QueryData, QueryKey, RestBackend, SyncConfig, SyncContext,
    Topic, View,
};

/// Simulated round-trip latency range for the demo backend, in milliseconds.
const DEMO_LATENCY_MS: (u64, u64) = (20, 120);

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let config = SyncConfig::load().context("Failed to load configuration")?;
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("--print-config") => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some("--fetch") => {
            let topic = args
                .get(2)
                .map(|t| Topic::new(t.as_str()))
                .ok_or_else(|| anyhow::anyhow!("usage: rentcache --fetch <topic>"))?;
            fetch_remote(&config, topic).await
        }
        _ => run_demo(config).await,
    }
}

async fn fetch_remote(config: &SyncConfig, topic: Topic) -> Result<()> {
    let backend = RestBackend::from_config(config).context("Failed to create REST backend")?;
    let data = backend
        .query(&QueryKey::all(topic.clone()))
        .await
        .with_context(|| format!("Failed to fetch {}", topic))?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    eprintln!("{} rows from {}", data.len(), topic);
    Ok(())
}

fn seed(backend: &MemoryBackend) {
    backend.seed(
        Topic::TENANTS,
        vec![
            json!({"id": "t1", "name": "Amara Obi", "agent_id": "a1", "unit": "2A", "monthly_rent": 850}),
            json!({"id": "t2", "name": "Luis Ortega", "agent_id": "a1", "unit": "3C", "monthly_rent": 920}),
            json!({"id": "t3", "name": "Mei Chen", "agent_id": "a2", "unit": null, "monthly_rent": 700}),
        ],
    );
    backend.seed(
        Topic::PROFILES,
        vec![
            json!({"id": "a1", "full_name": "Grace Agent", "role": "agent"}),
            json!({"id": "m1", "full_name": "Maya Manager", "role": "manager"}),
            json!({"id": "m2", "full_name": "Ivan Admin", "role": "admin"}),
        ],
    );
    let pending = |id: &str, tenant: &str, agent: &str, amount: f64| {
        json!({
            "id": id, "tenant_id": tenant, "agent_id": agent, "amount": amount,
            "collected_on": "2026-10-01", "status": "pending",
            "approved_by": null, "approved_at": null, "rejection_reason": null
        })
    };
    backend.seed(
        Topic::COLLECTIONS,
        vec![
            pending("c1", "t1", "a1", 850.0),
            pending("c2", "t2", "a1", 460.0),
            pending("c3", "t3", "a2", 700.0),
        ],
    );
}

fn print_collections(step: &str, entry: Option<Arc<CacheEntry<QueryData>>>) {
    println!("\n== {} ==", step);
    let Some(entry) = entry else {
        println!("  (not cached)");
        return;
    };
    println!("  [{} | v{} | {}]", entry.status, entry.version, entry.age_display());
    for c in entry.data.collections().unwrap_or_default() {
        println!(
            "  {:<4} {:>9} {:<9} by {:<4} {}",
            c.id,
            c.display_amount(),
            c.status.to_string(),
            c.approved_by.as_deref().unwrap_or("-"),
            c.rejection_reason.as_deref().unwrap_or("")
        );
    }
}

async fn run_demo(config: SyncConfig) -> Result<()> {
    info!("rentcache demo starting");
    let backend = MemoryBackend::new();
    seed(&backend);
    let (low, high) = DEMO_LATENCY_MS;
    backend.set_latency(Some(Duration::from_millis(rand::thread_rng().gen_range(low..high))));

    let shared = Arc::new(backend.clone());
    let manager = SyncContext::new(config.clone(), shared.clone());
    let second = SyncContext::new(config, shared);
    let key = QueryKey::all(Topic::COLLECTIONS);

    let mut view = View::open(&manager, key.clone()).context("Failed to open collections view")?;
    print_collections("loaded", Some(view.settled().await?));

    let approval = manager
        .approvals()
        .approve(&key, "c1", "m1")
        .await
        .context("Approve failed")?;
    print_collections("m1 approved c1", view.snapshot());

    let rejection = second
        .approvals()
        .reject(&key, "c1", "m2", "duplicate")
        .await
        .context("Reject failed")?;
    view.changed().await?;
    print_collections("m2 rejected c1 (pushed)", Some(view.settled().await?));

    second
        .approvals()
        .undo(&rejection)
        .await
        .context("Undo failed")?;
    view.changed().await?;
    print_collections("m2 undid the rejection", Some(view.settled().await?));
    println!(
        "  restored to {} (approval receipt held {})",
        rejection.prior.status, approval.applied.status
    );

    backend.fail_next_write(BackendError::Rejected("collection is locked".into()));
    match manager.approvals().approve(&key, "c2", "m1").await {
        Ok(_) => println!("\nunexpected: locked write succeeded"),
        Err(e) => println!("\nApprove c2 failed and rolled back: {}", e),
    }
    print_collections("after failed approve", view.snapshot());

    println!("\n== sync status ==");
    for (topic, at) in manager.status().topics() {
        println!("  {:<12} {}", topic.to_string(), rentcache_core::cache::age_display(at));
    }
    println!("  overall      {}", manager.status().age_display(None));
    for active in manager.subscriptions().active() {
        println!(
            "  subscription {}[{}] leases={} {}",
            active.topic, active.scope, active.leases, active.health
        );
    }
    println!(
        "  backend: {} queries, {} writes, {} open subscriptions",
        backend.query_count(),
        backend.write_count(),
        backend.open_subscriptions()
    );

    drop(view);
    manager.shutdown();
    second.shutdown();
    info!("rentcache demo finished");
    Ok(())
}
