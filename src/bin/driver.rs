//! Demo driver process: wires an [`InMemoryStore`] to a [`Mounter`] and a
//! [`Reconciler`], reading the parent identity from the environment, and
//! runs until interrupted.
//!
//! There is no real cluster client in this crate, so this binary seeds a
//! parent model from `PARENT_SPEC` (a JSON document, defaulting to `{}`) and
//! simply keeps the runtime alive — it exists to prove the wiring compiles
//! and runs end-to-end, not as a production entry point.

use std::sync::Arc;

use mount_runtime::{DriverConfig, HandlerRegistry, InMemoryStore, Mounter, Reconciler};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DriverConfig::from_env()?;
    info!(parent = %config.parent, mounter_enabled = config.mounter_enabled, "starting driver");

    let store = Arc::new(InMemoryStore::new());

    let initial_spec: serde_json::Value = std::env::var("PARENT_SPEC")
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    store.seed(config.parent.clone(), initial_spec);

    let mounter = Mounter::new(store.clone(), config.parent.clone());
    let bridge = mounter.bridge();
    if config.mounter_enabled {
        mounter.start();
    } else {
        info!("MOUNTER=false, running without mount semantics");
    }

    let registry = HandlerRegistry::new().on_any(|spec, diff| async move {
        info!(changes = diff.len(), "reconciling parent");
        Ok(spec)
    });

    let reconciler = Reconciler::new(store.clone(), config.parent.clone(), registry, bridge);
    reconciler.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping");

    reconciler.stop();
    mounter.stop();

    Ok(())
}
