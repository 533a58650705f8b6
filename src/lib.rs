//! Mount-semantics reconciliation runtime for hierarchically composed
//! declarative models.
//!
//! The [`mounter`] module is the core: a per-parent meta-controller that
//! tracks a dynamic set of mounted children and keeps their intent/status
//! attributes bidirectionally in sync. Everything else here is the ambient
//! stack needed to host it — a store abstraction, a watch layer, a minimal
//! reconcile loop, and process configuration.

pub mod bridge;
pub mod config;
pub mod diff;
pub mod error;
pub mod ledger;
pub mod model;
pub mod mount;
pub mod mounter;
pub mod reconciler;
pub mod store;
pub mod watch;

pub use bridge::ReconcileBridge;
pub use config::DriverConfig;
pub use error::{ConfigError, HandlerError, MounterError, StoreError};
pub use model::{Gvr, ModelMeta, ModelRef, Nsn};
pub use mounter::Mounter;
pub use reconciler::{EventKind, HandlerRegistry, Reconciler};
pub use store::{Backend, InMemoryStore, StoreClient, WatchSource};
