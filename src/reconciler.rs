//! A minimal driver-side loop that hosts a [`Mounter`](crate::mounter::Mounter)
//! end-to-end: a tag-dispatched handler registry invoked on parent watch
//! events, cooperating with the Mounter through a [`ReconcileBridge`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bridge::ReconcileBridge;
use crate::diff::DiffOp;
use crate::error::HandlerError;
use crate::model::ModelRef;
use crate::store::{Backend, StoreClient};
use crate::watch::{Callbacks, Watch, WatchBody};

/// The tagged event kinds a handler can register against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Resume,
    Update,
    Delete,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, HandlerError>> + Send>>;
type HandlerFn = dyn Fn(serde_json::Value, Vec<DiffOp>) -> HandlerFuture + Send + Sync;

type DeleteFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
type DeleteFn = dyn Fn(Option<serde_json::Value>) -> DeleteFuture + Send + Sync;

/// The explicit, tag-dispatched table of user reconcile handlers, replacing
/// the reference driver's per-call decorator sugar.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Arc<HandlerFn>>,
    delete_handler: Option<Arc<DeleteFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers a handler for `Create`, `Resume`, and `Update` alike. Most
    /// drivers want the same logic regardless of which of the three brought
    /// the parent to the reconciler's attention.
    pub fn on_any<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(serde_json::Value, Vec<DiffOp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        for kind in [EventKind::Create, EventKind::Resume, EventKind::Update] {
            let f = f.clone();
            self.handlers
                .insert(kind, Arc::new(move |spec, diff| Box::pin(f(spec, diff))));
        }
        self
    }

    pub fn on<F, Fut>(mut self, kind: EventKind, f: F) -> Self
    where
        F: Fn(serde_json::Value, Vec<DiffOp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        self.handlers
            .insert(kind, Arc::new(move |spec, diff| Box::pin(f(spec, diff))));
        self
    }

    /// Registers the optional delete handler, tolerant of a missing object,
    /// matching `optional=True` in the reference driver.
    pub fn on_delete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.delete_handler = Some(Arc::new(move |body| Box::pin(f(body))));
        self
    }
}

/// Drives the parent watch, dispatching to the [`HandlerRegistry`] and
/// publishing the resulting generation through the [`ReconcileBridge`].
pub struct Reconciler<C: Backend> {
    client: Arc<C>,
    parent: ModelRef,
    registry: Arc<HandlerRegistry>,
    bridge: ReconcileBridge,
    watch: parking_lot::Mutex<Option<Watch>>,
}

impl<C: Backend> Reconciler<C> {
    pub fn new(
        client: Arc<C>,
        parent: ModelRef,
        registry: HandlerRegistry,
        bridge: ReconcileBridge,
    ) -> Self {
        Reconciler {
            client,
            parent,
            registry: Arc::new(registry),
            bridge,
            watch: parking_lot::Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let client_create = self.client.clone();
        let parent_create = self.parent.clone();
        let registry_create = self.registry.clone();
        let bridge_create = self.bridge.clone();

        let client_resume = self.client.clone();
        let parent_resume = self.parent.clone();
        let registry_resume = self.registry.clone();
        let bridge_resume = self.bridge.clone();

        let client_update = self.client.clone();
        let parent_update = self.parent.clone();
        let registry_update = self.registry.clone();
        let bridge_update = self.bridge.clone();

        let registry_delete = self.registry.clone();

        let callbacks = Callbacks::new()
            .on_create(move |body| {
                let (client, parent, registry, bridge) = (
                    client_create.clone(),
                    parent_create.clone(),
                    registry_create.clone(),
                    bridge_create.clone(),
                );
                async move {
                    dispatch(client, parent, registry, bridge, EventKind::Create, body, Vec::new())
                        .await;
                }
            })
            .on_resume(move |body| {
                let (client, parent, registry, bridge) = (
                    client_resume.clone(),
                    parent_resume.clone(),
                    registry_resume.clone(),
                    bridge_resume.clone(),
                );
                async move {
                    dispatch(client, parent, registry, bridge, EventKind::Resume, body, Vec::new())
                        .await;
                }
            })
            .on_update(move |body, diff| {
                let (client, parent, registry, bridge) = (
                    client_update.clone(),
                    parent_update.clone(),
                    registry_update.clone(),
                    bridge_update.clone(),
                );
                async move {
                    dispatch(client, parent, registry, bridge, EventKind::Update, body, diff).await;
                }
            })
            .on_delete(move |body| {
                let registry = registry_delete.clone();
                async move {
                    if let Some(handler) = &registry.delete_handler {
                        if let Err(e) = handler(body.map(|b| b.spec)).await {
                            warn!(error = %e, "delete handler failed");
                        }
                    }
                }
            });

        let watch = Watch::start(
            self.client.as_ref(),
            self.parent.gvr.clone(),
            self.parent.nsn.clone(),
            callbacks,
        );
        *self.watch.lock() = Some(watch);
    }

    pub fn stop(&self) {
        if let Some(w) = self.watch.lock().take() {
            w.stop();
        }
    }
}

async fn dispatch<C: Backend>(
    client: Arc<C>,
    parent: ModelRef,
    registry: Arc<HandlerRegistry>,
    bridge: ReconcileBridge,
    kind: EventKind,
    body: WatchBody,
    diff: Vec<DiffOp>,
) {
    if body.meta.generation == bridge.parent_generation() + 1 {
        debug!(generation = body.meta.generation, "dropping self-echo of reconcile write");
        return;
    }

    let Some(handler) = registry.handlers.get(&kind) else {
        return;
    };

    let new_spec = match handler(body.spec, diff).await {
        Ok(spec) => spec,
        Err(e) => {
            warn!(error = %e, "reconcile handler failed, will be re-observed on next event");
            return;
        }
    };

    match client
        .patch(&parent, Some(&body.meta.resource_version), new_spec)
        .await
    {
        Ok(new_meta) => {
            if new_meta.generation != body.meta.generation {
                bridge.set_parent_generation(new_meta.generation);
            }
        }
        Err(e) => warn!(error = %e, "failed to persist handler's updated spec"),
    }
}
