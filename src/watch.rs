//! A single subscription to one resource, dispatching lifecycle events to
//! injected callbacks.
//!
//! Grounded on `kube_runtime::utils::CancelableJoinHandle`: a watch's
//! background loop is spawned with [`futures::future::abortable`] and
//! `stop()` simply aborts the handle, rather than plumbing a cancellation
//! token through every await point.

use std::sync::Arc;

use futures::future::{abortable, AbortHandle};
use tokio::sync::broadcast;
use tracing::{debug, info_span, warn, Instrument};

use crate::diff::{diff, DiffOp};
use crate::model::{Gvr, ModelMeta, Nsn};
use crate::store::{RawEvent, WatchSource};

/// The full current state delivered to `on_create`/`on_resume`/`on_update`/`on_delete`.
#[derive(Debug, Clone)]
pub struct WatchBody {
    pub meta: ModelMeta,
    pub spec: serde_json::Value,
}

type CreateFn = dyn Fn(WatchBody) -> futures::future::BoxFuture<'static, ()> + Send + Sync;
type UpdateFn =
    dyn Fn(WatchBody, Vec<DiffOp>) -> futures::future::BoxFuture<'static, ()> + Send + Sync;
type DeleteFn = dyn Fn(Option<WatchBody>) -> futures::future::BoxFuture<'static, ()> + Send + Sync;
type FieldFn =
    dyn Fn(WatchBody, Vec<DiffOp>) -> futures::future::BoxFuture<'static, ()> + Send + Sync;

/// Callback set for one [`Watch`]. At least one callback should be set for
/// the watch to be useful, but none are individually required.
#[derive(Default, Clone)]
pub struct Callbacks {
    pub on_create: Option<Arc<CreateFn>>,
    pub on_resume: Option<Arc<CreateFn>>,
    pub on_update: Option<Arc<UpdateFn>>,
    pub on_delete: Option<Arc<DeleteFn>>,
    /// `(field path components, handler)`. The handler receives a diff whose
    /// paths are relative to `field` (the matched prefix is stripped), and is
    /// only invoked when at least one change falls under that subtree.
    pub on_field: Vec<(Vec<String>, Arc<FieldFn>)>,
}

impl Callbacks {
    pub fn new() -> Self {
        Callbacks::default()
    }

    pub fn on_create<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WatchBody) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_create = Some(Arc::new(move |b| Box::pin(f(b))));
        self
    }

    pub fn on_resume<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WatchBody) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_resume = Some(Arc::new(move |b| Box::pin(f(b))));
        self
    }

    pub fn on_update<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WatchBody, Vec<DiffOp>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_update = Some(Arc::new(move |b, d| Box::pin(f(b, d))));
        self
    }

    pub fn on_delete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<WatchBody>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_delete = Some(Arc::new(move |b| Box::pin(f(b))));
        self
    }

    pub fn on_field<F, Fut>(mut self, field: &str, f: F) -> Self
    where
        F: Fn(WatchBody, Vec<DiffOp>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let field = field.split('.').map(str::to_string).collect();
        self.on_field
            .push((field, Arc::new(move |b, d| Box::pin(f(b, d)))));
        self
    }
}

/// A subscription to one `(gvr, nsn)`, delivering events in arrival order.
///
/// Events for this resource are dispatched serially: a callback completes
/// before the next event for the same watch is handled. Different watches
/// run on independent tasks and make progress concurrently.
pub struct Watch {
    abort: AbortHandle,
}

impl Watch {
    /// Spawns the background delivery loop and returns once the subscription
    /// is live. Events that predate the subscription are not replayed; the
    /// caller is expected to seed initial state via `on_create`/`on_resume`
    /// from a prior `get`, matching how the reference driver's first watch
    /// event is itself the resume.
    pub fn start<S: WatchSource + ?Sized>(
        source: &S,
        gvr: Gvr,
        nsn: Nsn,
        callbacks: Callbacks,
    ) -> Watch {
        let rx = source.subscribe(&gvr);
        let span = info_span!("watch", %gvr, %nsn);
        let (fut, abort) = abortable(run_loop(rx, nsn, callbacks).instrument(span));
        tokio::spawn(async move {
            let _ = fut.await;
        });
        Watch { abort }
    }

    /// Requests shutdown of the background loop. Idempotent and safe to call
    /// from any thread; a watch that has already stopped is unaffected.
    pub fn stop(&self) {
        self.abort.abort();
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

async fn run_loop(mut rx: broadcast::Receiver<RawEvent>, nsn: Nsn, callbacks: Callbacks) {
    let mut last_spec: Option<serde_json::Value> = None;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "watch lagged behind store events, continuing");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if event.model_ref().nsn != nsn {
            continue;
        }

        match event {
            RawEvent::Created(_, snap) => {
                debug!("resource created");
                last_spec = Some(snap.spec.clone());
                let body = WatchBody {
                    meta: snap.meta,
                    spec: snap.spec,
                };
                if let Some(f) = &callbacks.on_create {
                    f(body.clone()).await;
                }
            }
            RawEvent::Updated(_, snap) => {
                let old_spec = last_spec.clone().unwrap_or(serde_json::json!({}));
                let changes = diff(&old_spec, &snap.spec);
                last_spec = Some(snap.spec.clone());
                debug!(changes = changes.len(), "resource updated");
                let body = WatchBody {
                    meta: snap.meta,
                    spec: snap.spec,
                };
                if let Some(f) = &callbacks.on_update {
                    f(body.clone(), changes.clone()).await;
                }
                dispatch_field(&callbacks, &body, &changes).await;
            }
            RawEvent::Deleted(_) => {
                debug!("resource deleted");
                last_spec = None;
                if let Some(f) = &callbacks.on_delete {
                    f(None).await;
                }
                return;
            }
        }
    }
}

async fn dispatch_field(callbacks: &Callbacks, body: &WatchBody, changes: &[DiffOp]) {
    for (field, handler) in &callbacks.on_field {
        let relevant: Vec<DiffOp> = changes
            .iter()
            .filter(|d| d.path.starts_with(field))
            .map(|d| DiffOp {
                op: d.op,
                path: d.path[field.len()..].to_vec(),
                old: d.old.clone(),
                new: d.new.clone(),
            })
            .collect();
        if !relevant.is_empty() {
            handler(body.clone(), relevant).await;
        }
    }
}
