//! The store abstraction and an in-memory reference implementation.
//!
//! [`StoreClient`] and [`WatchSource`] are the two seams a real cluster
//! client would implement against a live API server. [`InMemoryStore`]
//! implements both over a process-local map, standing in for that server in
//! tests and in the demo binary.

use std::future::Future;

use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::StoreError;
use crate::model::{Gvr, ModelMeta, ModelRef};

/// A model as observed by a watch or a `get`: its full spec plus store metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub meta: ModelMeta,
    pub spec: Value,
}

/// One change notification fanned out to [`WatchSource`] subscribers.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Created(ModelRef, ModelSnapshot),
    Updated(ModelRef, ModelSnapshot),
    Deleted(ModelRef),
}

impl RawEvent {
    pub fn model_ref(&self) -> &ModelRef {
        match self {
            RawEvent::Created(r, _) | RawEvent::Updated(r, _) | RawEvent::Deleted(r) => r,
        }
    }
}

/// Reads and conditionally writes one model's spec.
///
/// Implementations are expected to be cheap to clone or already `Arc`-wrapped;
/// the Mounter calls through `&self` from many concurrent tasks.
pub trait StoreClient: Send + Sync {
    fn get(&self, model: &ModelRef) -> impl Future<Output = Result<ModelSnapshot, StoreError>> + Send;

    /// Applies a JSON merge patch (RFC 7386: a `null` leaf deletes the key it
    /// names, an object merges recursively, anything else replaces) to
    /// `model`'s spec. If `expected_resource_version` is given, the write is
    /// conditional on the stored `resourceVersion` still matching it, and
    /// fails with `Conflict` otherwise.
    fn patch(
        &self,
        model: &ModelRef,
        expected_resource_version: Option<&str>,
        merge_patch: Value,
    ) -> impl Future<Output = Result<ModelMeta, StoreError>> + Send;
}

/// Subscribes to change notifications for one model kind.
pub trait WatchSource: Send + Sync {
    fn subscribe(&self, gvr: &Gvr) -> broadcast::Receiver<RawEvent>;
}

/// A backend capable of both reading/writing and watching models.
///
/// Blanket-implemented for anything satisfying both halves, so `Mounter<C>`
/// can stay generic over a single bound instead of threading two.
pub trait Backend: StoreClient + WatchSource + Send + Sync + 'static {}
impl<T: StoreClient + WatchSource + Send + Sync + 'static> Backend for T {}

struct Record {
    meta: ModelMeta,
    spec: Value,
}

/// In-memory reference [`Backend`] used by the test suite and the demo binary.
///
/// Holds models in a concurrent map, bumps `generation` and `resourceVersion`
/// on every successful patch, and fans out a broadcast channel per `gvr` of
/// raw change events — standing in for a real API server's watch stream.
pub struct InMemoryStore {
    models: DashMap<ModelRef, Record, RandomState>,
    channels: Mutex<std::collections::HashMap<Gvr, broadcast::Sender<RawEvent>, RandomState>>,
    next_rv: std::sync::atomic::AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            models: DashMap::default(),
            channels: Mutex::new(std::collections::HashMap::default()),
            next_rv: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn next_resource_version(&self) -> String {
        let n = self
            .next_rv
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        n.to_string()
    }

    fn channel(&self, gvr: &Gvr) -> broadcast::Sender<RawEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(gvr.clone())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    /// Seeds a model directly, bypassing `patch`'s conditional semantics.
    /// Used by callers (tests, the demo binary) that need to set up initial
    /// state rather than simulate a client write.
    pub fn seed(&self, model: ModelRef, spec: Value) -> ModelMeta {
        let meta = ModelMeta {
            resource_version: self.next_resource_version(),
            generation: 0,
        };
        self.models.insert(
            model.clone(),
            Record {
                meta: meta.clone(),
                spec: spec.clone(),
            },
        );
        let _ = self.channel(&model.gvr).send(RawEvent::Created(
            model,
            ModelSnapshot {
                meta: meta.clone(),
                spec,
            },
        ));
        meta
    }

    /// Removes a model outright, emitting a deletion event. Not part of
    /// `StoreClient` since no caller in this crate deletes by full removal
    /// (mount teardown deletes only the mount entry, leaving the child
    /// resource itself untouched); exposed for test setup.
    pub fn remove(&self, model: &ModelRef) {
        if self.models.remove(model).is_some() {
            let _ = self
                .channel(&model.gvr)
                .send(RawEvent::Deleted(model.clone()));
        }
    }
}

/// Applies an RFC 7386 JSON merge patch in place.
fn merge(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target_obj), Some(patch_obj)) => {
            for (k, v) in patch_obj {
                if v.is_null() {
                    target_obj.remove(k);
                } else {
                    let entry = target_obj
                        .entry(k.clone())
                        .or_insert(Value::Object(Default::default()));
                    merge(entry, v);
                }
            }
        }
        _ => {
            *target = patch.clone();
        }
    }
}

impl StoreClient for InMemoryStore {
    async fn get(&self, model: &ModelRef) -> Result<ModelSnapshot, StoreError> {
        self.models
            .get(model)
            .map(|r| ModelSnapshot {
                meta: r.meta.clone(),
                spec: r.spec.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(model.clone()))
    }

    async fn patch(
        &self,
        model: &ModelRef,
        expected_resource_version: Option<&str>,
        merge_patch: Value,
    ) -> Result<ModelMeta, StoreError> {
        let mut entry = self
            .models
            .get_mut(model)
            .ok_or_else(|| StoreError::NotFound(model.clone()))?;

        if let Some(expected) = expected_resource_version {
            if entry.meta.resource_version != expected {
                return Err(StoreError::Conflict(model.clone()));
            }
        }

        merge(&mut entry.spec, &merge_patch);
        entry.meta.generation += 1;
        entry.meta.resource_version = self.next_resource_version();
        let snapshot = ModelSnapshot {
            meta: entry.meta.clone(),
            spec: entry.spec.clone(),
        };
        drop(entry);

        trace!(model = %model, generation = snapshot.meta.generation, "patched model");
        let _ = self
            .channel(&model.gvr)
            .send(RawEvent::Updated(model.clone(), snapshot.clone()));
        Ok(snapshot.meta)
    }
}

impl WatchSource for InMemoryStore {
    fn subscribe(&self, gvr: &Gvr) -> broadcast::Receiver<RawEvent> {
        self.channel(gvr).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Nsn;
    use serde_json::json;

    fn model(name: &str) -> ModelRef {
        ModelRef::new(
            Gvr {
                group: "a".into(),
                version: "v1".into(),
                plural: "foo".into(),
            },
            Nsn::named(name),
        )
    }

    #[tokio::test]
    async fn get_missing_model_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.get(&model("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn seed_then_get_round_trips() {
        let store = InMemoryStore::new();
        let m = model("x");
        store.seed(m.clone(), json!({"intent": 1}));
        let snap = store.get(&m).await.unwrap();
        assert_eq!(snap.spec, json!({"intent": 1}));
        assert_eq!(snap.meta.generation, 0);
    }

    #[tokio::test]
    async fn patch_merges_and_bumps_generation() {
        let store = InMemoryStore::new();
        let m = model("x");
        let seeded = store.seed(m.clone(), json!({"intent": 1, "status": 0}));
        let meta = store
            .patch(&m, Some(&seeded.resource_version), json!({"intent": 5}))
            .await
            .unwrap();
        assert_eq!(meta.generation, 1);
        let snap = store.get(&m).await.unwrap();
        assert_eq!(snap.spec, json!({"intent": 5, "status": 0}));
    }

    #[tokio::test]
    async fn patch_with_null_leaf_deletes_key() {
        let store = InMemoryStore::new();
        let m = model("x");
        store.seed(m.clone(), json!({"mount": {"a/v1/foo": {"default/x": {}}}}));
        store
            .patch(&m, None, json!({"mount": {"a/v1/foo": {"default/x": null}}}))
            .await
            .unwrap();
        let snap = store.get(&m).await.unwrap();
        assert_eq!(snap.spec, json!({"mount": {"a/v1/foo": {}}}));
    }

    #[tokio::test]
    async fn patch_rejects_stale_resource_version() {
        let store = InMemoryStore::new();
        let m = model("x");
        store.seed(m.clone(), json!({}));
        let err = store
            .patch(&m, Some("not-the-real-rv"), json!({"intent": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn subscribers_observe_patch_events() {
        let store = InMemoryStore::new();
        let gvr = Gvr {
            group: "a".into(),
            version: "v1".into(),
            plural: "foo".into(),
        };
        let mut rx = store.subscribe(&gvr);
        let m = ModelRef::new(gvr, Nsn::named("x"));
        store.seed(m.clone(), json!({}));
        let created = rx.recv().await.unwrap();
        assert!(matches!(created, RawEvent::Created(r, _) if r == m));
        store.patch(&m, None, json!({"intent": 1})).await.unwrap();
        let updated = rx.recv().await.unwrap();
        assert!(matches!(updated, RawEvent::Updated(r, _) if r == m));
    }
}
