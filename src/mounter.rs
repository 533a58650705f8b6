//! The per-parent meta-controller: tracks the mounted child set, keeps one
//! live watch per child, and runs the bidirectional propagation algorithms.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bridge::ReconcileBridge;
use crate::diff::{apply_diff, trim, DiffOp};
use crate::error::StoreError;
use crate::ledger::GenerationLedger;
use crate::model::{Gvr, ModelMeta, ModelRef, Nsn};
use crate::mount::{find_mount, parse_mounts, MountMode, MountStatus};
use crate::store::{Backend, StoreClient};
use crate::watch::{Callbacks, Watch, WatchBody};

const STATUS_LIKE: &[&str] = &["status", "output", "obs"];

type ChildKey = (Gvr, Nsn);

pub(crate) struct MounterState {
    pub(crate) ledger: GenerationLedger,
    children: HashMap<ChildKey, Watch, RandomState>,
}

/// Orchestrates one parent watch plus a dynamic map of child watches.
///
/// `C` is the store backend; the Mounter is generic over it rather than
/// boxing a trait object, since nothing here needs dynamic dispatch and a
/// concrete type lets every sync routine stay a straight-line `async fn`.
pub struct Mounter<C: Backend> {
    client: Arc<C>,
    parent: ModelRef,
    state: Arc<Mutex<MounterState>>,
    parent_watch: Mutex<Option<Watch>>,
}

impl<C: Backend> Mounter<C> {
    pub fn new(client: Arc<C>, parent: ModelRef) -> Self {
        Mounter {
            client,
            parent,
            state: Arc::new(Mutex::new(MounterState {
                ledger: GenerationLedger::new(),
                children: HashMap::default(),
            })),
            parent_watch: Mutex::new(None),
        }
    }

    /// Returns a handle the surrounding reconcile loop uses to publish its
    /// own writes into the shared generation ledger.
    pub fn bridge(&self) -> ReconcileBridge {
        ReconcileBridge::new(self.state.clone())
    }

    /// Starts the parent watch. Each newly discovered child fires its own
    /// watch in turn, driven entirely from watch callbacks.
    pub fn start(&self) {
        let client_create = self.client.clone();
        let state_create = self.state.clone();
        let parent_create = self.parent.clone();

        let client_resume = self.client.clone();
        let state_resume = self.state.clone();
        let parent_resume = self.parent.clone();

        let client_field = self.client.clone();
        let state_field = self.state.clone();
        let parent_field = self.parent.clone();

        let state_delete = self.state.clone();

        let callbacks = Callbacks::new()
            .on_create(move |body| {
                let client = client_create.clone();
                let state = state_create.clone();
                let parent = parent_create.clone();
                async move {
                    reconcile_children_watches(&client, &state, &parent, &body.spec);
                }
            })
            .on_resume(move |body| {
                let client = client_resume.clone();
                let state = state_resume.clone();
                let parent = parent_resume.clone();
                async move {
                    reconcile_children_watches(&client, &state, &parent, &body.spec);
                }
            })
            .on_field("mount", move |body, diff| {
                let client = client_field.clone();
                let state = state_field.clone();
                let parent = parent_field.clone();
                async move { on_mount_attr_update(client, state, parent, body, diff).await }
            })
            .on_delete(move |_| {
                let state = state_delete.clone();
                async move { on_parent_delete(&state) }
            });

        let watch = Watch::start(
            self.client.as_ref(),
            self.parent.gvr.clone(),
            self.parent.nsn.clone(),
            callbacks,
        );
        *self.parent_watch.lock() = Some(watch);
    }

    /// Stops the parent watch and every child watch. Idempotent.
    pub fn stop(&self) {
        if let Some(w) = self.parent_watch.lock().take() {
            w.stop();
        }
        on_parent_delete(&self.state);
    }
}

fn on_parent_delete(state: &Arc<Mutex<MounterState>>) {
    let mut guard = state.lock();
    for (_, w) in guard.children.drain() {
        w.stop();
    }
    info!("parent watch stopped, all child watches torn down");
}

/// Adds a watch for every newly mounted child and stops the watch for every
/// child that dropped out of `spec.mount`. Holds the Mounter's mutex for the
/// whole scan so a concurrent `stop()` cannot interleave with it.
fn reconcile_children_watches<C: Backend>(
    client: &Arc<C>,
    state: &Arc<Mutex<MounterState>>,
    parent: &ModelRef,
    spec: &Value,
) {
    let (parsed, errors) = parse_mounts(spec);
    for e in &errors {
        warn!(error = %e, "skipping malformed mount entry");
    }

    let desired: Vec<ChildKey> = parsed
        .iter()
        .map(|p| (p.gvr.clone(), p.nsn.clone()))
        .collect();

    let mut guard = state.lock();

    let to_remove: Vec<ChildKey> = guard
        .children
        .keys()
        .filter(|k| !desired.contains(k))
        .cloned()
        .collect();
    for key in to_remove {
        if let Some(w) = guard.children.remove(&key) {
            w.stop();
        }
        guard.ledger.forget_child(&key);
        debug!(gvr = %key.0, nsn = %key.1, "child unmounted, watch stopped");
    }

    for key in desired {
        if guard.children.contains_key(&key) {
            continue;
        }
        let (gvr, nsn) = key.clone();
        let callbacks = child_callbacks(
            client.clone(),
            state.clone(),
            parent.clone(),
            gvr.clone(),
            nsn.clone(),
        );
        let watch = Watch::start(client.as_ref(), gvr.clone(), nsn.clone(), callbacks);
        debug!(%gvr, %nsn, "started child watch");
        guard.children.insert(key, watch);
    }
}

fn child_callbacks<C: Backend>(
    client: Arc<C>,
    state: Arc<Mutex<MounterState>>,
    parent: ModelRef,
    gvr: Gvr,
    nsn: Nsn,
) -> Callbacks {
    let (c1, s1, p1, g1, n1) = (
        client.clone(),
        state.clone(),
        parent.clone(),
        gvr.clone(),
        nsn.clone(),
    );
    let (c2, s2, p2, g2, n2) = (
        client.clone(),
        state.clone(),
        parent.clone(),
        gvr.clone(),
        nsn.clone(),
    );
    let (c3, s3, p3, g3, n3) = (
        client.clone(),
        state.clone(),
        parent.clone(),
        gvr.clone(),
        nsn.clone(),
    );

    Callbacks::new()
        .on_create(move |body| {
            let (client, state, parent, gvr, nsn) =
                (c1.clone(), s1.clone(), p1.clone(), g1.clone(), n1.clone());
            async move { on_child_create(client, state, parent, gvr, nsn, body).await }
        })
        .on_resume(move |body| {
            let (client, state, parent, gvr, nsn) =
                (c2.clone(), s2.clone(), p2.clone(), g2.clone(), n2.clone());
            async move { on_child_create(client, state, parent, gvr, nsn, body).await }
        })
        .on_update(move |body, diff| {
            let (client, state, parent, gvr, nsn) =
                (c3.clone(), s3.clone(), p3.clone(), g3.clone(), n3.clone());
            async move { on_child_update(client, state, parent, gvr, nsn, body, diff).await }
        })
        .on_delete(move |_| {
            let (client, state, parent, gvr, nsn) =
                (client.clone(), state.clone(), parent.clone(), gvr.clone(), nsn.clone());
            async move { on_child_delete(client, state, parent, gvr, nsn).await }
        })
}

/// First observation of a mounted child: pushes the parent's cached snapshot
/// down (if one exists yet), trimming status-like attributes so the push
/// does not clobber the child's own observed state, then captures the
/// child's full current spec back up into the parent. The second phase is
/// untrimmed — at first mount there is nothing in the parent's cache to
/// protect, and the worked examples expect the child's intent to surface in
/// the parent's snapshot on the very first sync.
async fn on_child_create<C: Backend>(
    client: Arc<C>,
    state: Arc<Mutex<MounterState>>,
    parent: ModelRef,
    gvr: Gvr,
    nsn: Nsn,
    body: WatchBody,
) {
    let span = info_span!("mount_sync", %gvr, %nsn);
    async move {
        let parent_snap = match client.get(&parent).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "unable to read parent for initial child sync");
                return;
            }
        };
        let (parsed, _errors) = parse_mounts(&parent_snap.spec);
        if let Some(entry) = find_mount(&parsed, &gvr, &nsn) {
            if !entry.entry.spec.is_null() {
                let push = trim(&entry.entry.spec, STATUS_LIKE);
                let rv = entry
                    .entry
                    .version
                    .clone()
                    .unwrap_or_else(|| body.meta.resource_version.clone());
                // Primed before the patch is issued: the store broadcasts the
                // resulting echo synchronously inside `patch`, and on the
                // multi-thread runtime the child watch task can dequeue and
                // check `is_child_echo` before this task resumes from the
                // `.await`. The value is the child's pre-patch generation, tied
                // to the same CAS token as the patch itself, so priming early
                // is safe even if the patch ultimately fails.
                state
                    .lock()
                    .ledger
                    .set_child_generation((gvr.clone(), nsn.clone()), body.meta.generation);
                let child_ref = ModelRef::new(gvr.clone(), nsn.clone());
                match client.patch(&child_ref, Some(&rv), push).await {
                    Ok(_) => debug!("pushed parent snapshot to newly observed child"),
                    Err(e) => warn!(error = %e, "failed to push initial parent snapshot to child"),
                }
            }
        } else {
            debug!("no mount entry for newly observed child yet, skipping initial push");
        }

        sync_child_to_parent(
            &client,
            &state,
            &parent,
            &gvr,
            &nsn,
            &body.spec,
            &body.meta,
            None,
            &[],
        )
        .await;
    }
    .instrument(span)
    .await;
}

async fn on_child_update<C: Backend>(
    client: Arc<C>,
    state: Arc<Mutex<MounterState>>,
    parent: ModelRef,
    gvr: Gvr,
    nsn: Nsn,
    body: WatchBody,
    diff: Vec<DiffOp>,
) {
    let key = (gvr.clone(), nsn.clone());
    let is_echo = state.lock().ledger.is_child_echo(&key, body.meta.generation);
    if is_echo {
        debug!(%gvr, %nsn, generation = body.meta.generation, "dropping self-echo of child update");
        return;
    }
    sync_child_to_parent(
        &client,
        &state,
        &parent,
        &gvr,
        &nsn,
        &body.spec,
        &body.meta,
        Some(&diff),
        &[],
    )
    .await;
}

async fn on_child_delete<C: Backend>(
    client: Arc<C>,
    state: Arc<Mutex<MounterState>>,
    parent: ModelRef,
    gvr: Gvr,
    nsn: Nsn,
) {
    let key = (gvr.clone(), nsn.clone());
    {
        let mut guard = state.lock();
        guard.children.remove(&key);
        guard.ledger.forget_child(&key);
    }

    let mut backoff = ExponentialBackoff {
        max_elapsed_time: None,
        ..Default::default()
    };
    loop {
        let parent_snap = match client.get(&parent).await {
            Ok(s) => s,
            Err(StoreError::NotFound(_)) => {
                warn!("parent gone while propagating child deletion");
                return;
            }
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
                warn!(error = %e, ?delay, "transient error reading parent, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let (parsed, _errors) = parse_mounts(&parent_snap.spec);
        let Some(entry) = find_mount(&parsed, &gvr, &nsn) else {
            debug!("mount entry already absent, nothing to remove");
            return;
        };

        let patch = mount_patch(&entry.raw_gvr, &entry.raw_nsn, Value::Null);
        match client
            .patch(&parent, Some(&parent_snap.meta.resource_version), patch)
            .await
        {
            Ok(_) => {
                debug!(%gvr, %nsn, "removed mount entry after child deletion");
                return;
            }
            Err(StoreError::Conflict(_)) => {
                continue;
            }
            Err(StoreError::NotFound(_)) => return,
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
                warn!(error = %e, ?delay, "transient error removing mount entry, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// `on_mount_attr_update`: reacts to a change under `spec.mount`. Drops its
/// own echo, reconciles the child-watch set, then pushes parent→child for
/// every active entry the diff touched.
async fn on_mount_attr_update<C: Backend>(
    client: Arc<C>,
    state: Arc<Mutex<MounterState>>,
    parent: ModelRef,
    body: WatchBody,
    diff: Vec<DiffOp>,
) {
    let is_echo = state.lock().ledger.is_parent_echo(body.meta.generation);
    if is_echo {
        debug!(generation = body.meta.generation, "dropping self-echo of mount patch");
        return;
    }

    reconcile_children_watches(&client, &state, &parent, &body.spec);
    push_active_children(&client, &state, &body.spec, &diff).await;
}

/// Parent→child propagation (section 4.6). Each push is a single CAS
/// attempt: on `Conflict` it is logged and abandoned, relying on the next
/// `spec.mount` field event to re-drive the remaining work, unlike the
/// unbounded retry used for child→parent.
async fn push_active_children<C: Backend>(
    client: &Arc<C>,
    state: &Arc<Mutex<MounterState>>,
    parent_spec: &Value,
    diff: &[DiffOp],
) {
    let mut sorted_diff = diff.to_vec();
    sorted_diff.sort_by(|a, b| a.path.cmp(&b.path));

    let mut candidates: Vec<ChildKey> = Vec::new();
    for d in &sorted_diff {
        if d.path.len() < 3 {
            continue;
        }
        let Ok(gvr) = d.path[0].parse::<Gvr>() else {
            continue;
        };
        let nsn: Nsn = d.path[1].parse().expect("Nsn parsing is infallible");
        let key = (gvr, nsn);
        if !candidates.contains(&key) {
            candidates.push(key);
        }
    }

    let (parsed, _errors) = parse_mounts(parent_spec);
    if sorted_diff.is_empty() {
        for p in &parsed {
            let key = (p.gvr.clone(), p.nsn.clone());
            if !candidates.contains(&key) {
                candidates.push(key);
            }
        }
    }

    for (gvr, nsn) in candidates {
        let Some(entry) = find_mount(&parsed, &gvr, &nsn) else {
            continue;
        };
        if entry.entry.status != MountStatus::Active {
            continue;
        }
        if entry.entry.spec.is_null() {
            continue;
        }
        let Some(version) = entry.entry.version.clone() else {
            continue;
        };
        let Some(generation) = entry.entry.generation else {
            continue;
        };

        let mut child_spec = trim(&entry.entry.spec, STATUS_LIKE);
        if entry.entry.mode == MountMode::Hide {
            child_spec = trim(&child_spec, &["mount"]);
        }

        // Primed before the patch, not after: see the matching comment in
        // `on_child_create`. `generation` is the pre-patch value tied to the
        // same `version` CAS token used below.
        state
            .lock()
            .ledger
            .set_child_generation((gvr.clone(), nsn.clone()), generation);

        let child_ref = ModelRef::new(gvr.clone(), nsn.clone());
        match client.patch(&child_ref, Some(&version), child_spec).await {
            Ok(_) => debug!(%gvr, %nsn, "pushed parent intent to child"),
            Err(e) => {
                warn!(%gvr, %nsn, error = %e, "failed to push parent intent to child, next mount update will retry");
            }
        }
    }
}

/// Child→parent propagation (section 4.6). Retries unbounded on `Conflict`
/// since there is no newer authoritative source than the child's own state.
#[allow(clippy::too_many_arguments)]
async fn sync_child_to_parent<C: Backend>(
    client: &Arc<C>,
    state: &Arc<Mutex<MounterState>>,
    parent: &ModelRef,
    gvr: &Gvr,
    nsn: &Nsn,
    child_spec: &Value,
    child_meta: &ModelMeta,
    diff: Option<&[DiffOp]>,
    attrs_to_trim: &[&str],
) {
    let mut backoff = ExponentialBackoff {
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        let parent_snap = match client.get(parent).await {
            Ok(s) => s,
            Err(StoreError::NotFound(_)) => {
                warn!("parent no longer exists, aborting child-to-parent sync");
                return;
            }
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
                warn!(error = %e, ?delay, "transient error reading parent, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let (parsed, _errors) = parse_mounts(&parent_snap.spec);
        let Some(entry) = find_mount(&parsed, gvr, nsn) else {
            debug!("mount entry no longer present, nothing to sync");
            return;
        };

        let mut snapshot = child_spec.clone();
        if let Some(d) = diff {
            snapshot = apply_diff(&snapshot, d);
        }
        if !attrs_to_trim.is_empty() {
            snapshot = trim(&snapshot, attrs_to_trim);
        }
        if entry.entry.mode == MountMode::Hide {
            snapshot = trim(&snapshot, &["mount"]);
        }

        let patch = mount_patch(
            &entry.raw_gvr,
            &entry.raw_nsn,
            serde_json::json!({
                "spec": snapshot,
                "version": child_meta.resource_version,
                "generation": child_meta.generation,
            }),
        );

        // Primed before the patch, not after: see the matching comment in
        // `on_child_create`. `parent_snap.meta.generation` is the pre-patch
        // value tied to the same resource-version CAS token used below; if
        // the CAS loses the race the next iteration re-reads and re-primes.
        state
            .lock()
            .ledger
            .set_parent_generation(parent_snap.meta.generation);

        match client
            .patch(parent, Some(&parent_snap.meta.resource_version), patch)
            .await
        {
            Ok(_) => {
                debug!(%gvr, %nsn, "synced child state to parent");
                return;
            }
            Err(StoreError::Conflict(_)) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_millis(500));
                warn!(%gvr, %nsn, ?delay, "conflict syncing child to parent, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(StoreError::NotFound(_)) => {
                warn!("parent disappeared mid-sync, aborting");
                return;
            }
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
                warn!(%gvr, %nsn, error = %e, ?delay, "transient error syncing child to parent, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn mount_patch(raw_gvr: &str, raw_nsn: &str, entry_value: Value) -> Value {
    let mut nsn_map = Map::new();
    nsn_map.insert(raw_nsn.to_string(), entry_value);
    let mut gvr_map = Map::new();
    gvr_map.insert(raw_gvr.to_string(), Value::Object(nsn_map));
    let mut root = Map::new();
    root.insert("mount".to_string(), Value::Object(gvr_map));
    Value::Object(root)
}
