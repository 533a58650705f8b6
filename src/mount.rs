//! The `mount` attribute: its on-wire shape and parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MounterError;
use crate::model::{Gvr, Nsn};

/// Whether a mount entry's `spec` is actively pushed from parent to child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountStatus {
    Active,
    Inactive,
}

impl Default for MountStatus {
    fn default() -> Self {
        MountStatus::Inactive
    }
}

/// Whether a child's own `mount` subtree is stripped before being snapshotted
/// into the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Hide,
    Show,
}

impl Default for MountMode {
    fn default() -> Self {
        MountMode::Hide
    }
}

/// One entry of `spec.mount[gvr][nsn]`: the parent's projection of a child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountEntry {
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub generation: Option<i64>,
    #[serde(default)]
    pub status: MountStatus,
    #[serde(default)]
    pub mode: MountMode,
}

/// A parsed mount entry together with the raw keys it was found under.
///
/// The raw keys are kept around so that writes back to the parent re-use
/// whatever key form (bare name or `namespace/name`) the document already
/// has, instead of introducing a second, canonicalized key alongside it.
#[derive(Debug, Clone)]
pub struct ParsedMount {
    pub gvr: Gvr,
    pub nsn: Nsn,
    pub raw_gvr: String,
    pub raw_nsn: String,
    pub entry: MountEntry,
}

/// Parses `spec.mount` into a flat list of entries, normalizing every `nsn`
/// to be fully namespace-qualified. Entries with missing or malformed
/// required fields are reported separately rather than failing the whole
/// parse, per the `MalformedMount` policy: log and skip, never crash the
/// Mounter over one bad entry.
pub fn parse_mounts(spec: &Value) -> (Vec<ParsedMount>, Vec<MounterError>) {
    let mut parsed = Vec::new();
    let mut errors = Vec::new();

    let Some(mount) = spec.get("mount").and_then(Value::as_object) else {
        return (parsed, errors);
    };

    for (raw_gvr, models) in mount {
        let gvr = match raw_gvr.parse::<Gvr>() {
            Ok(gvr) => gvr,
            Err(e) => {
                errors.push(MounterError::MalformedMount {
                    gvr: raw_gvr.clone(),
                    nsn: String::new(),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let Some(models) = models.as_object() else {
            errors.push(MounterError::MalformedMount {
                gvr: raw_gvr.clone(),
                nsn: String::new(),
                reason: "expected an object of nsn -> mount entry".to_string(),
            });
            continue;
        };
        for (raw_nsn, entry_value) in models {
            // A `null` leaf is a pending deletion tombstone written by a
            // patch, not a live entry; `StoreClient::patch` removes these
            // from the document entirely, but a test double or a concurrent
            // reader could still observe one transiently.
            if entry_value.is_null() {
                continue;
            }
            let nsn: Nsn = raw_nsn.parse().expect("Nsn parsing is infallible");
            match serde_json::from_value::<MountEntry>(entry_value.clone()) {
                Ok(entry) => parsed.push(ParsedMount {
                    gvr: gvr.clone(),
                    nsn,
                    raw_gvr: raw_gvr.clone(),
                    raw_nsn: raw_nsn.clone(),
                    entry,
                }),
                Err(e) => errors.push(MounterError::MalformedMount {
                    gvr: gvr.to_string(),
                    nsn: nsn.to_string(),
                    reason: e.to_string(),
                }),
            }
        }
    }

    (parsed, errors)
}

/// Looks up a parsed mount entry by its canonical `(gvr, nsn)`.
pub fn find_mount<'a>(parsed: &'a [ParsedMount], gvr: &Gvr, nsn: &Nsn) -> Option<&'a ParsedMount> {
    parsed.iter().find(|p| &p.gvr == gvr && &p.nsn == nsn)
}
