//! Identity types for models in the store: `(group, version, plural)` plus
//! `(namespace, name)`, and the metadata the store attaches to every model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// `(group, version, plural)` identifying a model kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.plural)
    }
}

/// A `gvr-string` of the wrong shape: not exactly three `/`-separated parts.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid gvr string {0:?}: expected \"group/version/plural\"")]
pub struct ParseGvrError(String);

impl FromStr for Gvr {
    type Err = ParseGvrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(group), Some(version), Some(plural)) if !plural.contains('/') => Ok(Gvr {
                group: group.to_string(),
                version: version.to_string(),
                plural: plural.to_string(),
            }),
            _ => Err(ParseGvrError(s.to_string())),
        }
    }
}

/// `(namespace, name)` identifying a model instance.
///
/// `Display` always produces the canonical `"namespace/name"` form. `FromStr`
/// additionally accepts a bare `"name"`, defaulting the namespace to
/// `"default"`, for compatibility with `mount` entries authored before a
/// namespace was made mandatory on write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nsn {
    pub namespace: String,
    pub name: String,
}

impl Nsn {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Nsn {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// A bare name in the `default` namespace.
    pub fn named(name: impl Into<String>) -> Self {
        Nsn::new("default", name)
    }
}

impl fmt::Display for Nsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for Nsn {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) => Ok(Nsn::new(ns, name)),
            None => Ok(Nsn::named(s)),
        }
    }
}

/// Fully qualified reference to one model in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelRef {
    pub gvr: Gvr,
    pub nsn: Nsn,
}

impl ModelRef {
    pub fn new(gvr: Gvr, nsn: Nsn) -> Self {
        ModelRef { gvr, nsn }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.nsn, self.gvr)
    }
}

/// Store-side bookkeeping attached to every model: the optimistic-concurrency
/// token and the monotone change counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub resource_version: String,
    pub generation: i64,
}
