//! Parses the driver process's environment into a typed [`DriverConfig`].

use crate::error::ConfigError;
use crate::model::{Gvr, ModelRef, Nsn};

/// The parent identity and feature switches a driver process reads from its
/// environment at startup.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub parent: ModelRef,
    pub mounter_enabled: bool,
}

impl DriverConfig {
    /// Reads `GROUP`, `VERSION`, `PLURAL`, `NAME`, `NAMESPACE`, `MOUNTER` from
    /// the process environment. `NAMESPACE` defaults to `"default"`;
    /// `MOUNTER` is parsed case-sensitively against the literal `"false"` —
    /// anything else, including unset, leaves the Mounter enabled.
    pub fn from_env() -> Result<Self, ConfigError> {
        let group = require_env("GROUP")?;
        let version = require_env("VERSION")?;
        let plural = require_env("PLURAL")?;
        let name = require_env("NAME")?;
        let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let mounter_enabled = std::env::var("MOUNTER").as_deref() != Ok("false");

        Ok(DriverConfig {
            parent: ModelRef::new(Gvr { group, version, plural }, Nsn::new(namespace, name)),
            mounter_enabled,
        })
    }
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingVar(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable access races across tests run in the same
    // process; serialize the ones in this module behind a lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear() {
        for key in ["GROUP", "VERSION", "PLURAL", "NAME", "NAMESPACE", "MOUNTER"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn missing_required_var_is_reported() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        let err = DriverConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("GROUP")));
    }

    #[test]
    fn defaults_namespace_and_enables_mounter_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        std::env::set_var("GROUP", "a");
        std::env::set_var("VERSION", "v1");
        std::env::set_var("PLURAL", "foo");
        std::env::set_var("NAME", "x");
        let cfg = DriverConfig::from_env().unwrap();
        assert_eq!(cfg.parent.nsn, Nsn::new("default", "x"));
        assert!(cfg.mounter_enabled);
        clear();
    }

    #[test]
    fn mounter_false_disables_and_anything_else_does_not() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        std::env::set_var("GROUP", "a");
        std::env::set_var("VERSION", "v1");
        std::env::set_var("PLURAL", "foo");
        std::env::set_var("NAME", "x");
        std::env::set_var("MOUNTER", "false");
        assert!(!DriverConfig::from_env().unwrap().mounter_enabled);

        std::env::set_var("MOUNTER", "False");
        assert!(DriverConfig::from_env().unwrap().mounter_enabled);
        clear();
    }
}
