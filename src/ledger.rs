//! Per-parent memory of "last generation we wrote", used to recognize and
//! drop the echo event caused by the runtime's own patch.

use std::collections::HashMap;

use crate::model::{Gvr, Nsn};

/// `(gvr, nsn)` key used to index the child half of the ledger.
type ChildKey = (Gvr, Nsn);

/// Tracks the last generation the Mounter (or the [`ReconcileBridge`](crate::bridge::ReconcileBridge))
/// wrote to the parent, and the last generation it wrote to each mounted
/// child. An observed generation equal to `ledger_entry + 1` is recognized as
/// the runtime's own echo and must be dropped by the caller.
#[derive(Debug, Default)]
pub struct GenerationLedger {
    parent: i64,
    child: HashMap<ChildKey, i64, ahash::RandomState>,
}

impl GenerationLedger {
    pub fn new() -> Self {
        GenerationLedger {
            parent: -1,
            child: HashMap::default(),
        }
    }

    pub fn parent_generation(&self) -> i64 {
        self.parent
    }

    /// Records a generation we wrote to the parent. Monotone: a lower value
    /// than what is already recorded is ignored.
    pub fn set_parent_generation(&mut self, generation: i64) {
        self.parent = self.parent.max(generation);
    }

    pub fn is_parent_echo(&self, observed_generation: i64) -> bool {
        observed_generation == self.parent + 1
    }

    pub fn child_generation(&self, key: &ChildKey) -> Option<i64> {
        self.child.get(key).copied()
    }

    /// Records a generation we wrote to a child. Monotone per key.
    pub fn set_child_generation(&mut self, key: ChildKey, generation: i64) {
        let entry = self.child.entry(key).or_insert(-1);
        *entry = (*entry).max(generation);
    }

    pub fn is_child_echo(&self, key: &ChildKey, observed_generation: i64) -> bool {
        matches!(self.child.get(key), Some(g) if observed_generation == g + 1)
    }

    /// Drops all memory of a child, e.g. once its mount entry is removed.
    pub fn forget_child(&mut self, key: &ChildKey) {
        self.child.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ChildKey {
        (
            Gvr {
                group: "a".into(),
                version: "v1".into(),
                plural: "foo".into(),
            },
            Nsn::named(name),
        )
    }

    #[test]
    fn defaults_to_minus_one_and_recognizes_the_next_echo() {
        let ledger = GenerationLedger::new();
        assert_eq!(ledger.parent_generation(), -1);
        assert!(ledger.is_parent_echo(0));
        assert!(!ledger.is_parent_echo(1));
    }

    #[test]
    fn parent_generation_is_monotone() {
        let mut ledger = GenerationLedger::new();
        ledger.set_parent_generation(5);
        ledger.set_parent_generation(2);
        assert_eq!(ledger.parent_generation(), 5);
    }

    #[test]
    fn child_echo_is_scoped_per_key() {
        let mut ledger = GenerationLedger::new();
        let k1 = key("x");
        let k2 = key("y");
        ledger.set_child_generation(k1.clone(), 7);
        assert!(ledger.is_child_echo(&k1, 8));
        assert!(!ledger.is_child_echo(&k1, 9));
        assert!(!ledger.is_child_echo(&k2, 8));
    }

    #[test]
    fn forgetting_a_child_clears_its_echo_memory() {
        let mut ledger = GenerationLedger::new();
        let k = key("x");
        ledger.set_child_generation(k.clone(), 7);
        ledger.forget_child(&k);
        assert!(!ledger.is_child_echo(&k, 8));
    }
}
