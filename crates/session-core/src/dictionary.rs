//! The `Dictionary` pattern (spec §9): "deep inheritance among
//! session/request/stream types collapses into a single interface... a
//! typed attribute bag with read/write policies implemented by each
//! concrete entity." Modules attach arbitrary per-request or per-session
//! scratch data here instead of the core growing a field for every plugin's
//! private state.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a slot in a [`Dictionary`] may be overwritten after first write.
/// Most module-attached attributes are read-write; a handful of core-owned
/// ones (e.g. the resolved user profile after `Authenticate` runs) are
/// write-once so a later module can't silently clobber an earlier
/// decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    ReadWrite,
    WriteOnce,
}

struct Slot {
    value: Arc<dyn Any + Send + Sync>,
    policy: Policy,
}

/// A typed attribute bag keyed by string name. `get`/`set` are generic over
/// the stored type; a failed downcast returns `None` rather than panicking,
/// since a module asking for the wrong type is a module bug, not a core
/// invariant violation.
#[derive(Default)]
pub struct Dictionary {
    slots: HashMap<String, Slot>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary {
            slots: HashMap::new(),
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.slots
            .get(key)
            .and_then(|slot| slot.value.clone().downcast::<T>().ok())
    }

    /// Set `key` to `value` with [`Policy::ReadWrite`]. Returns `false`
    /// (and leaves the dictionary unchanged) if `key` already holds a
    /// [`Policy::WriteOnce`] value.
    pub fn set<T: Send + Sync + 'static>(&mut self, key: &str, value: T) -> bool {
        self.set_with_policy(key, value, Policy::ReadWrite)
    }

    pub fn set_once<T: Send + Sync + 'static>(&mut self, key: &str, value: T) -> bool {
        self.set_with_policy(key, value, Policy::WriteOnce)
    }

    fn set_with_policy<T: Send + Sync + 'static>(
        &mut self,
        key: &str,
        value: T,
        policy: Policy,
    ) -> bool {
        if let Some(existing) = self.slots.get(key) {
            if existing.policy == Policy::WriteOnce {
                return false;
            }
        }
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Arc::new(value),
                policy,
            },
        );
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.slots.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_typed_value() {
        let mut dict = Dictionary::new();
        dict.set("user", "alice".to_string());
        assert_eq!(dict.get::<String>("user").as_deref(), Some(&"alice".to_string()));
    }

    #[test]
    fn write_once_rejects_a_second_write() {
        let mut dict = Dictionary::new();
        assert!(dict.set_once("auth-profile", 1u32));
        assert!(!dict.set_once("auth-profile", 2u32));
        assert_eq!(*dict.get::<u32>("auth-profile").unwrap(), 1);
    }

    #[test]
    fn wrong_type_lookup_returns_none_instead_of_panicking() {
        let mut dict = Dictionary::new();
        dict.set("n", 42u32);
        assert!(dict.get::<String>("n").is_none());
    }
}
