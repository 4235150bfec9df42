//! The RTSP-session and RTP-session registries (spec §3, §5): refcounted
//! lookup tables keyed by generated session id. Callers must pair every
//! `resolve` with a `release` (spec §8's `OSRefTable` invariant); this is
//! the same refcounted-handle shape `rtsp-transport::socket_pool` uses for
//! UDP pair leases, generalized here to a string-keyed session map.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtp_session::RtpSession;

use crate::rtsp_session::RtspSessionHandle;

struct RegistryEntry<T> {
    value: Arc<T>,
    refcount: AtomicUsize,
}

/// A refcounted lease obtained from [`RtpSessionRegistry::resolve`]. Holds
/// the map alive and the entry's refcount bumped until dropped, at which
/// point `release` runs implicitly — the caller never has to remember to
/// call it by hand, which is the idiomatic strengthening of spec §5's
/// manual pairing rule.
pub struct Resolved<T> {
    map: Arc<Mutex<HashMap<u64, RegistryEntry<T>>>>,
    id: u64,
    value: Arc<T>,
}

impl<T> Deref for Resolved<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Resolved<T> {
    /// The underlying `Arc`, for callers (e.g. the packet pump) that need
    /// to outlive this particular lease rather than borrow through it.
    pub fn as_arc(&self) -> Arc<T> {
        self.value.clone()
    }
}

impl<T> Clone for Resolved<T> {
    fn clone(&self) -> Self {
        if let Some(entry) = self.map.lock().get(&self.id) {
            entry.refcount.fetch_add(1, Ordering::SeqCst);
        }
        Resolved {
            map: self.map.clone(),
            id: self.id,
            value: self.value.clone(),
        }
    }
}

impl<T> Drop for Resolved<T> {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        let Some(entry) = map.get(&self.id) else {
            return;
        };
        if entry.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            map.remove(&self.id);
        }
    }
}

/// A generic refcounted registry. Used for both the RTSP-session map and
/// the RTP-session map (spec §3); the two differ only in what `T` is.
pub struct Registry<T> {
    entries: Arc<Mutex<HashMap<u64, RegistryEntry<T>>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created value under `id` with refcount 1, as the
    /// creating RTSP Session's own reference (spec §3: "kept alive ...
    /// shared by reference-count between its RTSP Session and the
    /// ... map").
    pub fn insert(&self, id: u64, value: T) -> Resolved<T> {
        let value = Arc::new(value);
        self.entries.lock().insert(
            id,
            RegistryEntry {
                value: value.clone(),
                refcount: AtomicUsize::new(1),
            },
        );
        Resolved {
            map: self.entries.clone(),
            id,
            value,
        }
    }

    /// Look up `id`, bumping its refcount. The caller must hold (or drop)
    /// the returned [`Resolved`] exactly the way it would pair a manual
    /// `release` (spec §8).
    pub fn resolve(&self, id: u64) -> Option<Resolved<T>> {
        let map = self.entries.lock();
        let entry = map.get(&id)?;
        entry.refcount.fetch_add(1, Ordering::SeqCst);
        Some(Resolved {
            map: self.entries.clone(),
            id,
            value: entry.value.clone(),
        })
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Administrative kill: force-remove `id` regardless of outstanding
    /// refcount (spec §5: "an administrative kill sets the kill flag").
    /// Existing [`Resolved`] handles remain valid (their `Arc` keeps the
    /// value alive) but no further `resolve` will find it.
    pub fn force_remove(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    pub fn ids(&self) -> Vec<u64> {
        self.entries.lock().keys().copied().collect()
    }

    /// Insert only if `id` is not already present; used by the id
    /// generator's collision-retry loop (spec §4.9) to claim an id
    /// atomically with respect to concurrent inserts.
    pub fn try_claim(&self, id: u64, value: T) -> Result<Resolved<T>, T> {
        let mut map = self.entries.lock();
        match map.entry(id) {
            Entry::Occupied(_) => Err(value),
            Entry::Vacant(slot) => {
                let value = Arc::new(value);
                slot.insert(RegistryEntry {
                    value: value.clone(),
                    refcount: AtomicUsize::new(1),
                });
                Ok(Resolved {
                    map: self.entries.clone(),
                    id,
                    value,
                })
            }
        }
    }
}

pub type RtpSessionRegistry = Registry<RtpSession>;
pub type RtspSessionRegistry = Registry<RtspSessionHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_bumps_refcount_and_release_on_drop_shrinks_it() {
        let registry: Registry<u32> = Registry::new();
        let first = registry.insert(1, 100u32);
        assert_eq!(registry.len(), 1);

        let second = registry.resolve(1).unwrap();
        assert_eq!(*second, 100);

        drop(first);
        assert!(registry.contains(1), "still held by the resolved handle");

        drop(second);
        assert!(!registry.contains(1), "last handle dropped, entry destroyed");
    }

    #[test]
    fn try_claim_rejects_an_existing_id() {
        let registry: Registry<u32> = Registry::new();
        registry.insert(1, 1u32);
        assert!(registry.try_claim(1, 2u32).is_err());
        assert!(registry.try_claim(2, 2u32).is_ok());
    }

    #[test]
    fn force_remove_hides_entry_from_future_resolves() {
        let registry: Registry<u32> = Registry::new();
        let handle = registry.insert(1, 1u32);
        registry.force_remove(1);
        assert!(registry.resolve(1).is_none());
        assert_eq!(*handle, 1, "existing handle's Arc keeps the value alive");
    }
}
