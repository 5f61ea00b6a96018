//! Per-key compute-once memoization.
//!
//! The first caller for a key runs the computation; concurrent callers
//! block on the same slot and observe the identical result, errors
//! included. Used by the module cache so one download serves every
//! waiter.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};

struct Slot<V> {
    state: Mutex<Option<V>>,
    ready: Condvar,
}

pub struct OnceMap<K, V> {
    slots: Mutex<HashMap<K, Arc<Slot<V>>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> OnceMap<K, V> {
    pub fn new() -> OnceMap<K, V> {
        OnceMap {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the memoized value for `key`, computing it with `f` if
    /// this is the first request.
    pub fn get_or_init(&self, key: &K, f: impl FnOnce() -> V) -> V {
        let (slot, owner) = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Slot {
                        state: Mutex::new(None),
                        ready: Condvar::new(),
                    });
                    slots.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };
        if owner {
            let value = f();
            let mut state = slot.state.lock().unwrap();
            *state = Some(value.clone());
            slot.ready.notify_all();
            value
        } else {
            let mut state = slot.state.lock().unwrap();
            while state.is_none() {
                state = slot.ready.wait(state).unwrap();
            }
            state.as_ref().expect("slot filled").clone()
        }
    }

    /// The value for `key` if it has already been computed.
    pub fn get(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(key)?;
        let state = slot.state.lock().unwrap();
        state.clone()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for OnceMap<K, V> {
    fn default() -> Self {
        OnceMap::new()
    }
}
