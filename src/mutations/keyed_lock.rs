//! In-process mutual exclusion per key.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::thread::{self, ThreadId};

struct Holder {
    thread: ThreadId,
    depth: usize,
}

/// Serializes work on equal keys while letting distinct keys proceed in
/// parallel. Idle keys hold no memory.
///
/// Locks are reentrant per thread: a store may deliver change events on the
/// committing thread, and a subscriber reacting to them may mutate the same
/// key again before the outer guard is dropped.
pub struct KeyedLocks<K> {
    busy: Mutex<HashMap<K, Holder>>,
    released: Condvar,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            busy: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Block until `key` is free or already held by this thread, then hold
    /// it until the guard drops.
    pub fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let me = thread::current().id();
        let mut busy = self.busy.lock();
        loop {
            match busy.get(&key).map(|holder| holder.thread == me) {
                None => {
                    busy.insert(key.clone(), Holder { thread: me, depth: 1 });
                    break;
                }
                Some(true) => {
                    if let Some(holder) = busy.get_mut(&key) {
                        holder.depth += 1;
                    }
                    break;
                }
                Some(false) => self.released.wait(&mut busy),
            }
        }
        KeyGuard { locks: self, key }
    }

    /// Number of keys currently held.
    pub fn held(&self) -> usize {
        self.busy.lock().len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one key of a [`KeyedLocks`].
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    locks: &'a KeyedLocks<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        let mut busy = self.locks.busy.lock();
        let free = match busy.get_mut(&self.key) {
            Some(holder) => {
                holder.depth -= 1;
                holder.depth == 0
            }
            None => false,
        };
        if free {
            busy.remove(&self.key);
            drop(busy);
            self.locks.released.notify_all();
        }
    }
}
