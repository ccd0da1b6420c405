// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bidirectional registry of live call workers within one shard.

use std::collections::HashMap;

use crate::worker::{WorkerHandle, WorkerId};
use crate::CallKey;

/// Maps call keys to worker handles and worker ids back to call keys.
///
/// Both directions are maintained together: the forward direction serves
/// dispatch, the reverse direction serves cleanup when a worker terminates.
/// Removal through either direction clears both.
#[derive(Debug, Default)]
pub struct Registry {
    forward: HashMap<CallKey, WorkerHandle>,
    reverse: HashMap<WorkerId, CallKey>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker for a call.
    ///
    /// A call has at most one worker; an existing entry for the same key is
    /// displaced in both directions first.
    pub fn insert(&mut self, key: CallKey, handle: WorkerHandle) {
        if let Some(stale) = self.forward.remove(&key) {
            self.reverse.remove(&stale.id());
        }
        self.reverse.insert(handle.id(), key.clone());
        self.forward.insert(key, handle);
    }

    pub fn by_key(&self, key: &CallKey) -> Option<&WorkerHandle> {
        self.forward.get(key)
    }

    pub fn key_of(&self, worker: WorkerId) -> Option<&CallKey> {
        self.reverse.get(&worker)
    }

    /// Removes a call entry; both directions are cleared.
    pub fn remove_by_key(&mut self, key: &CallKey) -> Option<WorkerHandle> {
        let handle = self.forward.remove(key)?;
        self.reverse.remove(&handle.id());
        Some(handle)
    }

    /// Removes a worker's entry; both directions are cleared.
    pub fn remove_by_worker(&mut self, worker: WorkerId) -> Option<(CallKey, WorkerHandle)> {
        let key = self.reverse.remove(&worker)?;
        let handle = self.forward.remove(&key)?;
        Some((key, handle))
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Iterates over the registered call keys.
    pub fn keys(&self) -> impl Iterator<Item = &CallKey> {
        self.forward.keys()
    }

    /// Iterates over `(key, handle)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&CallKey, &WorkerHandle)> {
        self.forward.iter()
    }

    /// Whether forward and reverse directions agree entry for entry.
    pub fn is_consistent(&self) -> bool {
        self.forward.len() == self.reverse.len()
            && self.forward.iter().all(|(key, handle)| {
                self.reverse.get(&handle.id()).map(|k| k == key).unwrap_or(false)
            })
    }
}
