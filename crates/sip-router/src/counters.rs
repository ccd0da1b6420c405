// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Live-call counters consulted by admission control.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use smol_str::SmolStr;

/// Lock-free gauges of live calls, global and per application.
///
/// Admission only needs a monotonically-consistent view, so plain relaxed
/// reads are enough; exact synchronization with worker startup is not
/// required.
#[derive(Debug, Default)]
pub struct CallCounters {
    total: AtomicUsize,
    per_app: DashMap<SmolStr, usize>,
}

impl CallCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live calls across every application.
    pub fn live_calls(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Number of live calls owned by one application.
    pub fn app_calls(&self, app: &SmolStr) -> usize {
        self.per_app.get(app).map(|c| *c).unwrap_or(0)
    }

    pub(crate) fn incr(&self, app: &SmolStr) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.per_app.entry(app.clone()).or_insert(0) += 1;
    }

    pub(crate) fn decr(&self, app: &SmolStr) {
        let _ = self
            .total
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        if let Some(mut count) = self.per_app.get_mut(app) {
            *count = count.saturating_sub(1);
        }
    }
}
