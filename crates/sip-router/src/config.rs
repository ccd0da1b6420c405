// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Router configuration and the per-shard snapshot of it.

use std::thread;
use std::time::Duration;

use smol_str::SmolStr;

/// Default SIP timer values per RFC 3261 §17 (plus proxy Timer C, §16.6).
const T1_DEFAULT: Duration = Duration::from_millis(500); // RTT estimate
const T2_DEFAULT: Duration = Duration::from_secs(4); // Maximum retransmit interval
const T4_DEFAULT: Duration = Duration::from_secs(5); // Maximum duration a message remains in network
const TIMER_C_DEFAULT: Duration = Duration::from_secs(180);

/// SIP protocol timers handed to every call worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SipTimers {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub c: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: T1_DEFAULT,
            t2: T2_DEFAULT,
            t4: T4_DEFAULT,
            c: TIMER_C_DEFAULT,
        }
    }
}

/// Router-wide configuration, read once at startup.
///
/// Changing an application's options after startup does not reach running
/// shards; the owning supervisor is expected to restart the router instead.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deployment-global identifier stamped into worker context.
    pub global_id: SmolStr,
    /// Number of router shards. Power of two near the CPU count by default.
    pub shards: usize,
    /// Maximum number of concurrent calls across all applications.
    pub max_calls: usize,
    /// Deadline for a synchronous work round-trip.
    pub sync_timeout: Duration,
    /// Maximum lifetime of a single transaction inside a worker.
    pub transaction_timeout: Duration,
    /// Maximum idle lifetime of a dialog inside a worker.
    pub dialog_timeout: Duration,
    /// Hard cap on total dialog duration.
    pub max_dialog_time: Duration,
    /// RFC 3261 timers.
    pub timers: SipTimers,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            global_id: SmolStr::new_static("global"),
            shards: default_shards(),
            max_calls: 100_000,
            sync_timeout: Duration::from_secs(5),
            transaction_timeout: Duration::from_secs(900),
            dialog_timeout: Duration::from_secs(1800),
            max_dialog_time: Duration::from_secs(86_400),
            timers: SipTimers::default(),
        }
    }
}

impl RouterConfig {
    /// Builder-style helper to cap concurrent calls.
    pub fn with_max_calls(mut self, max_calls: usize) -> Self {
        self.max_calls = max_calls;
        self
    }

    /// Builder-style helper to set the shard count.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1);
        self
    }

    /// Builder-style helper to set the synchronous deadline.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Immutable snapshot captured by every shard at startup.
    pub fn global(&self) -> RouterGlobal {
        RouterGlobal {
            global_id: self.global_id.clone(),
            max_calls: self.max_calls,
            sync_timeout: self.sync_timeout,
            transaction_timeout: self.transaction_timeout,
            dialog_timeout: self.dialog_timeout,
            max_dialog_time: self.max_dialog_time,
            timers: self.timers,
        }
    }
}

/// Per-shard copy of the startup configuration.
#[derive(Debug, Clone)]
pub struct RouterGlobal {
    pub global_id: SmolStr,
    pub max_calls: usize,
    pub sync_timeout: Duration,
    pub transaction_timeout: Duration,
    pub dialog_timeout: Duration,
    pub max_dialog_time: Duration,
    pub timers: SipTimers,
}

fn default_shards() -> usize {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(8);
    cpus.next_power_of_two()
}
