//! Router-level metrics (dispatch, replay, admission, worker lifecycle).

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::worker::ExitReason;

/// Thread-safe router metrics collector.
///
/// Cheap to clone; all clones share one underlying store.
#[derive(Debug, Clone, Default)]
pub struct RouterMetrics {
    inner: Arc<RwLock<MetricsData>>,
}

#[derive(Debug, Default)]
struct MetricsData {
    workers_spawned: u64,
    workers_finished: u64,
    workers_stopped: u64,
    workers_crashed: u64,
    sync_dispatched: u64,
    async_dispatched: u64,
    async_dropped: u64,
    acks: u64,
    replays: u64,
    rejected_too_many_calls: u64,
    rejected_unknown_app: u64,
    last_updated: Option<Instant>,
}

/// Point-in-time copy of the collected metrics.
#[derive(Debug, Clone, Default)]
pub struct RouterMetricsSnapshot {
    pub workers_spawned: u64,
    pub workers_finished: u64,
    pub workers_stopped: u64,
    pub workers_crashed: u64,
    pub sync_dispatched: u64,
    pub async_dispatched: u64,
    pub async_dropped: u64,
    pub acks: u64,
    pub replays: u64,
    pub rejected_too_many_calls: u64,
    pub rejected_unknown_app: u64,
    pub last_updated: Option<Instant>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_worker_spawned(&self) {
        let mut data = self.inner.write();
        data.workers_spawned += 1;
        data.last_updated = Some(Instant::now());
    }

    pub(crate) fn record_worker_exit(&self, reason: ExitReason) {
        let mut data = self.inner.write();
        match reason {
            ExitReason::Finished => data.workers_finished += 1,
            ExitReason::Stopped => data.workers_stopped += 1,
            ExitReason::Crashed => data.workers_crashed += 1,
        }
        data.last_updated = Some(Instant::now());
    }

    pub(crate) fn record_sync_dispatch(&self) {
        let mut data = self.inner.write();
        data.sync_dispatched += 1;
        data.last_updated = Some(Instant::now());
    }

    pub(crate) fn record_async_dispatch(&self) {
        let mut data = self.inner.write();
        data.async_dispatched += 1;
        data.last_updated = Some(Instant::now());
    }

    pub(crate) fn record_async_dropped(&self) {
        let mut data = self.inner.write();
        data.async_dropped += 1;
        data.last_updated = Some(Instant::now());
    }

    pub(crate) fn record_ack(&self) {
        let mut data = self.inner.write();
        data.acks += 1;
        data.last_updated = Some(Instant::now());
    }

    pub(crate) fn record_replay(&self) {
        let mut data = self.inner.write();
        data.replays += 1;
        data.last_updated = Some(Instant::now());
    }

    pub(crate) fn record_rejected_too_many_calls(&self) {
        let mut data = self.inner.write();
        data.rejected_too_many_calls += 1;
        data.last_updated = Some(Instant::now());
    }

    pub(crate) fn record_rejected_unknown_app(&self) {
        let mut data = self.inner.write();
        data.rejected_unknown_app += 1;
        data.last_updated = Some(Instant::now());
    }

    /// Gets the current metrics snapshot.
    pub fn snapshot(&self) -> RouterMetricsSnapshot {
        let data = self.inner.read();
        RouterMetricsSnapshot {
            workers_spawned: data.workers_spawned,
            workers_finished: data.workers_finished,
            workers_stopped: data.workers_stopped,
            workers_crashed: data.workers_crashed,
            sync_dispatched: data.sync_dispatched,
            async_dispatched: data.async_dispatched,
            async_dropped: data.async_dropped,
            acks: data.acks,
            replays: data.replays,
            rejected_too_many_calls: data.rejected_too_many_calls,
            rejected_unknown_app: data.rejected_unknown_app,
            last_updated: data.last_updated,
        }
    }

    /// Resets all collected metrics.
    pub fn reset(&self) {
        let mut data = self.inner.write();
        *data = MetricsData::default();
    }
}
