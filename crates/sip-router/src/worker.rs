// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Call worker seam: the behavior trait, the runner task that drives it, and
//! the exit notification delivered back to the owning shard.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::apps::AppOpts;
use crate::config::RouterGlobal;
use crate::shard::{MonitorRef, ShardCommand, ShardSender};
use crate::{CallKey, DialogId, Work, WorkOrigin};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one live call worker.
///
/// Never reused: a replacement worker for the same call gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a worker terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The worker decided the call was over.
    Finished,
    /// An explicit stop request was honored.
    Stopped,
    /// The worker task panicked or aborted.
    Crashed,
}

/// Whether the worker keeps serving its call after a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFlow {
    Continue,
    Finish,
}

/// Opaque per-call state exposed for observability.
#[derive(Debug, Clone, Default)]
pub struct CallData {
    pub dialogs: Vec<DialogId>,
    pub sipmsgs: Vec<SmolStr>,
    pub transactions: Vec<SmolStr>,
}

/// Behavior of a call worker: the serialized context that owns one call's
/// transactions, dialogs, and timers.
///
/// The router guarantees that a worker sees work for its call in submission
/// order and that no second worker for the same call exists while it lives.
/// Synchronous work must eventually answer `origin`; the acknowledgement
/// toward the shard is handled by the runner before this trait is invoked.
#[async_trait]
pub trait CallWorker: Send + 'static {
    /// Executes one synchronous work item and replies to its origin.
    async fn sync_work(&mut self, work: Work, origin: &WorkOrigin) -> WorkerFlow;

    /// Executes one fire-and-forget work item.
    async fn async_work(&mut self, work: Work) -> WorkerFlow;

    /// Orderly shutdown request; runs before the worker terminates.
    async fn stop(&mut self);

    /// Snapshot of the call state for observability.
    fn data(&self) -> CallData;
}

/// Builds the worker behavior for a freshly admitted call.
pub trait WorkerFactory: Send + Sync + 'static {
    fn build(
        &self,
        key: &CallKey,
        opts: Arc<AppOpts>,
        global: Arc<RouterGlobal>,
    ) -> Box<dyn CallWorker>;
}

/// Messages delivered into a worker's mailbox.
#[derive(Debug)]
pub(crate) enum WorkerMsg {
    SyncWork {
        monitor_ref: MonitorRef,
        work: Work,
        origin: WorkOrigin,
    },
    AsyncWork {
        work: Work,
    },
    GetData {
        reply: oneshot::Sender<CallData>,
    },
    Stop,
}

/// Handle to a live worker: its identity plus the sending half of its mailbox.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerMsg>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Non-blocking delivery into the worker mailbox.
    ///
    /// Returns `false` when the worker already dropped its mailbox; the exit
    /// notice for that worker is then either queued or about to be sent.
    pub(crate) fn deliver(&self, msg: WorkerMsg) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Asks the worker for its observability snapshot.
    pub(crate) fn request_data(&self) -> Option<oneshot::Receiver<CallData>> {
        let (reply, rx) = oneshot::channel();
        if self.deliver(WorkerMsg::GetData { reply }) {
            Some(rx)
        } else {
            None
        }
    }
}

/// Spawns the runner task for a new worker and returns its handle.
pub(crate) fn spawn(worker: Box<dyn CallWorker>, key: CallKey, shard: ShardSender) -> WorkerHandle {
    let id = WorkerId::next();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(worker, id, key, rx, shard));
    WorkerHandle { id, tx }
}

/// Drives a worker until its mailbox closes, it finishes its call, or it is
/// stopped. Exactly one exit notice reaches the shard, panics included.
async fn run(
    mut worker: Box<dyn CallWorker>,
    id: WorkerId,
    key: CallKey,
    mut rx: mpsc::UnboundedReceiver<WorkerMsg>,
    shard: ShardSender,
) {
    let guard = ExitGuard {
        id,
        shard: Some(shard.clone()),
    };
    let mut reason = ExitReason::Finished;

    while let Some(msg) = rx.recv().await {
        match msg {
            WorkerMsg::SyncWork {
                monitor_ref,
                work,
                origin,
            } => {
                // Acknowledge before executing: once acked, this work is the
                // worker's responsibility and is never replayed.
                shard.send(ShardCommand::SyncWorkOk { monitor_ref });
                if worker.sync_work(work, &origin).await == WorkerFlow::Finish {
                    break;
                }
            }
            WorkerMsg::AsyncWork { work } => {
                if worker.async_work(work).await == WorkerFlow::Finish {
                    break;
                }
            }
            WorkerMsg::GetData { reply } => {
                let _ = reply.send(worker.data());
            }
            WorkerMsg::Stop => {
                worker.stop().await;
                reason = ExitReason::Stopped;
                break;
            }
        }
    }

    debug!(worker = %id, app = %key.app, call_id = %key.call_id, ?reason, "call worker exiting");
    guard.finish(reason);
}

/// Drop-armed exit notification. The normal path disarms it via `finish`; an
/// unwind reports a crash instead.
struct ExitGuard {
    id: WorkerId,
    shard: Option<ShardSender>,
}

impl ExitGuard {
    fn finish(mut self, reason: ExitReason) {
        if let Some(shard) = self.shard.take() {
            shard.send(ShardCommand::WorkerExit {
                worker: self.id,
                reason,
            });
        }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(shard) = self.shard.take() {
            shard.send(ShardCommand::WorkerExit {
                worker: self.id,
                reason: ExitReason::Crashed,
            });
        }
    }
}

/// Detached handle for table tests; delivery always fails.
#[cfg(test)]
pub(crate) fn detached_handle() -> WorkerHandle {
    let (tx, _) = mpsc::unbounded_channel();
    WorkerHandle {
        id: WorkerId::next(),
        tx,
    }
}
