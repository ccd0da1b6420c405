// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! One router shard: owns the registry, the pending-work table, and the
//! app-options cache for every call whose Call-ID hashes to it.
//!
//! All shard state lives inside a single task draining a command mailbox, so
//! every mutation is serialized without locks. Workers talk back through the
//! same mailbox: acknowledgements for synchronous work and exactly one exit
//! notice per worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::apps::{AppDirectory, AppOpts};
use crate::config::RouterGlobal;
use crate::counters::CallCounters;
use crate::metrics::RouterMetrics;
use crate::registry::Registry;
use crate::worker::{self, ExitReason, WorkerFactory, WorkerHandle, WorkerId, WorkerMsg};
use crate::{CallKey, MsgClass, RawSipMsg, RouterError, Work, WorkOrigin, WorkReply};

/// Reference identifying one in-flight synchronous handoff.
///
/// Allocated per dispatched work, never reused within a shard; the pending
/// table is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MonitorRef(u64);

/// Commands accepted by a shard's mailbox.
#[derive(Debug)]
pub(crate) enum ShardCommand {
    SyncWork {
        key: CallKey,
        work: Work,
        origin: WorkOrigin,
    },
    AsyncWork {
        key: CallKey,
        work: Work,
    },
    Incoming {
        msg: RawSipMsg,
        origin: WorkOrigin,
    },
    SyncWorkOk {
        monitor_ref: MonitorRef,
    },
    WorkerExit {
        worker: WorkerId,
        reason: ExitReason,
    },
    PendingWork {
        reply: oneshot::Sender<usize>,
    },
    Calls {
        reply: oneshot::Sender<Vec<CallKey>>,
    },
    Entries {
        reply: oneshot::Sender<Vec<(CallKey, WorkerHandle)>>,
    },
    ClearCalls {
        reply: oneshot::Sender<usize>,
    },
}

/// Sending half of a shard mailbox, shared by producers and workers.
///
/// Tracks queued-but-undrained depth for the `pending_msgs` gauge.
#[derive(Debug, Clone)]
pub(crate) struct ShardSender {
    tx: mpsc::UnboundedSender<ShardCommand>,
    depth: Arc<AtomicUsize>,
}

impl ShardSender {
    /// Non-blocking enqueue; `false` once the shard task is gone.
    pub(crate) fn send(&self, cmd: ShardCommand) -> bool {
        if self.tx.send(cmd).is_ok() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Commands enqueued and not yet drained by the shard task.
    pub(crate) fn queued(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn drained(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Record of a synchronous work handed to a worker and not yet acknowledged.
#[derive(Debug)]
struct PendingEntry {
    key: CallKey,
    worker: WorkerId,
    origin: WorkOrigin,
    work: Work,
}

struct Shard {
    pos: usize,
    registry: Registry,
    pending: HashMap<MonitorRef, PendingEntry>,
    app_opts: HashMap<SmolStr, Arc<AppOpts>>,
    global: Arc<RouterGlobal>,
    counters: Arc<CallCounters>,
    apps: Arc<dyn AppDirectory>,
    factory: Arc<dyn WorkerFactory>,
    metrics: RouterMetrics,
    tx: ShardSender,
    next_ref: u64,
}

/// Starts the shard task and returns its mailbox address.
pub(crate) fn spawn(
    pos: usize,
    global: Arc<RouterGlobal>,
    counters: Arc<CallCounters>,
    apps: Arc<dyn AppDirectory>,
    factory: Arc<dyn WorkerFactory>,
    metrics: RouterMetrics,
) -> ShardSender {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = ShardSender {
        tx,
        depth: Arc::new(AtomicUsize::new(0)),
    };
    let shard = Shard {
        pos,
        registry: Registry::new(),
        pending: HashMap::new(),
        app_opts: HashMap::new(),
        global,
        counters,
        apps,
        factory,
        metrics,
        tx: sender.clone(),
        next_ref: 0,
    };
    tokio::spawn(shard.run(rx));
    sender
}

impl Shard {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ShardCommand>) {
        let name = format!("router_{}", self.pos);
        debug!(shard = self.pos, %name, "router shard started");
        while let Some(cmd) = rx.recv().await {
            self.tx.drained();
            self.handle(cmd).await;
        }
        debug!(shard = self.pos, "router shard stopped");
    }

    async fn handle(&mut self, cmd: ShardCommand) {
        match cmd {
            ShardCommand::SyncWork { key, work, origin } => {
                self.dispatch_sync(key, work, origin).await;
            }
            ShardCommand::AsyncWork { key, work } => self.dispatch_async(&key, work),
            ShardCommand::Incoming { msg, origin } => self.handle_incoming(msg, origin).await,
            ShardCommand::SyncWorkOk { monitor_ref } => self.handle_ack(monitor_ref),
            ShardCommand::WorkerExit { worker, reason } => {
                self.handle_worker_exit(worker, reason).await;
            }
            ShardCommand::PendingWork { reply } => {
                let _ = reply.send(self.pending.len());
            }
            ShardCommand::Calls { reply } => {
                let _ = reply.send(self.registry.keys().cloned().collect());
            }
            ShardCommand::Entries { reply } => {
                let entries = self
                    .registry
                    .entries()
                    .map(|(key, handle)| (key.clone(), handle.clone()))
                    .collect();
                let _ = reply.send(entries);
            }
            ShardCommand::ClearCalls { reply } => {
                let _ = reply.send(self.clear_calls());
            }
        }
    }

    /// Hands a synchronous work to the responsible worker, creating one on
    /// first reference, and records the handoff until it is acknowledged.
    async fn dispatch_sync(&mut self, key: CallKey, work: Work, origin: WorkOrigin) {
        let handle = match self.lookup_or_create(&key).await {
            Ok(handle) => handle,
            Err(err) => {
                match err {
                    RouterError::TooManyCalls => self.metrics.record_rejected_too_many_calls(),
                    RouterError::UnknownApp => self.metrics.record_rejected_unknown_app(),
                    _ => {}
                }
                debug!(
                    shard = self.pos,
                    app = %key.app,
                    call_id = %key.call_id,
                    %err,
                    "sync work refused"
                );
                origin.reply(Err(err));
                return;
            }
        };

        let monitor_ref = self.next_monitor_ref();
        self.pending.insert(
            monitor_ref,
            PendingEntry {
                key: key.clone(),
                worker: handle.id(),
                origin: origin.clone(),
                work: work.clone(),
            },
        );
        self.metrics.record_sync_dispatch();
        if !handle.deliver(WorkerMsg::SyncWork {
            monitor_ref,
            work,
            origin,
        }) {
            // Mailbox already closed: the worker's exit notice is queued
            // behind this command and will resurrect the pending entry.
            debug!(
                shard = self.pos,
                worker = %handle.id(),
                "worker mailbox closed; waiting for its exit notice"
            );
        }
    }

    /// Fire-and-forget delivery; never creates a worker.
    fn dispatch_async(&mut self, key: &CallKey, work: Work) {
        match self.registry.by_key(key) {
            Some(handle) => {
                if handle.deliver(WorkerMsg::AsyncWork { work }) {
                    self.metrics.record_async_dispatch();
                } else {
                    self.metrics.record_async_dropped();
                    debug!(
                        shard = self.pos,
                        app = %key.app,
                        call_id = %key.call_id,
                        "worker mailbox closed; async work dropped"
                    );
                }
            }
            None => {
                self.metrics.record_async_dropped();
                debug!(
                    shard = self.pos,
                    app = %key.app,
                    call_id = %key.call_id,
                    "no live call for async work; dropped"
                );
            }
        }
    }

    async fn handle_incoming(&mut self, msg: RawSipMsg, origin: WorkOrigin) {
        if msg.app.is_empty() || msg.call_id.is_empty() {
            warn!(shard = self.pos, "incoming message without routable identifiers");
            origin.reply(Err(RouterError::InvalidCall));
            return;
        }
        let key = msg.key();
        match msg.class {
            MsgClass::Request => self.dispatch_sync(key, Work::Incoming(msg), origin).await,
            MsgClass::Response => {
                // Responses are only delivered to existing calls: a matching
                // client transaction must already exist, so an unmatched
                // response is dropped rather than creating a worker.
                self.dispatch_async(&key, Work::Incoming(msg));
                origin.reply(Ok(WorkReply::Done));
            }
        }
    }

    fn handle_ack(&mut self, monitor_ref: MonitorRef) {
        if self.pending.remove(&monitor_ref).is_some() {
            self.metrics.record_ack();
        } else {
            // Late ack for a work that was already resolved via the exit
            // path; both orders are fine.
            debug!(shard = self.pos, ?monitor_ref, "ack for unknown work; ignored");
        }
    }

    /// Cleans the registry and replays any synchronous work the dead worker
    /// never acknowledged.
    async fn handle_worker_exit(&mut self, worker: WorkerId, reason: ExitReason) {
        if let Some((key, _)) = self.registry.remove_by_worker(worker) {
            self.counters.decr(&key.app);
            self.metrics.record_worker_exit(reason);
            if reason == ExitReason::Crashed {
                warn!(
                    shard = self.pos,
                    worker = %worker,
                    app = %key.app,
                    call_id = %key.call_id,
                    "call worker crashed"
                );
            } else {
                debug!(
                    shard = self.pos,
                    worker = %worker,
                    app = %key.app,
                    call_id = %key.call_id,
                    ?reason,
                    "call worker terminated"
                );
            }
        }

        let mut stranded: Vec<MonitorRef> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.worker == worker)
            .map(|(monitor_ref, _)| *monitor_ref)
            .collect();
        // References are allocated in dispatch order; replay must keep it.
        stranded.sort_unstable_by_key(|monitor_ref| monitor_ref.0);
        for monitor_ref in stranded {
            if let Some(entry) = self.pending.remove(&monitor_ref) {
                // The worker drained its queue and exited just before this
                // work arrived; hand it to a replacement.
                self.metrics.record_replay();
                debug!(
                    shard = self.pos,
                    app = %entry.key.app,
                    call_id = %entry.key.call_id,
                    "resending unacknowledged work to a replacement worker"
                );
                self.dispatch_sync(entry.key, entry.work, entry.origin).await;
            }
        }
    }

    async fn lookup_or_create(&mut self, key: &CallKey) -> Result<WorkerHandle, RouterError> {
        if let Some(handle) = self.registry.by_key(key) {
            return Ok(handle.clone());
        }
        self.ensure_worker(key).await
    }

    /// Admission plus worker creation: global cap, application existence,
    /// per-application cap, then spawn and register.
    async fn ensure_worker(&mut self, key: &CallKey) -> Result<WorkerHandle, RouterError> {
        if self.counters.live_calls() >= self.global.max_calls {
            return Err(RouterError::TooManyCalls);
        }
        let opts = self.cached_app_opts(&key.app).await?;
        if let Some(max) = opts.max_calls {
            if self.counters.app_calls(&key.app) >= max {
                return Err(RouterError::TooManyCalls);
            }
        }

        let behavior = self.factory.build(key, opts, self.global.clone());
        let handle = worker::spawn(behavior, key.clone(), self.tx.clone());
        self.counters.incr(&key.app);
        self.metrics.record_worker_spawned();
        debug!(
            shard = self.pos,
            worker = %handle.id(),
            app = %key.app,
            call_id = %key.call_id,
            "call worker started"
        );
        self.registry.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    /// Memoized application options.
    ///
    /// The cache is monotonic for the shard's lifetime: entries are added but
    /// never invalidated. Option changes become visible only after the owning
    /// supervisor restarts the router.
    async fn cached_app_opts(&mut self, app: &SmolStr) -> Result<Arc<AppOpts>, RouterError> {
        if let Some(opts) = self.app_opts.get(app) {
            return Ok(opts.clone());
        }
        match self.apps.get_app_opts(app).await {
            Ok(Some(opts)) => {
                let opts = Arc::new(opts);
                self.app_opts.insert(app.clone(), opts.clone());
                Ok(opts)
            }
            Ok(None) => Err(RouterError::UnknownApp),
            Err(err) => {
                error!(shard = self.pos, app = %app, %err, "application directory lookup failed");
                Err(RouterError::UnknownApp)
            }
        }
    }

    /// Asks every live worker on this shard to stop; returns how many were
    /// reached. Registry entries disappear as exit notices come back.
    fn clear_calls(&mut self) -> usize {
        let mut stopped = 0;
        for (_, handle) in self.registry.entries() {
            if handle.deliver(WorkerMsg::Stop) {
                stopped += 1;
            }
        }
        stopped
    }

    fn next_monitor_ref(&mut self) -> MonitorRef {
        self.next_ref += 1;
        MonitorRef(self.next_ref)
    }
}
