// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The shard pool and the public routing API.
//!
//! Producers compute the shard from the Call-ID and talk to it directly; only
//! the fleet-wide queries fold over every shard.

use std::sync::Arc;

use smol_str::SmolStr;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{error, info};

use crate::apps::AppDirectory;
use crate::config::RouterConfig;
use crate::counters::CallCounters;
use crate::metrics::RouterMetrics;
use crate::shard::{self, ShardCommand, ShardSender};
use crate::sharding::shard_for_call_id;
use crate::worker::{CallData, WorkerFactory};
use crate::{
    generate_call_id, CallKey, DialogId, DialogSpec, InspectQuery, MsgRef, RawSipMsg, RouterError,
    SendOpts, SipReply, Work, WorkOrigin, WorkReply, WorkResult,
};

/// Routes SIP work to per-call workers across a fixed pool of shards.
///
/// Cheap to clone; all clones address the same pool. Must be created inside a
/// Tokio runtime, since each shard and worker is a spawned task.
#[derive(Debug, Clone)]
pub struct CallRouter {
    inner: Arc<RouterInner>,
}

#[derive(Debug)]
struct RouterInner {
    shards: Vec<ShardSender>,
    global: Arc<crate::config::RouterGlobal>,
    counters: Arc<CallCounters>,
    metrics: RouterMetrics,
}

impl CallRouter {
    /// Starts the shard pool with the given configuration and collaborators.
    pub fn new(
        config: RouterConfig,
        apps: Arc<dyn AppDirectory>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Self {
        let global = Arc::new(config.global());
        let counters = Arc::new(CallCounters::new());
        let metrics = RouterMetrics::new();
        let shards = (0..config.shards.max(1))
            .map(|pos| {
                shard::spawn(
                    pos,
                    global.clone(),
                    counters.clone(),
                    apps.clone(),
                    factory.clone(),
                    metrics.clone(),
                )
            })
            .collect::<Vec<_>>();
        info!(
            shards = shards.len(),
            max_calls = global.max_calls,
            "call router started"
        );
        Self {
            inner: Arc::new(RouterInner {
                shards,
                global,
                counters,
                metrics,
            }),
        }
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.inner.metrics
    }

    pub fn counters(&self) -> &CallCounters {
        &self.inner.counters
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Sends a request that already carries its Call-ID.
    pub async fn send_request(
        &self,
        app: impl Into<SmolStr>,
        call_id: impl Into<SmolStr>,
        method: impl Into<SmolStr>,
        uri: impl Into<SmolStr>,
        opts: SendOpts,
    ) -> WorkResult {
        let key = CallKey::new(app, call_id);
        self.submit_sync(
            key,
            Work::Send {
                method: method.into(),
                uri: uri.into(),
                opts,
            },
        )
        .await
    }

    /// Sends a request, generating a fresh locally-unique Call-ID unless the
    /// options carry one.
    pub async fn send_new(
        &self,
        app: impl Into<SmolStr>,
        method: impl Into<SmolStr>,
        uri: impl Into<SmolStr>,
        opts: SendOpts,
    ) -> WorkResult {
        let call_id = opts.call_id.clone().unwrap_or_else(generate_call_id);
        self.send_request(app, call_id, method, uri, opts).await
    }

    /// Sends an in-dialog request.
    pub async fn send_dialog(
        &self,
        app: impl Into<SmolStr>,
        spec: DialogSpec,
        method: impl Into<SmolStr>,
        opts: SendOpts,
    ) -> WorkResult {
        let dialog = spec.resolve()?;
        let key = CallKey::new(app, dialog.call_id.clone());
        self.submit_sync(
            key,
            Work::SendDialog {
                dialog,
                method: method.into(),
                opts,
            },
        )
        .await
    }

    /// Cancels a previously sent request.
    pub async fn cancel(&self, req: MsgRef) -> WorkResult {
        let key = req.key()?;
        self.submit_sync(key, Work::Cancel { msg_id: req.id }).await
    }

    /// Answers a received request on behalf of the application.
    pub async fn sync_reply(&self, req: MsgRef, reply: SipReply) -> WorkResult {
        let key = req.key()?;
        self.submit_sync(
            key,
            Work::SyncReply {
                msg_id: req.id,
                reply,
            },
        )
        .await
    }

    /// Delivers a deferred application callback result; fire-and-forget.
    pub fn app_reply(
        &self,
        app: impl Into<SmolStr>,
        call_id: impl Into<SmolStr>,
        callback: impl Into<SmolStr>,
        trans_id: impl Into<SmolStr>,
        reply: SipReply,
    ) -> Result<(), RouterError> {
        self.submit_async(
            CallKey::new(app, call_id),
            Work::AppReply {
                callback: callback.into(),
                trans_id: trans_id.into(),
                reply,
            },
        )
    }

    /// Requests orderly termination of a dialog; fire-and-forget.
    pub fn stop_dialog(
        &self,
        app: impl Into<SmolStr>,
        spec: DialogSpec,
    ) -> Result<(), RouterError> {
        let dialog = spec.resolve()?;
        let key = CallKey::new(app, dialog.call_id.clone());
        self.submit_async(key, Work::StopDialog { dialog })
    }

    /// Runs a dialog inspection inside the owning worker.
    pub async fn apply_dialog(&self, app: impl Into<SmolStr>, spec: DialogSpec) -> WorkResult {
        let dialog = spec.resolve()?;
        let key = CallKey::new(app, dialog.call_id.clone());
        self.submit_sync(key, Work::Inspect(InspectQuery::Dialog(dialog)))
            .await
    }

    /// Runs a message inspection inside the owning worker.
    pub async fn apply_sipmsg(&self, msg: MsgRef) -> WorkResult {
        let key = msg.key()?;
        self.submit_sync(key, Work::Inspect(InspectQuery::SipMsg(msg.id)))
            .await
    }

    /// Runs a transaction inspection inside the owning worker.
    pub async fn apply_transaction(&self, trans: MsgRef) -> WorkResult {
        let key = trans.key()?;
        self.submit_sync(key, Work::Inspect(InspectQuery::Transaction(trans.id)))
            .await
    }

    /// Routes a raw message and waits for the outcome. Requests create the
    /// worker when needed; responses are delivered only to existing workers.
    pub async fn incoming_sync(&self, msg: RawSipMsg) -> WorkResult {
        let shard = self.shard_for(msg.call_id.as_str());
        let (origin, rx) = WorkOrigin::channel();
        if !shard.send(ShardCommand::Incoming { msg, origin }) {
            return Err(RouterError::Shutdown);
        }
        self.await_reply(rx).await
    }

    /// Routes a raw message without waiting for the outcome.
    pub fn incoming_async(&self, msg: RawSipMsg) -> Result<(), RouterError> {
        let shard = self.shard_for(msg.call_id.as_str());
        let origin = WorkOrigin::detached();
        if shard.send(ShardCommand::Incoming { msg, origin }) {
            Ok(())
        } else {
            Err(RouterError::Shutdown)
        }
    }

    /// Dialogs owned by one call.
    pub async fn dialogs(
        &self,
        app: impl Into<SmolStr>,
        call_id: impl Into<SmolStr>,
    ) -> Result<Vec<DialogId>, RouterError> {
        let key = CallKey::new(app, call_id);
        match self
            .submit_sync(key, Work::Inspect(InspectQuery::Dialogs))
            .await?
        {
            WorkReply::Dialogs(dialogs) => Ok(dialogs),
            other => {
                error!(?other, "unexpected reply to dialog enumeration");
                Ok(Vec::new())
            }
        }
    }

    /// Messages owned by one call.
    pub async fn sipmsgs(
        &self,
        app: impl Into<SmolStr>,
        call_id: impl Into<SmolStr>,
    ) -> Result<Vec<SmolStr>, RouterError> {
        let key = CallKey::new(app, call_id);
        match self
            .submit_sync(key, Work::Inspect(InspectQuery::SipMsgs))
            .await?
        {
            WorkReply::SipMsgs(msgs) => Ok(msgs),
            other => {
                error!(?other, "unexpected reply to message enumeration");
                Ok(Vec::new())
            }
        }
    }

    /// Transactions owned by one call.
    pub async fn transactions(
        &self,
        app: impl Into<SmolStr>,
        call_id: impl Into<SmolStr>,
    ) -> Result<Vec<SmolStr>, RouterError> {
        let key = CallKey::new(app, call_id);
        match self
            .submit_sync(key, Work::Inspect(InspectQuery::Transactions))
            .await?
        {
            WorkReply::Transactions(transactions) => Ok(transactions),
            other => {
                error!(?other, "unexpected reply to transaction enumeration");
                Ok(Vec::new())
            }
        }
    }

    /// Every live call across the pool.
    pub async fn get_all_calls(&self) -> Vec<CallKey> {
        let mut calls = Vec::new();
        for shard in &self.inner.shards {
            let (reply, rx) = oneshot::channel();
            if shard.send(ShardCommand::Calls { reply }) {
                if let Ok(mut chunk) = rx.await {
                    calls.append(&mut chunk);
                }
            }
        }
        calls
    }

    /// Every dialog across the pool.
    pub async fn get_all_dialogs(&self) -> Vec<DialogId> {
        let mut dialogs = Vec::new();
        for key in self.get_all_calls().await {
            if let Ok(mut chunk) = self.dialogs(key.app, key.call_id).await {
                dialogs.append(&mut chunk);
            }
        }
        dialogs
    }

    /// Every message across the pool.
    pub async fn get_all_sipmsgs(&self) -> Vec<SmolStr> {
        let mut msgs = Vec::new();
        for key in self.get_all_calls().await {
            if let Ok(mut chunk) = self.sipmsgs(key.app, key.call_id).await {
                msgs.append(&mut chunk);
            }
        }
        msgs
    }

    /// Every transaction across the pool.
    pub async fn get_all_transactions(&self) -> Vec<SmolStr> {
        let mut transactions = Vec::new();
        for key in self.get_all_calls().await {
            if let Ok(mut chunk) = self.transactions(key.app, key.call_id).await {
                transactions.append(&mut chunk);
            }
        }
        transactions
    }

    /// Observability snapshot of every live call.
    pub async fn get_all_data(&self) -> Vec<(CallKey, CallData)> {
        let mut out = Vec::new();
        for shard in &self.inner.shards {
            let (reply, rx) = oneshot::channel();
            if !shard.send(ShardCommand::Entries { reply }) {
                continue;
            }
            let Ok(entries) = rx.await else { continue };
            for (key, handle) in entries {
                if let Some(data_rx) = handle.request_data() {
                    if let Ok(data) = data_rx.await {
                        out.push((key, data));
                    }
                }
            }
        }
        out
    }

    /// Number of synchronous handoffs awaiting worker acknowledgement.
    pub async fn pending_work(&self) -> usize {
        let mut total = 0;
        for shard in &self.inner.shards {
            let (reply, rx) = oneshot::channel();
            if shard.send(ShardCommand::PendingWork { reply }) {
                if let Ok(count) = rx.await {
                    total += count;
                }
            }
        }
        total
    }

    /// Commands queued in shard mailboxes and not yet drained.
    pub fn pending_msgs(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.queued())
            .sum()
    }

    /// Asks every live worker to stop; returns how many were reached.
    pub async fn clear_calls(&self) -> usize {
        let mut total = 0;
        for shard in &self.inner.shards {
            let (reply, rx) = oneshot::channel();
            if shard.send(ShardCommand::ClearCalls { reply }) {
                if let Ok(count) = rx.await {
                    total += count;
                }
            }
        }
        total
    }

    fn shard_for(&self, call_id: &str) -> &ShardSender {
        let pos = shard_for_call_id(call_id, self.inner.shards.len());
        &self.inner.shards[pos]
    }

    async fn submit_sync(&self, key: CallKey, work: Work) -> WorkResult {
        let shard = self.shard_for(key.call_id.as_str());
        let (origin, rx) = WorkOrigin::channel();
        if !shard.send(ShardCommand::SyncWork { key, work, origin }) {
            return Err(RouterError::Shutdown);
        }
        self.await_reply(rx).await
    }

    fn submit_async(&self, key: CallKey, work: Work) -> Result<(), RouterError> {
        let shard = self.shard_for(key.call_id.as_str());
        if shard.send(ShardCommand::AsyncWork { key, work }) {
            Ok(())
        } else {
            Err(RouterError::Shutdown)
        }
    }

    async fn await_reply(&self, rx: oneshot::Receiver<WorkResult>) -> WorkResult {
        match time::timeout(self.inner.global.sync_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Every origin holder vanished without replying: the worker died
            // after acknowledging. The caller sees the same timeout it would
            // observe at the deadline, just sooner.
            Ok(Err(_)) => Err(RouterError::Timeout),
            Err(_) => Err(RouterError::Timeout),
        }
    }
}
