// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sharded routing of SIP work to per-call workers.
//!
//! SIP requires every message carrying the same Call-ID to be handled in one
//! serialized context so transaction and dialog state stay consistent. This
//! crate maps each `(application, Call-ID)` pair onto exactly one worker
//! task, spreads unrelated calls across a fixed pool of router shards, and
//! replays synchronous work that raced with a worker shutting down.
//!
//! # Example
//! ```no_run
//! use sip_router::{AppOpts, CallRouter, InMemoryAppDirectory, RouterConfig, SendOpts};
//! use std::sync::Arc;
//! # use sip_router::WorkerFactory;
//! # async fn example(factory: Arc<dyn WorkerFactory>) {
//! let apps = Arc::new(InMemoryAppDirectory::default());
//! apps.register("app1", AppOpts::default());
//! let router = CallRouter::new(RouterConfig::default(), apps, factory);
//! let reply = router
//!     .send_new("app1", "INVITE", "sip:bob@example.com", SendOpts::default())
//!     .await;
//! # let _ = reply;
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;
use tokio::sync::oneshot;

pub mod apps;
pub mod config;
pub mod counters;
pub mod metrics;
pub mod registry;
pub mod router;
mod shard;
pub mod sharding;
pub mod worker;

pub use apps::{AppDirectory, AppOpts, InMemoryAppDirectory};
pub use config::{RouterConfig, RouterGlobal, SipTimers};
pub use counters::CallCounters;
pub use metrics::{RouterMetrics, RouterMetricsSnapshot};
pub use registry::Registry;
pub use router::CallRouter;
pub use worker::{CallData, CallWorker, ExitReason, WorkerFactory, WorkerFlow, WorkerHandle, WorkerId};

/// Unique key identifying a call (application + Call-ID).
///
/// The Call-ID is globally unique per SIP semantics; the router only ever
/// treats it as a bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub app: SmolStr,
    pub call_id: SmolStr,
}

impl CallKey {
    pub fn new(app: impl Into<SmolStr>, call_id: impl Into<SmolStr>) -> Self {
        Self {
            app: app.into(),
            call_id: call_id.into(),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.app, self.call_id)
    }
}

/// Unique dialog identifier composed of Call-ID and local/remote tags (RFC 3261 §12).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<SmolStr>,
        local_tag: impl Into<SmolStr>,
        remote_tag: impl Into<SmolStr>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Caller-side designation of a dialog: either a full id or its handle string.
#[derive(Debug, Clone)]
pub enum DialogSpec {
    Id(DialogId),
    /// `"<call-id>/<local-tag>/<remote-tag>"`, the `Display` form of [`DialogId`].
    Handle(SmolStr),
}

impl DialogSpec {
    /// Resolves the spec into a concrete dialog id.
    pub fn resolve(self) -> Result<DialogId, RouterError> {
        match self {
            DialogSpec::Id(id) => Ok(id),
            DialogSpec::Handle(handle) => {
                let mut parts = handle.split('/');
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(call_id), Some(local), Some(remote), None)
                        if !call_id.is_empty() && !local.is_empty() && !remote.is_empty() =>
                    {
                        Ok(DialogId::new(call_id, local, remote))
                    }
                    _ => Err(RouterError::UnknownDialog),
                }
            }
        }
    }
}

/// Reference to a message or transaction owned by a specific call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgRef {
    pub app: SmolStr,
    pub call_id: SmolStr,
    pub id: SmolStr,
}

impl MsgRef {
    pub fn new(
        app: impl Into<SmolStr>,
        call_id: impl Into<SmolStr>,
        id: impl Into<SmolStr>,
    ) -> Self {
        Self {
            app: app.into(),
            call_id: call_id.into(),
            id: id.into(),
        }
    }

    fn check(&self) -> Result<(), RouterError> {
        if self.app.is_empty() || self.call_id.is_empty() || self.id.is_empty() {
            return Err(RouterError::InvalidCall);
        }
        Ok(())
    }

    pub(crate) fn key(&self) -> Result<CallKey, RouterError> {
        self.check()?;
        Ok(CallKey::new(self.app.clone(), self.call_id.clone()))
    }
}

/// Class of a raw SIP message as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgClass {
    Request,
    Response,
}

/// A raw SIP message handed in by a transport producer.
///
/// The transport has already extracted the routing identifiers; the payload
/// stays opaque until a worker parses it.
#[derive(Debug, Clone)]
pub struct RawSipMsg {
    pub class: MsgClass,
    pub app: SmolStr,
    pub call_id: SmolStr,
    pub payload: Bytes,
}

impl RawSipMsg {
    pub fn new(
        class: MsgClass,
        app: impl Into<SmolStr>,
        call_id: impl Into<SmolStr>,
        payload: Bytes,
    ) -> Self {
        Self {
            class,
            app: app.into(),
            call_id: call_id.into(),
            payload,
        }
    }

    pub fn key(&self) -> CallKey {
        CallKey::new(self.app.clone(), self.call_id.clone())
    }
}

/// A SIP reply specification (status code plus optional reason phrase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipReply {
    pub code: u16,
    pub reason: Option<SmolStr>,
}

impl SipReply {
    pub fn new(code: u16) -> Self {
        Self { code, reason: None }
    }

    pub fn with_reason(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            code,
            reason: Some(reason.into()),
        }
    }
}

/// Options attached to an outbound request.
#[derive(Debug, Clone, Default)]
pub struct SendOpts {
    /// Call-ID to use; a fresh locally-unique one is generated when absent.
    pub call_id: Option<SmolStr>,
    /// Extra header fields passed through to the worker untouched.
    pub fields: Vec<(SmolStr, SmolStr)>,
}

impl SendOpts {
    pub fn with_call_id(call_id: impl Into<SmolStr>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            fields: Vec::new(),
        }
    }
}

/// A tagged unit of work executed by a call worker.
#[derive(Debug, Clone)]
pub enum Work {
    /// Send a new request within this call.
    Send {
        method: SmolStr,
        uri: SmolStr,
        opts: SendOpts,
    },
    /// Send an in-dialog request.
    SendDialog {
        dialog: DialogId,
        method: SmolStr,
        opts: SendOpts,
    },
    /// Cancel a previously sent request.
    Cancel { msg_id: SmolStr },
    /// Answer a received request on behalf of the application.
    SyncReply { msg_id: SmolStr, reply: SipReply },
    /// Deliver a deferred application callback result.
    AppReply {
        callback: SmolStr,
        trans_id: SmolStr,
        reply: SipReply,
    },
    /// Request orderly termination of a dialog.
    StopDialog { dialog: DialogId },
    /// Read-only inspection of worker-owned state.
    Inspect(InspectQuery),
    /// A raw message received from the network.
    Incoming(RawSipMsg),
}

/// Inspection requests a worker knows how to serve.
///
/// These replace shipping closures into the worker: the set of questions is
/// closed, so the worker stays an opaque actor with an enumerable surface.
#[derive(Debug, Clone)]
pub enum InspectQuery {
    Dialogs,
    SipMsgs,
    Transactions,
    Dialog(DialogId),
    SipMsg(SmolStr),
    Transaction(SmolStr),
}

/// Successful outcome of a unit of work.
#[derive(Debug, Clone)]
pub enum WorkReply {
    /// The work was carried out and needs no payload.
    Done,
    /// A SIP response produced for the caller.
    Response(SipReply),
    Dialogs(Vec<DialogId>),
    SipMsgs(Vec<SmolStr>),
    Transactions(Vec<SmolStr>),
}

/// Outcome delivered to a work's origin.
pub type WorkResult = Result<WorkReply, RouterError>;

/// Reply channel of the party that submitted a synchronous work.
///
/// The handle is cloneable so it can sit in the shard's pending table and in
/// the worker at the same time; the first `reply` wins and later ones are
/// dropped. A detached origin discards every reply.
#[derive(Clone)]
pub struct WorkOrigin {
    tx: Arc<Mutex<Option<oneshot::Sender<WorkResult>>>>,
}

impl WorkOrigin {
    /// Creates an origin together with the receiving half the caller awaits.
    pub fn channel() -> (Self, oneshot::Receiver<WorkResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// An origin with nobody listening; used for fire-and-forget submissions.
    pub fn detached() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Delivers the result to the caller if it is still waiting.
    ///
    /// Returns `false` when the origin already replied, was detached, or the
    /// caller went away.
    pub fn reply(&self, result: WorkResult) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Whether a caller may still receive a reply through this origin.
    pub fn is_live(&self) -> bool {
        self.tx.lock().is_some()
    }
}

impl fmt::Debug for WorkOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkOrigin")
            .field("live", &self.is_live())
            .finish()
    }
}

/// Error kinds surfaced by the router and its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterError {
    /// The application id is not registered.
    UnknownApp,
    /// Admission was denied; the caller may retry later.
    TooManyCalls,
    /// The synchronous deadline elapsed before the worker answered.
    Timeout,
    /// The dialog id could not be resolved.
    UnknownDialog,
    /// The request is not known to the worker.
    UnknownRequest,
    /// The message is not known to the worker.
    UnknownSipMsg,
    /// The transaction is not known to the worker.
    UnknownTransaction,
    /// The input identifiers were malformed.
    InvalidCall,
    /// The router is no longer accepting work.
    Shutdown,
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RouterError::UnknownApp => "unknown application",
            RouterError::TooManyCalls => "too many concurrent calls",
            RouterError::Timeout => "synchronous work timed out",
            RouterError::UnknownDialog => "unknown dialog",
            RouterError::UnknownRequest => "unknown request",
            RouterError::UnknownSipMsg => "unknown SIP message",
            RouterError::UnknownTransaction => "unknown transaction",
            RouterError::InvalidCall => "invalid call identifiers",
            RouterError::Shutdown => "router is shut down",
        };
        f.write_str(text)
    }
}

impl std::error::Error for RouterError {}

/// Generates a locally-unique Call-ID for requests submitted without one.
pub fn generate_call_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let id: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    SmolStr::new(id)
}
