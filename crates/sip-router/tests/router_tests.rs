// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use sip_router::{
    AppDirectory, AppOpts, CallData, CallKey, CallRouter, CallWorker, DialogId, DialogSpec,
    InMemoryAppDirectory, InspectQuery, MsgClass, MsgRef, RawSipMsg, RouterConfig, RouterError,
    SendOpts, SipReply, Work, WorkOrigin, WorkReply, WorkerFactory, WorkerFlow,
};
use smol_str::SmolStr;
use tokio::sync::Mutex;
use tokio::time;

/// How a scripted worker treats synchronous work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    /// Record and answer 200.
    Normal,
    /// Record and never answer the origin.
    Mute,
    /// Panic on any work whose tag contains "boom".
    Fragile,
}

type WorkLog = Arc<Mutex<Vec<(usize, String)>>>;

fn work_tag(work: &Work) -> String {
    match work {
        Work::Send { method, .. } => format!("send:{method}"),
        Work::SendDialog { method, .. } => format!("send_dialog:{method}"),
        Work::Cancel { msg_id } => format!("cancel:{msg_id}"),
        Work::SyncReply { msg_id, .. } => format!("sync_reply:{msg_id}"),
        Work::AppReply { callback, .. } => format!("app_reply:{callback}"),
        Work::StopDialog { dialog } => format!("stop_dialog:{}", dialog.call_id),
        Work::Inspect(_) => "inspect".to_owned(),
        Work::Incoming(msg) => format!("incoming:{}", String::from_utf8_lossy(&msg.payload)),
    }
}

/// Scripted call worker that records every work it observes, tagged with the
/// generation of the worker that saw it.
struct ScriptWorker {
    key: CallKey,
    generation: usize,
    log: WorkLog,
    behavior: Behavior,
}

#[async_trait]
impl CallWorker for ScriptWorker {
    async fn sync_work(&mut self, work: Work, origin: &WorkOrigin) -> WorkerFlow {
        let tag = work_tag(&work);
        self.log.lock().await.push((self.generation, tag.clone()));
        if self.behavior == Behavior::Fragile && tag.contains("boom") {
            panic!("scripted worker crash");
        }
        if self.behavior == Behavior::Mute {
            return WorkerFlow::Continue;
        }
        let data = self.data();
        let result = match &work {
            Work::Inspect(InspectQuery::Dialogs) => Ok(WorkReply::Dialogs(data.dialogs)),
            Work::Inspect(InspectQuery::SipMsgs) => Ok(WorkReply::SipMsgs(data.sipmsgs)),
            Work::Inspect(InspectQuery::Transactions) => {
                Ok(WorkReply::Transactions(data.transactions))
            }
            Work::Inspect(InspectQuery::Dialog(dialog)) => {
                if data.dialogs.contains(dialog) {
                    Ok(WorkReply::Done)
                } else {
                    Err(RouterError::UnknownDialog)
                }
            }
            Work::Inspect(InspectQuery::SipMsg(id)) => {
                if data.sipmsgs.contains(id) {
                    Ok(WorkReply::Done)
                } else {
                    Err(RouterError::UnknownSipMsg)
                }
            }
            Work::Inspect(InspectQuery::Transaction(id)) => {
                if data.transactions.contains(id) {
                    Ok(WorkReply::Done)
                } else {
                    Err(RouterError::UnknownTransaction)
                }
            }
            Work::Cancel { msg_id } => {
                if data.sipmsgs.contains(msg_id) {
                    Ok(WorkReply::Done)
                } else {
                    Err(RouterError::UnknownRequest)
                }
            }
            _ => Ok(WorkReply::Response(SipReply::new(200))),
        };
        origin.reply(result);
        WorkerFlow::Continue
    }

    async fn async_work(&mut self, work: Work) -> WorkerFlow {
        let tag = work_tag(&work);
        self.log.lock().await.push((self.generation, tag.clone()));
        if matches!(&work, Work::AppReply { callback, .. } if callback == "finish") {
            return WorkerFlow::Finish;
        }
        WorkerFlow::Continue
    }

    async fn stop(&mut self) {
        self.log.lock().await.push((self.generation, "stop".to_owned()));
    }

    fn data(&self) -> CallData {
        CallData {
            dialogs: vec![DialogId::new(self.key.call_id.clone(), "local", "remote")],
            sipmsgs: vec![SmolStr::new("m1")],
            transactions: vec![SmolStr::new("t1")],
        }
    }
}

struct ScriptFactory {
    log: WorkLog,
    built: Arc<AtomicUsize>,
    behavior: Behavior,
}

impl ScriptFactory {
    fn new(behavior: Behavior) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            built: Arc::new(AtomicUsize::new(0)),
            behavior,
        }
    }
}

impl WorkerFactory for ScriptFactory {
    fn build(
        &self,
        key: &CallKey,
        _opts: Arc<AppOpts>,
        _global: Arc<sip_router::RouterGlobal>,
    ) -> Box<dyn CallWorker> {
        let generation = self.built.fetch_add(1, Ordering::SeqCst) + 1;
        Box::new(ScriptWorker {
            key: key.clone(),
            generation,
            log: self.log.clone(),
            behavior: self.behavior,
        })
    }
}

fn test_config() -> RouterConfig {
    RouterConfig::default()
        .with_shards(4)
        .with_sync_timeout(Duration::from_millis(500))
}

fn build_router(config: RouterConfig, behavior: Behavior) -> (CallRouter, WorkLog, Arc<AtomicUsize>) {
    let apps = Arc::new(InMemoryAppDirectory::new());
    apps.register("app1", AppOpts::default());
    apps.register("app2", AppOpts::default());
    let factory = Arc::new(ScriptFactory::new(behavior));
    let log = factory.log.clone();
    let built = factory.built.clone();
    (CallRouter::new(config, apps, factory), log, built)
}

async fn eventually<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn request(app: &str, call_id: &str, payload: &str) -> RawSipMsg {
    RawSipMsg::new(
        MsgClass::Request,
        app,
        call_id,
        Bytes::copy_from_slice(payload.as_bytes()),
    )
}

fn response(app: &str, call_id: &str, payload: &str) -> RawSipMsg {
    RawSipMsg::new(
        MsgClass::Response,
        app,
        call_id,
        Bytes::copy_from_slice(payload.as_bytes()),
    )
}

#[tokio::test]
async fn fresh_request_reaches_a_new_worker_and_replies() {
    let (router, log, built) = build_router(test_config(), Behavior::Normal);

    let reply = router
        .send_request("app1", "abc", "INVITE", "sip:bob@example.com", SendOpts::default())
        .await
        .expect("dispatch succeeds");
    assert!(matches!(reply, WorkReply::Response(SipReply { code: 200, .. })));

    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert_eq!(router.counters().live_calls(), 1);
    let calls = router.get_all_calls().await;
    assert_eq!(calls, vec![CallKey::new("app1", "abc")]);

    let entries = log.lock().await;
    assert_eq!(entries.as_slice(), &[(1, "send:INVITE".to_owned())]);
    drop(entries);

    let r = router.clone();
    eventually("pending table to drain after ack", move || {
        let r = r.clone();
        async move { r.pending_work().await == 0 }
    })
    .await;
}

#[tokio::test]
async fn second_request_reuses_the_same_worker() {
    let (router, log, built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("first dispatch");
    router
        .send_request("app1", "c1", "OPTIONS", "sip:a@example.com", SendOpts::default())
        .await
        .expect("second dispatch");

    assert_eq!(built.load(Ordering::SeqCst), 1);
    let entries = log.lock().await;
    assert_eq!(
        entries.as_slice(),
        &[(1, "send:INVITE".to_owned()), (1, "send:OPTIONS".to_owned())]
    );
}

#[tokio::test]
async fn send_new_generates_a_call_id_when_missing() {
    let (router, _log, built) = build_router(test_config(), Behavior::Normal);

    router
        .send_new("app1", "OPTIONS", "sip:b@example.com", SendOpts::default())
        .await
        .expect("dispatch");
    router
        .send_new("app1", "OPTIONS", "sip:b@example.com", SendOpts::default())
        .await
        .expect("dispatch");

    // Distinct generated Call-IDs mean distinct workers.
    assert_eq!(built.load(Ordering::SeqCst), 2);
    assert_eq!(router.get_all_calls().await.len(), 2);

    router
        .send_new(
            "app1",
            "OPTIONS",
            "sip:b@example.com",
            SendOpts::with_call_id("pinned"),
        )
        .await
        .expect("dispatch");
    assert!(router
        .get_all_calls()
        .await
        .contains(&CallKey::new("app1", "pinned")));
}

#[tokio::test]
async fn unmatched_responses_are_dropped_without_a_worker() {
    let (router, log, built) = build_router(test_config(), Behavior::Normal);

    let reply = router
        .incoming_sync(response("app1", "nonexistent", "200 OK"))
        .await
        .expect("drop is not an error");
    assert!(matches!(reply, WorkReply::Done));

    assert_eq!(built.load(Ordering::SeqCst), 0);
    assert_eq!(router.counters().live_calls(), 0);
    assert!(router.get_all_calls().await.is_empty());
    assert!(log.lock().await.is_empty());
    assert_eq!(router.metrics().snapshot().async_dropped, 1);
}

#[tokio::test]
async fn responses_reach_an_existing_worker() {
    let (router, log, _built) = build_router(test_config(), Behavior::Normal);

    router
        .incoming_sync(request("app1", "c1", "INVITE"))
        .await
        .expect("request creates the worker");
    router
        .incoming_sync(response("app1", "c1", "180"))
        .await
        .expect("response accepted");

    let log = log.clone();
    eventually("response to reach the worker", move || {
        let log = log.clone();
        async move {
            log.lock()
                .await
                .contains(&(1, "incoming:180".to_owned()))
        }
    })
    .await;
}

#[tokio::test]
async fn incoming_without_identifiers_is_invalid() {
    let (router, _log, built) = build_router(test_config(), Behavior::Normal);

    let err = router
        .incoming_sync(request("", "c1", "INVITE"))
        .await
        .expect_err("unroutable");
    assert_eq!(err, RouterError::InvalidCall);
    assert_eq!(built.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn admission_denies_past_the_global_cap_until_a_call_ends() {
    let (router, _log, _built) = build_router(test_config().with_max_calls(2), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("c1 admitted");
    router
        .send_request("app1", "c2", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("c2 admitted");

    let err = router
        .send_request("app1", "c3", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect_err("cap reached");
    assert_eq!(err, RouterError::TooManyCalls);
    assert_eq!(router.get_all_calls().await.len(), 2);
    assert_eq!(router.metrics().snapshot().rejected_too_many_calls, 1);

    router
        .app_reply("app1", "c1", "finish", "t1", SipReply::new(200))
        .expect("enqueue finish");
    let r = router.clone();
    eventually("c1 to terminate", move || {
        let r = r.clone();
        async move { r.counters().live_calls() == 1 }
    })
    .await;

    router
        .send_request("app1", "c3", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("c3 admitted after c1 ended");
}

#[tokio::test]
async fn per_app_cap_applies_independently_of_the_global_cap() {
    let apps = Arc::new(InMemoryAppDirectory::new());
    apps.register("small", AppOpts::default().with_max_calls(1));
    apps.register("big", AppOpts::default());
    let factory = Arc::new(ScriptFactory::new(Behavior::Normal));
    let router = CallRouter::new(test_config(), apps, factory);

    router
        .send_request("small", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("first call admitted");
    let err = router
        .send_request("small", "c2", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect_err("per-app cap reached");
    assert_eq!(err, RouterError::TooManyCalls);

    router
        .send_request("big", "c3", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("other app unaffected");
}

#[tokio::test]
async fn unknown_apps_are_refused() {
    let (router, _log, built) = build_router(test_config(), Behavior::Normal);

    let err = router
        .send_request("ghost", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect_err("unregistered app");
    assert_eq!(err, RouterError::UnknownApp);
    assert_eq!(built.load(Ordering::SeqCst), 0);
    assert_eq!(router.metrics().snapshot().rejected_unknown_app, 1);
}

#[tokio::test]
async fn work_racing_a_worker_exit_is_replayed_exactly_once() {
    let (router, log, built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("worker created");
    assert_eq!(built.load(Ordering::SeqCst), 1);

    // The finish is queued ahead of the next sync work, so the worker exits
    // just before taking it.
    router
        .app_reply("app1", "c1", "finish", "t1", SipReply::new(200))
        .expect("enqueue finish");
    let reply = router
        .send_request("app1", "c1", "OPTIONS", "sip:a@example.com", SendOpts::default())
        .await
        .expect("work survives the race");
    assert!(matches!(reply, WorkReply::Response(SipReply { code: 200, .. })));

    assert_eq!(built.load(Ordering::SeqCst), 2);
    let entries = log.lock().await;
    let observed: Vec<&(usize, String)> = entries
        .iter()
        .filter(|(_, tag)| tag == "send:OPTIONS")
        .collect();
    assert_eq!(observed.len(), 1, "raced work must reach exactly one worker");
    assert_eq!(observed[0].0, 2, "raced work must land on the successor");
    drop(entries);

    assert_eq!(router.get_all_calls().await.len(), 1);
    assert_eq!(router.counters().live_calls(), 1);
}

#[tokio::test]
async fn async_work_for_a_dead_call_is_dropped_with_a_log_line() {
    let (router, _log, built) = build_router(test_config(), Behavior::Normal);

    router
        .app_reply("app1", "nowhere", "cb", "t7", SipReply::new(180))
        .expect("fire-and-forget never fails on a running router");

    let r = router.clone();
    eventually("drop to be recorded", move || {
        let r = r.clone();
        async move { r.metrics().snapshot().async_dropped == 1 }
    })
    .await;
    assert_eq!(built.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn async_work_preserves_submission_order() {
    let (router, log, _built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("worker created");
    for i in 0..5 {
        router
            .app_reply("app1", "c1", format!("cb{i}"), "t", SipReply::new(180))
            .expect("enqueue");
    }

    let waited = log.clone();
    eventually("all async works to arrive", move || {
        let log = waited.clone();
        async move { log.lock().await.len() == 6 }
    })
    .await;

    let entries = log.lock().await;
    let tags: Vec<&str> = entries.iter().map(|(_, tag)| tag.as_str()).collect();
    assert_eq!(
        tags,
        vec![
            "send:INVITE",
            "app_reply:cb0",
            "app_reply:cb1",
            "app_reply:cb2",
            "app_reply:cb3",
            "app_reply:cb4"
        ]
    );
    assert!(entries.iter().all(|(generation, _)| *generation == 1));
}

#[tokio::test]
async fn sync_deadline_returns_timeout_while_the_worker_lives_on() {
    let config = test_config().with_sync_timeout(Duration::from_millis(100));
    let (router, log, _built) = build_router(config, Behavior::Mute);

    let err = router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect_err("mute worker never answers");
    assert_eq!(err, RouterError::Timeout);

    // The work was delivered and acknowledged; only the answer is missing.
    assert_eq!(router.counters().live_calls(), 1);
    assert!(log.lock().await.contains(&(1, "send:INVITE".to_owned())));
    let r = router.clone();
    eventually("handoff to be acknowledged", move || {
        let r = r.clone();
        async move { r.pending_work().await == 0 }
    })
    .await;
}

#[tokio::test]
async fn app_options_are_resolved_once_per_shard() {
    struct CountingDirectory {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl AppDirectory for CountingDirectory {
        async fn get_app_opts(&self, app: &SmolStr) -> Result<Option<AppOpts>> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok((app == "app1").then(AppOpts::default))
        }
    }

    let apps = Arc::new(CountingDirectory {
        hits: AtomicUsize::new(0),
    });
    let factory = Arc::new(ScriptFactory::new(Behavior::Normal));
    let router = CallRouter::new(test_config().with_shards(1), apps.clone(), factory);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("first call");
    router
        .send_request("app1", "c2", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("second call");

    assert_eq!(apps.hits.load(Ordering::SeqCst), 1, "options are memoized");
}

#[tokio::test]
async fn dialog_enumeration_reaches_the_worker() {
    let (router, _log, _built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("worker created");

    let dialogs = router.dialogs("app1", "c1").await.expect("enumerate");
    assert_eq!(dialogs, vec![DialogId::new("c1", "local", "remote")]);

    assert_eq!(router.get_all_dialogs().await.len(), 1);
    assert_eq!(router.get_all_sipmsgs().await, vec![SmolStr::new("m1")]);
    assert_eq!(router.get_all_transactions().await, vec![SmolStr::new("t1")]);
}

#[tokio::test]
async fn data_snapshots_cover_every_live_call() {
    let (router, _log, _built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("c1");
    router
        .send_request("app2", "c2", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("c2");

    let mut data = router.get_all_data().await;
    data.sort_by(|(a, _), (b, _)| a.call_id.cmp(&b.call_id));
    assert_eq!(data.len(), 2);
    assert_eq!(data[0].0, CallKey::new("app1", "c1"));
    assert_eq!(data[0].1.dialogs, vec![DialogId::new("c1", "local", "remote")]);
}

#[tokio::test]
async fn clear_calls_stops_every_worker() {
    let (router, log, _built) = build_router(test_config(), Behavior::Normal);

    for call_id in ["c1", "c2", "c3"] {
        router
            .send_request("app1", call_id, "INVITE", "sip:a@example.com", SendOpts::default())
            .await
            .expect("admitted");
    }

    assert_eq!(router.clear_calls().await, 3);

    let r = router.clone();
    eventually("all workers to stop", move || {
        let r = r.clone();
        async move { r.counters().live_calls() == 0 && r.get_all_calls().await.is_empty() }
    })
    .await;

    let entries = log.lock().await;
    let stops = entries.iter().filter(|(_, tag)| tag == "stop").count();
    assert_eq!(stops, 3);
    assert_eq!(router.metrics().snapshot().workers_stopped, 3);
}

#[tokio::test]
async fn stop_dialog_is_fire_and_forget() {
    let (router, log, _built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("worker created");
    router
        .stop_dialog("app1", DialogSpec::Id(DialogId::new("c1", "local", "remote")))
        .expect("enqueue");

    let log = log.clone();
    eventually("stop_dialog to reach the worker", move || {
        let log = log.clone();
        async move {
            log.lock()
                .await
                .contains(&(1, "stop_dialog:c1".to_owned()))
        }
    })
    .await;
}

#[tokio::test]
async fn dialog_specs_and_msg_refs_are_validated_up_front() {
    let (router, _log, built) = build_router(test_config(), Behavior::Normal);

    let err = router
        .send_dialog(
            "app1",
            DialogSpec::Handle(SmolStr::new("not-a-handle")),
            "BYE",
            SendOpts::default(),
        )
        .await
        .expect_err("malformed handle");
    assert_eq!(err, RouterError::UnknownDialog);

    let err = router
        .cancel(MsgRef::new("app1", "", "m1"))
        .await
        .expect_err("empty call id");
    assert_eq!(err, RouterError::InvalidCall);

    let err = router
        .sync_reply(MsgRef::new("", "c1", "m1"), SipReply::new(486))
        .await
        .expect_err("empty app");
    assert_eq!(err, RouterError::InvalidCall);

    assert_eq!(built.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn a_crashing_worker_does_not_take_the_router_down() {
    let (router, _log, built) = build_router(test_config(), Behavior::Fragile);

    // The crash happens after the acknowledgement, so the work is not
    // replayed; the caller simply never gets an answer.
    let err = router
        .send_request("app1", "c1", "boom", "sip:a@example.com", SendOpts::default())
        .await
        .expect_err("no answer from a crashed worker");
    assert_eq!(err, RouterError::Timeout);

    let r = router.clone();
    eventually("crash to be cleaned up", move || {
        let r = r.clone();
        async move {
            r.metrics().snapshot().workers_crashed == 1 && r.counters().live_calls() == 0
        }
    })
    .await;
    assert_eq!(router.pending_work().await, 0);

    // A new call for the same id gets a fresh worker.
    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("router still routes");
    assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn inspections_ride_the_sync_path() {
    let (router, _log, _built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("worker created");

    let reply = router
        .apply_sipmsg(MsgRef::new("app1", "c1", "m1"))
        .await
        .expect("message inspection");
    assert!(matches!(reply, WorkReply::Done));

    let reply = router
        .apply_transaction(MsgRef::new("app1", "c1", "t1"))
        .await
        .expect("transaction inspection");
    assert!(matches!(reply, WorkReply::Done));

    let reply = router
        .apply_dialog("app1", DialogSpec::Id(DialogId::new("c1", "local", "remote")))
        .await
        .expect("dialog inspection");
    assert!(matches!(reply, WorkReply::Done));
}

#[tokio::test]
async fn incoming_async_creates_workers_for_requests() {
    let (router, log, built) = build_router(test_config(), Behavior::Normal);

    router
        .incoming_async(request("app1", "c1", "INVITE"))
        .expect("enqueue");

    let log = log.clone();
    eventually("request to reach a fresh worker", move || {
        let log = log.clone();
        async move {
            log.lock()
                .await
                .contains(&(1, "incoming:INVITE".to_owned()))
        }
    })
    .await;
    assert_eq!(built.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sync_reply_and_cancel_round_trip() {
    let (router, log, _built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("worker created");
    router
        .sync_reply(MsgRef::new("app1", "c1", "m1"), SipReply::new(486))
        .await
        .expect("replied");
    let reply = router
        .cancel(MsgRef::new("app1", "c1", "m1"))
        .await
        .expect("cancelled");
    assert!(matches!(reply, WorkReply::Done));

    let entries = log.lock().await;
    let tags: Vec<&str> = entries.iter().map(|(_, tag)| tag.as_str()).collect();
    assert_eq!(tags, vec!["send:INVITE", "sync_reply:m1", "cancel:m1"]);
}

#[tokio::test]
async fn inspections_for_absent_entities_surface_worker_errors() {
    let (router, _log, _built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("worker created");

    let err = router
        .apply_sipmsg(MsgRef::new("app1", "c1", "m404"))
        .await
        .expect_err("absent message");
    assert_eq!(err, RouterError::UnknownSipMsg);

    let err = router
        .apply_transaction(MsgRef::new("app1", "c1", "t404"))
        .await
        .expect_err("absent transaction");
    assert_eq!(err, RouterError::UnknownTransaction);

    let err = router
        .apply_dialog("app1", DialogSpec::Id(DialogId::new("c1", "other", "tags")))
        .await
        .expect_err("absent dialog");
    assert_eq!(err, RouterError::UnknownDialog);

    let err = router
        .cancel(MsgRef::new("app1", "c1", "m404"))
        .await
        .expect_err("absent request");
    assert_eq!(err, RouterError::UnknownRequest);
}

#[tokio::test]
async fn replayed_works_keep_their_submission_order() {
    let (router, log, built) = build_router(test_config(), Behavior::Normal);

    router
        .send_request("app1", "c1", "INVITE", "sip:a@example.com", SendOpts::default())
        .await
        .expect("worker created");

    // The finish is queued first, so the worker exits with both raced
    // requests still undelivered; the successor must see them in order.
    router
        .app_reply("app1", "c1", "finish", "t1", SipReply::new(200))
        .expect("enqueue finish");
    router
        .incoming_async(request("app1", "c1", "r2"))
        .expect("enqueue");
    router
        .incoming_async(request("app1", "c1", "r3"))
        .expect("enqueue");

    let waited = log.clone();
    eventually("both raced works to reach the successor", move || {
        let log = waited.clone();
        async move {
            let entries = log.lock().await;
            entries.contains(&(2, "incoming:r2".to_owned()))
                && entries.contains(&(2, "incoming:r3".to_owned()))
        }
    })
    .await;

    assert_eq!(built.load(Ordering::SeqCst), 2);
    let entries = log.lock().await;
    let replayed: Vec<&str> = entries
        .iter()
        .filter(|(generation, _)| *generation == 2)
        .map(|(_, tag)| tag.as_str())
        .collect();
    assert_eq!(replayed, vec!["incoming:r2", "incoming:r3"]);
}
