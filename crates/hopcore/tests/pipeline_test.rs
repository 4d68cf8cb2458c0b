// crates/hopcore/tests/pipeline_test.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hopcore::channel::{MessageChannel, MessageHandler, StepMessage};
use hopcore::harness::{Harness, LoopbackChannel, MemoryContextStore, MemoryGlobalStore};
use hopcore::{
    Backends, BuildError, ContextStack, Engine, EngineConfig, Flow, FlowError, FlowEvent,
    FrameStatus,
};

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn hello_flow() -> Flow<String> {
    Flow::value(&"x".to_string())
        .expect("build value")
        .named("seed")
        .expect("name seed")
        .map(|_cx, s: String| Ok(format!("{s}!")))
        .named("shout")
        .expect("name shout")
}

#[tokio::test]
async fn test_value_map_pipeline_runs_to_completion() {
    init_tracing();
    let h = Harness::new();
    let info = hello_flow()
        .init(&h.engine, "hello")
        .await
        .expect("init pipeline");
    assert_eq!(info.head, "seed->shout->end");
    assert_eq!(info.tail, "shout->end");

    info.launch(&h.engine, "t-hello", None).await.expect("launch");

    // Direct dispatch ran the whole chain inline. The finished trace is
    // retired but still readable.
    let cx = h
        .engine
        .trace_state("t-hello")
        .await
        .expect("load")
        .expect("state exists");
    assert!(cx.finished, "trace should be finished");
    assert_eq!(cx.stack.len(), 2);
    let top = cx.top().expect("top frame");
    assert_eq!(top.name, "shout->end");
    assert_eq!(top.status, FrameStatus::End);
    assert_eq!(top.result.as_deref(), Some("\"x!\""));
    assert_eq!(top.ip.as_deref(), Some("127.0.0.1"), "executing host is journaled");
    assert!(top.cost_ms.is_some(), "frame wall time is journaled");
    assert!(
        h.context_store.expired_state("t-hello").is_some(),
        "finished trace should be retired"
    );

    assert_eq!(h.engine.step_backlog(&info.head).await.expect("backlog"), 0);
    assert_eq!(h.engine.step_backlog(&info.tail).await.expect("backlog"), 0);
}

#[tokio::test]
async fn test_same_flow_registers_the_same_ids_everywhere() {
    init_tracing();
    let first = Harness::new();
    let second = Harness::new();

    let a = hello_flow()
        .init(&first.engine, "hello")
        .await
        .expect("init on first engine");
    let b = hello_flow()
        .init(&second.engine, "hello")
        .await
        .expect("init on second engine");

    assert_eq!(a.head, b.head, "head ids must match across processes");
    assert_eq!(a.tail, b.tail, "tail ids must match across processes");
}

#[tokio::test]
async fn test_initing_the_same_handle_twice_is_rejected() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::value(&1i32).expect("build").named("one").expect("name");
    flow.init(&h.engine, "ints").await.expect("first init");
    let err = flow
        .init(&h.engine, "ints")
        .await
        .expect_err("second init of the same handle must fail");
    assert!(
        matches!(err, FlowError::Build(BuildError::AlreadyInited(_))),
        "got {err}"
    );
}

#[tokio::test]
async fn test_duplicate_external_completion_is_dropped() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::<String>::from_call("approval")
        .named("ask")
        .expect("name")
        .map(|_cx, s: String| Ok(format!("approved:{s}")))
        .named("stamp")
        .expect("name");
    let info = flow.init(&h.engine, "approvals").await.expect("init");
    info.launch(&h.engine, "t-appr", None).await.expect("launch");

    let ask_step = info.entry("approval").expect("approval entry").node_id().to_string();
    let waiting = h
        .engine
        .trace_state("t-appr")
        .await
        .expect("load")
        .expect("state");
    assert!(!waiting.finished);
    assert_eq!(
        waiting.top().map(|f| f.status.clone()),
        Some(FrameStatus::Begin),
        "trace should be suspended at the call"
    );
    assert_eq!(
        h.engine.step_backlog(&ask_step).await.expect("backlog"),
        1,
        "a suspended call counts as in flight"
    );

    h.engine
        .entry_call("approval", "t-appr", Some("\"yes\"".to_string()))
        .await
        .expect("first completion");
    let done = h
        .engine
        .trace_state("t-appr")
        .await
        .expect("load")
        .expect("state");
    assert!(done.finished);
    assert_eq!(
        done.top().and_then(|f| f.result.clone()).as_deref(),
        Some("\"approved:yes\"")
    );
    assert_eq!(h.engine.step_backlog(&ask_step).await.expect("backlog"), 0);
    let frames = done.stack.len();

    // Redelivery of the same answer must not move the trace.
    h.engine
        .entry_call("approval", "t-appr", Some("\"yes\"".to_string()))
        .await
        .expect("duplicate is swallowed");
    let after = h
        .engine
        .trace_state("t-appr")
        .await
        .expect("load")
        .expect("state");
    assert_eq!(after.stack.len(), frames, "duplicate delivery must not add frames");
    assert_eq!(
        after.top().and_then(|f| f.result.clone()),
        done.top().and_then(|f| f.result.clone())
    );
}

#[tokio::test]
async fn test_external_call_opens_a_fresh_trace_before_answering_it() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::<String>::from_call("ping")
        .named("ping")
        .expect("name")
        .map(|_cx, s: String| Ok(format!("pong:{s}")))
        .named("pong")
        .expect("name");
    let info = flow.init(&h.engine, "pingpong").await.expect("init");

    // No launch first: the call itself is the trace's first contact.
    h.engine
        .entry_call("ping", "t-cold", Some("\"1\"".to_string()))
        .await
        .expect("cold call");

    let cx = h
        .engine
        .trace_state("t-cold")
        .await
        .expect("load")
        .expect("state");
    assert!(cx.finished);
    assert_eq!(cx.stack[0].name, info.head, "the call opened the trace at the head");
    assert_eq!(
        cx.top().and_then(|f| f.result.clone()).as_deref(),
        Some("\"pong:1\"")
    );
}

#[tokio::test]
async fn test_then_routes_through_a_sub_flow_and_rejoins() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::value(&4i64)
        .expect("build")
        .named("start")
        .expect("name")
        .then(|_cx, n: i64| {
            let sub = if n % 2 == 0 {
                Flow::value(&"even".to_string())
                    .expect("build even")
                    .named("even")
                    .expect("name even")
            } else {
                Flow::value(&"odd".to_string())
                    .expect("build odd")
                    .named("odd")
                    .expect("name odd")
            };
            Ok(sub)
        })
        .named("route")
        .expect("name")
        .map(|_cx, s: String| Ok(format!("{s}-checked")))
        .named("stamp")
        .expect("name");
    let info = flow.init(&h.engine, "parity").await.expect("init");
    info.launch(&h.engine, "t-parity", None).await.expect("launch");

    let cx = h
        .engine
        .trace_state("t-parity")
        .await
        .expect("load")
        .expect("state");
    assert!(cx.finished);
    assert_eq!(
        cx.top().and_then(|f| f.result.clone()).as_deref(),
        Some("\"even-checked\"")
    );
    // The sub-flow's step ran scoped under the binder and rejoined the
    // outer chain at the binder's successor.
    let names: Vec<&str> = cx.stack.iter().map(|f| f.name.as_str()).collect();
    assert!(
        names.iter().any(|n| n.starts_with("route/even->")),
        "sub-flow frame missing from {names:?}"
    );
    assert_eq!(names.last().copied(), Some("stamp->end"));
}

#[tokio::test]
async fn test_relaunch_of_a_moved_trace_is_dropped() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::value(&"go".to_string())
        .expect("build")
        .named("kick")
        .expect("name")
        .then(|_cx, _s: String| Ok(Flow::<String>::from_call("resume").named("wait")?))
        .named("hand_off")
        .expect("name")
        .map(|_cx, s: String| Ok(format!("back:{s}")))
        .named("stamp")
        .expect("name");
    let info = flow.init(&h.engine, "restartable").await.expect("init");
    info.launch(&h.engine, "t-stale", None).await.expect("launch");

    let parked = h
        .engine
        .trace_state("t-stale")
        .await
        .expect("load")
        .expect("state");
    assert!(!parked.finished);
    let frames = parked.stack.len();

    // The trace has moved past the head; a second launch is stale and
    // must not re-run anything.
    info.launch(&h.engine, "t-stale", None)
        .await
        .expect("stale launch is swallowed");
    let after = h
        .engine
        .trace_state("t-stale")
        .await
        .expect("load")
        .expect("state");
    assert_eq!(after.stack.len(), frames, "stale activation must not add frames");
    assert_eq!(
        after.top().map(|f| f.status.clone()),
        Some(FrameStatus::Begin),
        "the suspended call frame is untouched"
    );

    // The real answer still lands.
    h.engine
        .entry_call("resume", "t-stale", Some("\"answer\"".to_string()))
        .await
        .expect("completion");
    let done = h
        .engine
        .trace_state("t-stale")
        .await
        .expect("load")
        .expect("state");
    assert!(done.finished);
    assert_eq!(
        done.top().and_then(|f| f.result.clone()).as_deref(),
        Some("\"back:answer\"")
    );
}

#[tokio::test]
async fn test_recovery_replaces_a_failed_step_result() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::value(&"premium".to_string())
        .expect("build")
        .named("plan")
        .expect("name")
        .map(|_cx, plan: String| -> Result<String, FlowError> {
            if plan == "premium" {
                Err(FlowError::User {
                    step: "rate".to_string(),
                    message: "no rate card".to_string(),
                })
            } else {
                Ok(format!("rated:{plan}"))
            }
        })
        .named("rate")
        .expect("name")
        .on_error(|_cx, _message| Ok("rated:fallback".to_string()))
        .map(|_cx, s: String| Ok(format!("{s}|stored")))
        .named("store")
        .expect("name");
    let info = flow.init(&h.engine, "rates").await.expect("init");
    info.launch(&h.engine, "t-rate", None).await.expect("launch");

    let cx = h
        .engine
        .trace_state("t-rate")
        .await
        .expect("load")
        .expect("state");
    assert!(cx.finished, "recovery should let the flow finish");
    assert_eq!(
        cx.top().and_then(|f| f.result.clone()).as_deref(),
        Some("\"rated:fallback|stored\"")
    );
    // The failed attempt stays journaled next to the recovery frame.
    assert!(cx.stack.iter().any(|f| f.status == FrameStatus::Error));
    assert!(
        cx.error.as_deref().unwrap_or("").contains("no rate card"),
        "error log should carry the original failure: {:?}",
        cx.error
    );
}

#[tokio::test]
async fn test_unrecovered_failure_halts_the_trace_in_place() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::value(&3i64)
        .expect("build")
        .named("seed")
        .expect("name")
        .map(|_cx, _n: i64| -> Result<i64, FlowError> {
            Err(FlowError::User {
                step: "boom".to_string(),
                message: "bad input".to_string(),
            })
        })
        .named("boom")
        .expect("name")
        .map(|_cx, n: i64| Ok(n + 1))
        .named("after")
        .expect("name");
    let info = flow.init(&h.engine, "fragile").await.expect("init");
    info.launch(&h.engine, "t-frag", None).await.expect("launch");

    let cx = h
        .engine
        .trace_state("t-frag")
        .await
        .expect("load")
        .expect("state");
    assert!(!cx.finished, "a halted trace is not finished");
    assert_eq!(cx.top().map(|f| f.status.clone()), Some(FrameStatus::Error));
    assert!(cx.local, "halted traces pin to the failing host");
    assert!(cx.error.as_deref().unwrap_or("").contains("bad input"));
    assert!(
        !cx.stack.iter().any(|f| f.name.starts_with("after->")),
        "the successor must not run after a halt"
    );
    assert!(
        h.context_store.expired_state("t-frag").is_none(),
        "halted traces stay live for inspection and replay"
    );
}

#[tokio::test]
async fn test_terminated_signal_finishes_the_trace_early() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::value(&"x".to_string())
        .expect("build")
        .named("seed")
        .expect("name")
        .map(|_cx, _s: String| -> Result<String, FlowError> { Err(FlowError::Terminated) })
        .named("gate")
        .expect("name")
        .map(|_cx, s: String| Ok(format!("{s}?")))
        .named("never")
        .expect("name");
    let info = flow.init(&h.engine, "gated").await.expect("init");
    info.launch(&h.engine, "t-gate", None).await.expect("launch");

    let cx = h
        .engine
        .trace_state("t-gate")
        .await
        .expect("load")
        .expect("state");
    assert!(cx.finished, "termination finishes the trace cleanly");
    assert!(cx.error.is_none(), "termination is not a failure");
    assert!(
        !cx.stack.iter().any(|f| f.name.starts_with("never->")),
        "steps after the termination must not run"
    );
    assert!(h.context_store.expired_state("t-gate").is_some());
}

#[tokio::test]
async fn test_mocked_traces_short_circuit_mocked_steps() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::<String>::from_call("vendor-quote")
        .named("quote")
        .expect("name")
        .mock_value(&"9.99".to_string())
        .expect("mock")
        .map(|_cx, q: String| Ok(format!("quoted:{q}")))
        .named("stamp")
        .expect("name");
    let info = flow.init(&h.engine, "vendor").await.expect("init");

    // A plain trace suspends at the call like production would.
    info.launch(&h.engine, "t-real", None).await.expect("launch real");
    let real = h
        .engine
        .trace_state("t-real")
        .await
        .expect("load")
        .expect("state");
    assert!(!real.finished, "unmocked trace should wait for the vendor");

    // A mocked trace runs straight through on the step's mock.
    let mut seeded = ContextStack::new("t-mocked");
    seeded.mock = true;
    h.engine.seed_trace(&seeded).await.expect("seed");
    info.launch(&h.engine, "t-mocked", None).await.expect("launch mocked");
    let mocked = h
        .engine
        .trace_state("t-mocked")
        .await
        .expect("load")
        .expect("state");
    assert!(mocked.finished, "mocked trace should not wait for the vendor");
    assert_eq!(
        mocked.top().and_then(|f| f.result.clone()).as_deref(),
        Some("\"quoted:9.99\"")
    );
}

#[tokio::test]
async fn test_ephemeral_replay_leaves_the_persisted_trace_alone() {
    init_tracing();
    let h = Harness::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let flow = Flow::value(&"x".to_string())
        .expect("build")
        .named("seed")
        .expect("name")
        .map(move |_cx, s: String| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{s}!"))
        })
        .named("shout")
        .expect("name");
    let info = flow.init(&h.engine, "hello").await.expect("init");
    info.launch(&h.engine, "t-replay", None).await.expect("launch");
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let before = h
        .engine
        .trace_state("t-replay")
        .await
        .expect("load")
        .expect("state");
    assert!(before.finished);

    let replayed = h
        .engine
        .replay_step_ephemeral("t-replay", &info.tail)
        .await
        .expect("replay");
    assert_eq!(replayed.as_deref(), Some("\"x!\""));
    assert_eq!(runs.load(Ordering::SeqCst), 2, "the step body ran again");

    let after = h
        .engine
        .trace_state("t-replay")
        .await
        .expect("load")
        .expect("state");
    assert!(after.finished, "the persisted trace must not move");
    assert_eq!(after.stack.len(), before.stack.len());
    assert_eq!(h.engine.step_backlog(&info.tail).await.expect("backlog"), 0);
}

#[tokio::test]
async fn test_replay_rewinds_and_reruns_for_real() {
    init_tracing();
    let h = Harness::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let flow = Flow::value(&"x".to_string())
        .expect("build")
        .named("seed")
        .expect("name")
        .map(move |_cx, s: String| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{s}!"))
        })
        .named("shout")
        .expect("name");
    let info = flow.init(&h.engine, "hello").await.expect("init");
    info.launch(&h.engine, "t-redo", None).await.expect("launch");

    h.engine
        .replay_step("t-redo", &info.tail)
        .await
        .expect("replay");

    let cx = h
        .engine
        .trace_state("t-redo")
        .await
        .expect("load")
        .expect("state");
    assert!(cx.finished, "the replayed step advances the trace again");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(cx.stack.len(), 2, "the rewound frame was replaced, not stacked");
    assert_eq!(
        cx.top().and_then(|f| f.result.clone()).as_deref(),
        Some("\"x!\"")
    );
}

#[tokio::test]
async fn test_delayed_value_resumes_after_its_delay() {
    init_tracing();
    let h = Harness::new();
    let flow = Flow::delayed_value(&"late".to_string(), std::time::Duration::from_millis(50))
        .expect("build")
        .named("later")
        .expect("name")
        .map(|_cx, s: String| Ok(format!("{s}r")))
        .named("stamp")
        .expect("name");
    let info = flow.init(&h.engine, "delays").await.expect("init");
    info.launch(&h.engine, "t-late", None).await.expect("launch");

    let parked = h
        .engine
        .trace_state("t-late")
        .await
        .expect("load")
        .expect("state");
    assert!(!parked.finished, "the trace waits out the delay in the store");

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let done = h
        .engine
        .trace_state("t-late")
        .await
        .expect("load")
        .expect("state");
    assert!(done.finished, "the scheduler should have resumed the trace");
    assert_eq!(
        done.top().and_then(|f| f.result.clone()).as_deref(),
        Some("\"later\"")
    );
}

#[tokio::test]
async fn test_omitted_steps_drop_their_activations() {
    init_tracing();
    let h = Harness::new();
    h.engine.add_omit_pattern("^shout->").expect("pattern");
    let info = hello_flow().init(&h.engine, "hello").await.expect("init");
    info.launch(&h.engine, "t-omit", None).await.expect("launch");

    let cx = h
        .engine
        .trace_state("t-omit")
        .await
        .expect("load")
        .expect("state");
    assert!(!cx.finished, "the trace stalls where its successor is omitted");
    assert_eq!(cx.stack.len(), 1, "only the head ran");
    assert_eq!(cx.next_step.as_deref(), Some(info.tail.as_str()));
}

#[tokio::test]
async fn test_dispatch_emits_lifecycle_events() {
    init_tracing();
    let h = Harness::new();
    let info = hello_flow().init(&h.engine, "hello").await.expect("init");
    let mut events = h.engine.subscribe_events();

    info.launch(&h.engine, "t-events", None).await.expect("launch");

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            FlowEvent::StepStarted { .. } => "started",
            FlowEvent::StepCompleted { .. } => "completed",
            FlowEvent::StepFailed { .. } => "failed",
            FlowEvent::StepRetrying { .. } => "retrying",
            FlowEvent::TraceFinished { .. } => "finished",
            FlowEvent::TraceTransferred { .. } => "transferred",
        });
    }
    assert_eq!(
        kinds,
        vec!["started", "completed", "started", "completed", "finished"]
    );
}

struct FailingChannel;

#[async_trait::async_trait]
impl MessageChannel for FailingChannel {
    async fn send(&self, _message: StepMessage) -> Result<(), FlowError> {
        Err(FlowError::Channel("broker unreachable".to_string()))
    }

    async fn subscribe(&self, _handler: MessageHandler) -> Result<(), FlowError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_lost_handoff_is_recorded_on_the_trace() {
    init_tracing();
    let context_store = Arc::new(MemoryContextStore::new());
    let global_store = Arc::new(MemoryGlobalStore::new());
    let engine = Engine::new(
        EngineConfig::default().with_deliver_async(true),
        Backends {
            context_store: context_store.clone(),
            global_store,
            channel: Arc::new(FailingChannel),
            resender: None,
            delays: None,
        },
    );
    engine.start().await.expect("start");

    let flow = Flow::value(&1i32).expect("build").named("one").expect("name");
    let info = flow.init(&engine, "publishing").await.expect("init");

    let seeded = ContextStack::new("t-pub");
    engine.seed_trace(&seeded).await.expect("seed");
    info.launch(&engine, "t-pub", None)
        .await
        .expect("launch swallows the publish failure");

    let cx = engine
        .trace_state("t-pub")
        .await
        .expect("load")
        .expect("state");
    let log = cx.error.as_deref().unwrap_or("");
    assert!(log.contains("channel|"), "error log should name the channel: {log}");
    assert!(log.contains("publish"), "error log should mention the lost publish: {log}");
    assert!(!cx.finished);
}

#[tokio::test]
async fn test_cluster_readiness_tracks_pipeline_hosts() {
    init_tracing();
    let context_store = Arc::new(MemoryContextStore::new());
    let global_store = Arc::new(MemoryGlobalStore::new());
    let engine_for = |ip: &str| {
        Engine::new(
            EngineConfig::default()
                .with_deliver_async(false)
                .with_test_mode(true)
                .with_host_ip(ip),
            Backends {
                context_store: context_store.clone(),
                global_store: global_store.clone(),
                channel: Arc::new(LoopbackChannel::new()),
                resender: None,
                delays: None,
            },
        )
    };
    let first = engine_for("10.0.0.1");
    let second = engine_for("10.0.0.2");

    assert!(
        !first.cluster_ready().await.expect("readiness"),
        "an engine with no pipelines is not ready"
    );

    hello_flow()
        .init(&first, "hello")
        .await
        .expect("init on first");
    hello_flow()
        .init(&second, "hello")
        .await
        .expect("init on second");
    assert!(
        first.cluster_ready().await.expect("readiness"),
        "every known pipeline is live on the same hosts"
    );

    // A pipeline deployed to only one host makes the cluster uneven.
    Flow::value(&2i32)
        .expect("build")
        .named("two")
        .expect("name")
        .init(&first, "partial")
        .await
        .expect("init partial");
    assert!(
        !first.cluster_ready().await.expect("readiness"),
        "a half-deployed pipeline should block readiness"
    );
}
