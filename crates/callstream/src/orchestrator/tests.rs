use super::*;
use crate::{
    channel::Delivery,
    generator::{ChunkStream, EchoGenerator},
};
use core::sync::atomic::AtomicUsize;
use futures::stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_stream::wrappers::UnboundedReceiverStream;

type Feed = UnboundedSender<core::result::Result<String, GeneratorError>>;

/// Generator driven by the test through channels. Each invocation consumes
/// the oldest queued feed; with no feed queued it completes immediately.
#[derive(Default)]
struct Scripted {
    feeds: Mutex<VecDeque<UnboundedReceiver<core::result::Result<String, GeneratorError>>>>,
    invocations: AtomicUsize,
}

impl Scripted {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn feed(&self) -> Feed {
        let (tx, rx) = unbounded_channel();
        self.feeds.lock().push_back(rx);
        tx
    }

    /// A feed that yields `chunks` and then completes.
    fn script(&self, chunks: &[&str]) {
        let tx = self.feed();
        for chunk in chunks {
            tx.send(Ok((*chunk).to_owned())).unwrap();
        }
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Generator for Scripted {
    fn stream(&self, _request: GenerationRequest) -> ChunkStream {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match self.feeds.lock().pop_front() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => stream::empty().boxed(),
        }
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        stream_idle_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    }
}

fn orchestrator(generator: &Arc<Scripted>) -> Orchestrator {
    Orchestrator::new(config(), generator.clone()).unwrap()
}

async fn settled(orchestrator: &Orchestrator, call_id: CallId) -> Call {
    timeout(Duration::from_secs(5), async {
        loop {
            let call = orchestrator.get_call(&call_id).unwrap();
            if call.status.is_terminal() {
                return call;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("call did not settle")
}

async fn drain(orchestrator: &Orchestrator, call_id: CallId) -> Vec<Event> {
    orchestrator
        .subscribe_and_drain(&call_id)
        .unwrap()
        .map(|event| event.unwrap())
        .collect()
        .await
}

fn partial(text: &str) -> Event {
    Event::Partial { text: text.into() }
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn streams_and_deduplicates_a_call() {
    let generator = Scripted::new();
    generator.script(&["Hel", "lo"]);
    let orchestrator = orchestrator(&generator);

    let request = SubmitRequest::new("openai_chat", json!({ "messages": [] }))
        .session("s1")
        .dedup_key("r1");
    let first = orchestrator.submit(request.clone()).unwrap();
    assert_eq!(first.status, CallStatus::Pending);
    assert!(!first.deduplicated);

    assert_eq!(
        drain(&orchestrator, first.call_id).await,
        vec![
            partial("Hel"),
            partial("lo"),
            Event::Final {
                text: "Hello".into()
            }
        ]
    );

    let call = settled(&orchestrator, first.call_id).await;
    assert_eq!(call.status, CallStatus::Finished);
    assert_eq!(call.result.as_deref(), Some("Hello"));
    assert!(call.started_at.is_some());
    assert!(call.completed_at.is_some());

    let again = orchestrator.submit(request).unwrap();
    assert_eq!(again.call_id, first.call_id);
    assert_eq!(again.status, CallStatus::Finished);
    assert!(again.deduplicated);
    assert_eq!(generator.invocations(), 1);

    let session = orchestrator.read_session("s1");
    let kinds: Vec<_> = session.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![SessionEventKind::ToolStarted, SessionEventKind::ToolFinished]
    );
    assert_eq!(session[0].payload["tool"], "openai_chat");
    assert_eq!(session[1].payload["output"], "Hello");
    assert!(session.iter().all(|e| e.call_id == first.call_id));
}

#[tokio::test]
async fn independent_subscribers_replay_the_same_sequence() {
    let generator = Scripted::new();
    let feed = generator.feed();
    let orchestrator = orchestrator(&generator);
    let call_id = orchestrator
        .submit(SubmitRequest::new("t", json!({})))
        .unwrap()
        .call_id;

    let mut early = orchestrator.subscribe(&call_id).unwrap();
    feed.send(Ok("a".into())).unwrap();
    assert_eq!(early.next(WAIT).await, Delivery::Event(partial("a")));

    feed.send(Ok("b".into())).unwrap();
    drop(feed);
    let late = drain(&orchestrator, call_id).await;
    let mut rest = vec![partial("a")];
    while let Delivery::Event(event) = early.next(WAIT).await {
        rest.push(event);
    }

    let expected = vec![partial("a"), partial("b"), Event::Final { text: "ab".into() }];
    assert_eq!(late, expected);
    assert_eq!(rest, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_invoke_generator_once() {
    let generator = Scripted::new();
    let orchestrator = orchestrator(&generator);

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .submit(SubmitRequest::new("t", json!({})).dedup_key("shared"))
                    .unwrap()
            })
        })
        .collect();

    let mut submissions = Vec::new();
    for handle in handles {
        submissions.push(handle.await.unwrap());
    }

    let call_id = submissions[0].call_id;
    assert!(submissions.iter().all(|s| s.call_id == call_id));
    assert_eq!(submissions.iter().filter(|s| !s.deduplicated).count(), 1);

    settled(&orchestrator, call_id).await;
    orchestrator.shutdown().await;
    assert_eq!(generator.invocations(), 1);
}

#[tokio::test]
async fn cancelling_a_finished_call_is_a_no_op() {
    let generator = Scripted::new();
    generator.script(&["done"]);
    let orchestrator = orchestrator(&generator);
    let call_id = orchestrator
        .submit(SubmitRequest::new("t", json!({})).session("s1"))
        .unwrap()
        .call_id;
    settled(&orchestrator, call_id).await;

    assert_eq!(orchestrator.cancel(&call_id), Ok(false));
    assert_eq!(
        orchestrator.get_call(&call_id).unwrap().status,
        CallStatus::Finished
    );
    assert_eq!(
        drain(&orchestrator, call_id).await,
        vec![partial("done"), Event::Final { text: "done".into() }]
    );
    assert_eq!(orchestrator.read_session("s1").len(), 2);
}

#[tokio::test]
async fn cancel_mid_stream_stops_the_call() {
    let generator = Scripted::new();
    let feed = generator.feed();
    let orchestrator = orchestrator(&generator);
    let call_id = orchestrator
        .submit(SubmitRequest::new("t", json!({})).session("s1"))
        .unwrap()
        .call_id;

    let mut sub = orchestrator.subscribe(&call_id).unwrap();
    feed.send(Ok("a".into())).unwrap();
    assert_eq!(sub.next(WAIT).await, Delivery::Event(partial("a")));
    assert_eq!(orchestrator.inflight(), 1);

    assert_eq!(orchestrator.cancel(&call_id), Ok(true));
    assert_eq!(
        sub.next(WAIT).await,
        Delivery::Event(Event::Cancelled {
            message: CANCELLED_BY_CLIENT.into()
        })
    );

    // Output produced after the signal is never observed.
    let _ = feed.send(Ok("b".into()));
    assert_eq!(sub.next(Duration::from_millis(20)).await, Delivery::Closed);

    let call = orchestrator.get_call(&call_id).unwrap();
    assert_eq!(call.status, CallStatus::Cancelled);
    assert!(call.result.is_none());
    assert_eq!(orchestrator.cancel(&call_id), Ok(false));
    assert_eq!(orchestrator.inflight(), 0);

    let session = orchestrator.read_session("s1");
    assert_eq!(
        session.last().map(|e| e.kind),
        Some(SessionEventKind::ToolCancelled)
    );
    assert_eq!(
        session.last().unwrap().payload["message"],
        CANCELLED_BY_CLIENT
    );
}

#[tokio::test]
async fn cancel_before_start_skips_the_generator() {
    let generator = Scripted::new();
    let orchestrator = orchestrator(&generator);
    let call_id = orchestrator
        .submit(SubmitRequest::new("t", json!({})).session("s1"))
        .unwrap()
        .call_id;

    // The current-thread runtime has not polled the call task yet.
    assert_eq!(
        orchestrator.get_call(&call_id).unwrap().status,
        CallStatus::Pending
    );
    assert_eq!(orchestrator.cancel(&call_id), Ok(true));
    orchestrator.shutdown().await;

    assert_eq!(generator.invocations(), 0);
    let call = orchestrator.get_call(&call_id).unwrap();
    assert_eq!(call.status, CallStatus::Cancelled);
    assert!(call.started_at.is_none());
    assert_eq!(
        drain(&orchestrator, call_id).await,
        vec![Event::Cancelled {
            message: CANCELLED_BY_CLIENT.into()
        }]
    );
    let kinds: Vec<_> = orchestrator
        .read_session("s1")
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![SessionEventKind::ToolCancelled]);
}

#[tokio::test]
async fn cancel_all_signals_only_live_calls() {
    let generator = Scripted::new();
    generator.script(&["x"]);
    let orchestrator = orchestrator(&generator);
    let finished = orchestrator
        .submit(SubmitRequest::new("t", json!({})))
        .unwrap()
        .call_id;
    settled(&orchestrator, finished).await;

    let mut feeds = Vec::new();
    let mut live = Vec::new();
    for _ in 0..3 {
        let feed = generator.feed();
        let call_id = orchestrator
            .submit(SubmitRequest::new("t", json!({})))
            .unwrap()
            .call_id;
        let mut sub = orchestrator.subscribe(&call_id).unwrap();
        feed.send(Ok("p".into())).unwrap();
        assert_eq!(sub.next(WAIT).await, Delivery::Event(partial("p")));
        feeds.push(feed);
        live.push(call_id);
    }

    let mut cancelled = orchestrator.cancel_all();
    cancelled.sort();
    live.sort();
    assert_eq!(cancelled, live);
    assert!(orchestrator.cancel_all().is_empty());

    for call_id in &live {
        let events = drain(&orchestrator, *call_id).await;
        assert_eq!(
            events.last(),
            Some(&Event::Cancelled {
                message: CANCELLED_BY_SERVER.into()
            })
        );
    }
    assert_eq!(
        orchestrator.get_call(&finished).unwrap().status,
        CallStatus::Finished
    );
}

#[tokio::test]
async fn generator_failure_ends_the_call_with_an_error() {
    let generator = Scripted::new();
    let feed = generator.feed();
    feed.send(Ok("x".into())).unwrap();
    feed.send(Err(GeneratorError::Failed("upstream closed".into())))
        .unwrap();
    let orchestrator = orchestrator(&generator);
    let call_id = orchestrator
        .submit(SubmitRequest::new("t", json!({})).session("s1"))
        .unwrap()
        .call_id;

    assert_eq!(
        drain(&orchestrator, call_id).await,
        vec![
            partial("x"),
            Event::Error {
                message: "upstream closed".into()
            }
        ]
    );
    let call = settled(&orchestrator, call_id).await;
    assert_eq!(call.status, CallStatus::Error);
    assert_eq!(call.error.as_deref(), Some("upstream closed"));
    assert!(call.result.is_none());

    let session = orchestrator.read_session("s1");
    assert_eq!(session[1].kind, SessionEventKind::ToolError);
    assert_eq!(session[1].payload["error"], "upstream closed");
}

#[tokio::test]
async fn unknown_tool_is_reported_as_an_error_event() {
    let orchestrator =
        Orchestrator::new(config(), Arc::new(EchoGenerator::default())).unwrap();
    let call_id = orchestrator
        .submit(SubmitRequest::new("nope", json!({ "text": "hi" })))
        .unwrap()
        .call_id;

    assert_eq!(
        drain(&orchestrator, call_id).await,
        vec![Event::Error {
            message: "Unknown tool: nope".into()
        }]
    );
}

#[tokio::test]
async fn errored_key_is_retried_with_a_fresh_call() {
    let generator = Scripted::new();
    generator
        .feed()
        .send(Err(GeneratorError::Failed("boom".into())))
        .unwrap();
    generator.script(&["ok"]);
    let orchestrator = orchestrator(&generator);
    let request = SubmitRequest::new("t", json!({})).dedup_key("r1");

    let failed = orchestrator.submit(request.clone()).unwrap();
    assert_eq!(
        settled(&orchestrator, failed.call_id).await.status,
        CallStatus::Error
    );

    let retry = orchestrator.submit(request.clone()).unwrap();
    assert_ne!(retry.call_id, failed.call_id);
    assert!(!retry.deduplicated);
    assert_eq!(
        settled(&orchestrator, retry.call_id).await.status,
        CallStatus::Finished
    );

    let again = orchestrator.submit(request).unwrap();
    assert_eq!(again.call_id, retry.call_id);
    assert!(again.deduplicated);
    assert_eq!(generator.invocations(), 2);
}

#[tokio::test]
async fn cancelled_key_keeps_returning_the_cancelled_call() {
    let generator = Scripted::new();
    let orchestrator = orchestrator(&generator);
    let request = SubmitRequest::new("t", json!({})).dedup_key("r1");

    let first = orchestrator.submit(request.clone()).unwrap();
    assert_eq!(orchestrator.cancel(&first.call_id), Ok(true));

    let again = orchestrator.submit(request).unwrap();
    assert_eq!(again.call_id, first.call_id);
    assert_eq!(again.status, CallStatus::Cancelled);
    assert!(again.deduplicated);
}

#[tokio::test]
async fn empty_dedup_key_is_ignored() {
    let generator = Scripted::new();
    let orchestrator = orchestrator(&generator);
    let request = SubmitRequest::new("t", json!({})).dedup_key("");

    let first = orchestrator.submit(request.clone()).unwrap();
    let second = orchestrator.submit(request).unwrap();
    assert_ne!(first.call_id, second.call_id);
    assert!(!second.deduplicated);
}

#[tokio::test]
async fn shutdown_cancels_stragglers_and_refuses_new_calls() {
    let generator = Scripted::new();
    let _feed = generator.feed();
    let orchestrator = orchestrator(&generator);
    let call_id = orchestrator
        .submit(SubmitRequest::new("t", json!({})))
        .unwrap()
        .call_id;

    assert_eq!(orchestrator.shutdown().await, vec![call_id]);
    assert!(orchestrator.is_shutting_down());
    assert_eq!(
        drain(&orchestrator, call_id).await,
        vec![Event::Cancelled {
            message: CANCELLED_BY_SERVER.into()
        }]
    );
    assert_eq!(
        orchestrator.submit(SubmitRequest::new("t", json!({}))),
        Err(Error::ServiceShutdown)
    );
}

#[tokio::test]
async fn admission_limit_rejects_excess_calls() {
    let generator = Scripted::new();
    let _feed = generator.feed();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            max_inflight_calls: 1,
            ..config()
        },
        generator.clone(),
    )
    .unwrap();

    let held = orchestrator
        .submit(SubmitRequest::new("t", json!({})))
        .unwrap()
        .call_id;
    assert!(matches!(
        orchestrator.submit(SubmitRequest::new("t", json!({}))),
        Err(Error::ServiceOverloaded { .. })
    ));

    assert_eq!(orchestrator.cancel(&held), Ok(true));
    assert!(orchestrator.submit(SubmitRequest::new("t", json!({}))).is_ok());
}

#[tokio::test]
async fn rejects_malformed_requests_and_unknown_calls() {
    let generator = Scripted::new();
    let orchestrator = orchestrator(&generator);

    assert!(matches!(
        orchestrator.submit(SubmitRequest::new("  ", json!({}))),
        Err(Error::InvalidRequest { .. })
    ));

    let unknown = CallId::new();
    assert_eq!(
        orchestrator.cancel(&unknown),
        Err(Error::CallNotFound { call_id: unknown })
    );
    assert!(matches!(
        orchestrator.get_call(&unknown),
        Err(Error::CallNotFound { .. })
    ));
    assert!(orchestrator.subscribe_and_drain(&unknown).is_err());
    assert!(orchestrator.read_session("nobody").is_empty());
}

#[test]
fn invalid_config_is_rejected() {
    let result = Orchestrator::new(
        OrchestratorConfig {
            session_capacity: 0,
            ..OrchestratorConfig::default()
        },
        Scripted::new(),
    );
    assert!(matches!(result, Err(Error::InvalidRequest { .. })));
}

/// Generator whose stream panics on first poll.
struct Panicking;

impl Generator for Panicking {
    fn stream(&self, _request: GenerationRequest) -> ChunkStream {
        stream::iter([()])
            .map(|()| -> core::result::Result<String, GeneratorError> { panic!("generator bug") })
            .boxed()
    }
}

#[tokio::test]
async fn panicking_generator_ends_the_call_with_an_error() {
    let orchestrator = Orchestrator::new(config(), Arc::new(Panicking)).unwrap();
    let call_id = orchestrator
        .submit(SubmitRequest::new("t", json!({})).session("s1"))
        .unwrap()
        .call_id;

    assert_eq!(
        drain(&orchestrator, call_id).await,
        vec![Event::Error {
            message: "generator panicked".into()
        }]
    );
    let call = settled(&orchestrator, call_id).await;
    assert_eq!(call.status, CallStatus::Error);
    assert_eq!(orchestrator.inflight(), 0);

    let kinds: Vec<_> = orchestrator
        .read_session("s1")
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![SessionEventKind::ToolStarted, SessionEventKind::ToolError]
    );
}

#[tokio::test]
async fn slow_subscriber_receives_every_chunk() {
    let generator = Scripted::new();
    let feed = generator.feed();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            channel_capacity: 3,
            ..config()
        },
        generator.clone(),
    )
    .unwrap();
    let call_id = orchestrator
        .submit(SubmitRequest::new("t", json!({})))
        .unwrap()
        .call_id;

    let mut slow = orchestrator.subscribe(&call_id).unwrap();
    for chunk in ["a", "b", "c", "d", "e"] {
        feed.send(Ok(chunk.into())).unwrap();
    }
    drop(feed);

    let mut seen = Vec::new();
    loop {
        match slow.next(WAIT).await {
            Delivery::Event(event) => seen.push(event),
            Delivery::Closed => break,
            Delivery::Timeout => panic!("call stalled: {seen:?}"),
        }
    }
    assert_eq!(
        seen,
        vec![
            partial("a"),
            partial("b"),
            partial("c"),
            partial("d"),
            partial("e"),
            Event::Final {
                text: "abcde".into()
            },
        ]
    );
}

#[tokio::test]
async fn cancel_reaches_a_call_waiting_on_a_slow_subscriber() {
    let generator = Scripted::new();
    let feed = generator.feed();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            channel_capacity: 1,
            ..config()
        },
        generator.clone(),
    )
    .unwrap();
    let call_id = orchestrator
        .submit(SubmitRequest::new("t", json!({})))
        .unwrap()
        .call_id;

    let mut stalled = orchestrator.subscribe(&call_id).unwrap();
    feed.send(Ok("a".into())).unwrap();
    feed.send(Ok("b".into())).unwrap();
    // Let the call publish "a" and block on "b".
    sleep(Duration::from_millis(20)).await;

    assert_eq!(orchestrator.cancel(&call_id), Ok(true));
    orchestrator.shutdown().await;

    assert_eq!(stalled.try_next(), Some(Delivery::Event(partial("a"))));
    assert_eq!(
        stalled.try_next(),
        Some(Delivery::Event(Event::Cancelled {
            message: CANCELLED_BY_CLIENT.into()
        }))
    );
    assert_eq!(orchestrator.inflight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_all_races_with_completing_calls() {
    let generator = Scripted::new();
    let orchestrator = orchestrator(&generator);

    let mut feeds = Vec::new();
    let mut calls = Vec::new();
    for _ in 0..64 {
        feeds.push(generator.feed());
        calls.push(
            orchestrator
                .submit(SubmitRequest::new("t", json!({})))
                .unwrap()
                .call_id,
        );
    }
    let (finishing, held): (Vec<_>, Vec<_>) = feeds
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % 2 == 0);

    let completer = tokio::spawn(async move {
        for (_, feed) in finishing {
            let _ = feed.send(Ok("x".into()));
            drop(feed);
            tokio::task::yield_now().await;
        }
    });
    let sweeper = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.cancel_all() })
    };
    completer.await.unwrap();
    let mut swept = sweeper.await.unwrap();

    let mut cancelled = Vec::new();
    for call_id in &calls {
        let call = settled(&orchestrator, *call_id).await;
        let events = drain(&orchestrator, *call_id).await;
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1, "{events:?}");
        assert!(events.last().is_some_and(Event::is_terminal), "{events:?}");
        if call.status == CallStatus::Cancelled {
            cancelled.push(*call_id);
        }
    }

    swept.sort();
    cancelled.sort();
    assert_eq!(swept, cancelled);
    assert_eq!(orchestrator.inflight(), 0);
    drop(held);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_the_final_chunk_has_one_outcome() {
    let generator = Scripted::new();
    let orchestrator = orchestrator(&generator);

    for _ in 0..32 {
        let feed = generator.feed();
        let call_id = orchestrator
            .submit(SubmitRequest::new("t", json!({})))
            .unwrap()
            .call_id;
        let mut sub = orchestrator.subscribe(&call_id).unwrap();
        feed.send(Ok("x".into())).unwrap();
        assert_eq!(sub.next(WAIT).await, Delivery::Event(partial("x")));
        drop(sub);

        let completer = tokio::spawn(async move { drop(feed) });
        let cancelled = orchestrator.cancel(&call_id).unwrap();
        completer.await.unwrap();

        let call = settled(&orchestrator, call_id).await;
        let events = drain(&orchestrator, call_id).await;
        if cancelled {
            assert_eq!(call.status, CallStatus::Cancelled);
            assert!(matches!(events.last(), Some(Event::Cancelled { .. })));
        } else {
            assert_eq!(call.status, CallStatus::Finished);
            assert_eq!(events.last(), Some(&Event::Final { text: "x".into() }));
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }
    assert_eq!(orchestrator.inflight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sweeps_never_report_calls_that_lost_a_dedup_race() {
    let generator = Scripted::new();
    let orchestrator = orchestrator(&generator);

    for round in 0..32 {
        let key = format!("k{round}");
        let submitters: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    orchestrator
                        .submit(SubmitRequest::new("t", json!({})).session("s1").dedup_key(key))
                        .unwrap()
                })
            })
            .collect();
        let sweeper = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                let mut swept = Vec::new();
                for _ in 0..8 {
                    swept.extend(orchestrator.cancel_all());
                    tokio::task::yield_now().await;
                }
                swept
            })
        };

        let mut winners = Vec::new();
        for submitter in submitters {
            winners.push(submitter.await.unwrap().call_id);
        }
        winners.dedup();
        assert_eq!(winners.len(), 1);

        for call_id in sweeper.await.unwrap() {
            assert_eq!(call_id, winners[0]);
            assert!(orchestrator.get_call(&call_id).is_ok());
        }

        // Keep this round's winner out of the next round's sweeps.
        let _ = orchestrator.cancel(&winners[0]);
        settled(&orchestrator, winners[0]).await;
    }

    for entry in orchestrator.read_session("s1") {
        assert!(orchestrator.get_call(&entry.call_id).is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_entries_follow_status_order() {
    let generator = Scripted::new();
    let orchestrator = orchestrator(&generator);

    for round in 0..64 {
        let session = format!("s{round}");
        let call_id = orchestrator
            .submit(SubmitRequest::new("t", json!({})).session(session.clone()))
            .unwrap()
            .call_id;
        let canceller = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.cancel(&call_id) })
        };
        canceller.await.unwrap().unwrap();
        settled(&orchestrator, call_id).await;

        let kinds: Vec<_> = orchestrator
            .read_session(&session)
            .iter()
            .map(|e| e.kind)
            .collect();
        assert!(
            matches!(
                kinds.as_slice(),
                [SessionEventKind::ToolCancelled]
                    | [SessionEventKind::ToolStarted, SessionEventKind::ToolCancelled]
                    | [SessionEventKind::ToolStarted, SessionEventKind::ToolFinished]
            ),
            "{kinds:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_limit_holds_under_concurrent_submits() {
    let generator = Scripted::new();
    let feeds: Vec<_> = (0..32).map(|_| generator.feed()).collect();
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            max_inflight_calls: 4,
            ..config()
        },
        generator.clone(),
    )
    .unwrap();

    let submitters: Vec<_> = (0..32)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.submit(SubmitRequest::new("t", json!({}))) })
        })
        .collect();

    let mut admitted = 0;
    for submitter in submitters {
        match submitter.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(err) => assert!(matches!(err, Error::ServiceOverloaded { .. }), "{err}"),
        }
    }
    assert_eq!(admitted, 4);
    assert_eq!(orchestrator.inflight(), 4);
    drop(feeds);
}
