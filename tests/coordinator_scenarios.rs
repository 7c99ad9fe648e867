use std::sync::Arc;

use bytes::Bytes;
use capturetap::{
    config::{CaptureConfig, Config},
    coordinator::{
        CaptureCoordinator, EventOutcome, LifecycleEvent, PolicyFuture, PolicyStore, StreamEvent,
    },
    entry::{CaptureEntry, CaptureStatus, ContextId, EntryId, Headers, RequestId},
    matching::FilterReason,
    query::{QueryRequest, dispatch},
    stream::BINARY_PLACEHOLDER,
    trace::ReplayInterceptor,
};

fn config_with(f: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config::default();
    f(&mut config);
    config
}

fn coordinator(config: &Config) -> (CaptureCoordinator, Arc<ReplayInterceptor>) {
    let interceptor = Arc::new(ReplayInterceptor::default());
    let coordinator = CaptureCoordinator::with_static_policy(config, interceptor.clone())
        .expect("coordinator should build");
    (coordinator, interceptor)
}

fn observe(coordinator: &CaptureCoordinator, request_id: &str, context: i64) -> EntryId {
    match coordinator.handle_event(LifecycleEvent::RequestObserved {
        request_id: RequestId::from(request_id),
        url: format!("https://api.example.test/{request_id}"),
        method: "GET".to_owned(),
        resource_type: Some("xmlhttprequest".to_owned()),
        context_id: Some(ContextId(context)),
        request_body: None,
    }) {
        EventOutcome::Tracked(entry_id) => entry_id,
        other => panic!("request {request_id} should be tracked, got {other:?}"),
    }
}

fn respond(
    coordinator: &CaptureCoordinator,
    request_id: &str,
    status: u16,
    content_type: Option<&str>,
) -> EventOutcome {
    let headers = match content_type {
        Some(value) => Headers::from_pairs([("Content-Type", value)]),
        None => Headers::new(),
    };
    coordinator.handle_event(LifecycleEvent::ResponseHeaders {
        request_id: RequestId::from(request_id),
        status,
        status_text: String::new(),
        headers,
    })
}

async fn stream(coordinator: &CaptureCoordinator, request_id: &str, chunks: &[&[u8]]) -> EventOutcome {
    let request_id = RequestId::from(request_id);
    coordinator
        .handle_stream_event(StreamEvent::Start {
            request_id: request_id.clone(),
        })
        .await;
    for chunk in chunks {
        coordinator
            .handle_stream_event(StreamEvent::Data {
                request_id: request_id.clone(),
                chunk: Bytes::copy_from_slice(chunk),
            })
            .await;
    }
    coordinator
        .handle_stream_event(StreamEvent::Stop { request_id })
        .await
}

fn assert_entry_invariants(entries: &[CaptureEntry]) {
    for entry in entries {
        match entry.status() {
            CaptureStatus::Completed => {
                assert!(entry.response().is_some() && entry.error().is_none(), "{entry:?}")
            }
            CaptureStatus::Error => {
                assert!(entry.error().is_some() && entry.response().is_none(), "{entry:?}")
            }
            CaptureStatus::Pending => {
                assert!(entry.response().is_none() && entry.error().is_none(), "{entry:?}")
            }
        }
        assert!(entry.updated_at >= entry.created_at, "{entry:?}");
    }
}

#[test]
fn oldest_entries_are_evicted_first() {
    let config = config_with(|config| config.storage.max_entries = 3);
    let (coordinator, _) = coordinator(&config);
    let ids: Vec<EntryId> = ["e1", "e2", "e3", "e4"]
        .into_iter()
        .map(|id| observe(&coordinator, id, 1))
        .collect();

    let entries = coordinator.entries();
    let stored: Vec<&EntryId> = entries.iter().map(|entry| &entry.id).collect();
    assert_eq!(stored, vec![&ids[3], &ids[2], &ids[1]]);
    assert!(coordinator.entry(&ids[0]).is_none());

    let size = coordinator.size_info();
    assert_eq!((size.current, size.max), (3, 3));
    assert!(size.near_capacity);
}

#[test]
fn status_outside_allow_list_completes_header_only() {
    let config = config_with(|config| config.capture.allowed_status_codes = vec![200]);
    let (coordinator, interceptor) = coordinator(&config);
    let entry_id = observe(&coordinator, "r1", 1);

    assert_eq!(
        respond(&coordinator, "r1", 404, Some("application/json")),
        EventOutcome::Filtered(FilterReason::StatusCode { code: 404 })
    );
    assert_eq!(coordinator.active_captures(), 0);
    assert_eq!(
        coordinator.entry(&entry_id).unwrap().status(),
        CaptureStatus::Pending
    );

    coordinator.handle_event(LifecycleEvent::RequestCompleted {
        request_id: RequestId::from("r1"),
    });
    let entry = coordinator.entry(&entry_id).unwrap();
    assert_eq!(entry.status(), CaptureStatus::Completed);
    let response = entry.response().unwrap();
    assert_eq!((response.status, response.body.as_str(), response.body_size), (404, "", 0));
    assert_eq!(interceptor.forwarded_bytes(), 0);
}

#[tokio::test]
async fn binary_content_finalizes_without_waiting_for_chunks() {
    let (coordinator, _) = coordinator(&Config::default());
    let entry_id = observe(&coordinator, "r1", 1);

    assert_eq!(
        respond(&coordinator, "r1", 200, Some("image/png")),
        EventOutcome::Finalized
    );
    let entry = coordinator.entry(&entry_id).unwrap();
    let response = entry.response().expect("completed before any chunk");
    assert_eq!(response.body, BINARY_PLACEHOLDER);
    assert_eq!(response.body_size, 0);

    assert_eq!(stream(&coordinator, "r1", &[b"\x89PNG"]).await, EventOutcome::Ignored);
    assert_eq!(coordinator.entry(&entry_id).unwrap(), entry);
}

#[test]
fn destroyed_context_purges_in_flight_requests_and_keeps_entries() {
    let (coordinator, _) = coordinator(&Config::default());
    let first = observe(&coordinator, "a", 9);
    let second = observe(&coordinator, "b", 9);
    respond(&coordinator, "b", 200, Some("text/plain"));
    observe(&coordinator, "c", 10);

    assert_eq!(
        coordinator.handle_event(LifecycleEvent::ContextDestroyed {
            context_id: ContextId(9),
        }),
        EventOutcome::Purged(3)
    );

    let pending = coordinator.pending_requests();
    assert_eq!(
        pending.keys().map(RequestId::as_str).collect::<Vec<_>>(),
        vec!["c"]
    );
    assert_eq!(coordinator.active_captures(), 0);
    for entry_id in [&first, &second] {
        assert_eq!(
            coordinator.entry(entry_id).unwrap().status(),
            CaptureStatus::Pending
        );
    }
    assert_eq!(
        coordinator.handle_event(LifecycleEvent::RequestCompleted {
            request_id: RequestId::from("a"),
        }),
        EventOutcome::Ignored
    );
}

#[tokio::test]
async fn unknown_request_ids_leave_the_store_untouched() {
    let (coordinator, _) = coordinator(&Config::default());
    observe(&coordinator, "known", 1);
    let before = coordinator.entries();
    let ghost = RequestId::from("ghost");

    let outcomes = vec![
        coordinator.handle_event(LifecycleEvent::RequestHeaders {
            request_id: ghost.clone(),
            headers: Headers::from_pairs([("x-test", "1")]),
        }),
        respond(&coordinator, "ghost", 200, Some("text/plain")),
        coordinator.handle_event(LifecycleEvent::RequestCompleted {
            request_id: ghost.clone(),
        }),
        coordinator.handle_event(LifecycleEvent::RequestFailed {
            request_id: ghost.clone(),
            error: "NS_BINDING_ABORTED".to_owned(),
        }),
        stream(&coordinator, "ghost", &[b"x"]).await,
        coordinator
            .handle_stream_event(StreamEvent::Error {
                request_id: ghost,
                error: "boom".to_owned(),
            })
            .await,
    ];

    assert!(
        outcomes.iter().all(|outcome| *outcome == EventOutcome::Ignored),
        "{outcomes:?}"
    );
    assert_eq!(coordinator.entries(), before);
}

#[tokio::test]
async fn oversized_body_is_truncated_but_fully_forwarded() {
    let config = config_with(|config| config.capture.max_body_size = 16);
    let (coordinator, interceptor) = coordinator(&config);
    let entry_id = observe(&coordinator, "big", 1);
    assert_eq!(
        respond(&coordinator, "big", 200, Some("text/plain")),
        EventOutcome::Intercepted
    );

    let chunks: Vec<&[u8]> = vec![b"0123456789", b"abcdef", b"ghijklmnop", b"qrstuvwxyz"];
    assert_eq!(stream(&coordinator, "big", &chunks).await, EventOutcome::Finalized);

    let entry = coordinator.entry(&entry_id).unwrap();
    let response = entry.response().unwrap();
    assert_eq!(response.body_size, 42);
    assert!(response.body.starts_with("0123456789abcdef"), "{}", response.body);
    assert!(response.body.contains("[... truncated"), "{}", response.body);
    assert_eq!(interceptor.forwarded_bytes(), 42);
}

#[tokio::test]
async fn invalid_utf8_body_gets_placeholder_and_still_completes() {
    let (coordinator, _) = coordinator(&Config::default());
    let entry_id = observe(&coordinator, "r1", 1);
    respond(&coordinator, "r1", 200, Some("text/plain"));
    stream(&coordinator, "r1", &[b"ok \xff\xfe"]).await;

    let entry = coordinator.entry(&entry_id).unwrap();
    assert_eq!(entry.status(), CaptureStatus::Completed);
    assert_eq!(
        entry.response().unwrap().body,
        "[Binary data - unable to decode]"
    );
    assert_eq!(entry.response().unwrap().body_size, 5);
}

struct NeverResolves;

impl PolicyStore for NeverResolves {
    fn load(&self) -> PolicyFuture {
        Box::pin(std::future::pending::<anyhow::Result<CaptureConfig>>())
    }
}

#[tokio::test]
async fn unresolved_policy_falls_back_to_no_body_after_bounded_wait() {
    let config = config_with(|config| config.capture.policy_wait_ms = 20);
    let interceptor = Arc::new(ReplayInterceptor::default());
    let coordinator = CaptureCoordinator::new(&config, interceptor.clone(), Arc::new(NeverResolves))
        .expect("coordinator should build");
    let entry_id = observe(&coordinator, "r1", 1);
    respond(&coordinator, "r1", 200, Some("application/json"));

    let finished = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        stream(&coordinator, "r1", &[b"{\"secret\":true}"]),
    )
    .await
    .expect("finalize must not hang on the policy lookup");
    assert_eq!(finished, EventOutcome::Finalized);

    let entry = coordinator.entry(&entry_id).unwrap();
    let response = entry.response().unwrap();
    assert_eq!(response.body, "");
    assert_eq!(response.body_size, 15);
    assert_eq!(interceptor.forwarded_bytes(), 15);
    assert_eq!(
        coordinator.filter_stats().last_filter_reason,
        Some(FilterReason::PolicyUnavailable)
    );
}

#[tokio::test]
async fn completion_before_stream_stop_keeps_the_captured_body() {
    let (coordinator, _) = coordinator(&Config::default());
    let entry_id = observe(&coordinator, "r1", 1);
    respond(&coordinator, "r1", 200, Some("text/html"));
    coordinator.stream_data(&RequestId::from("r1"), Bytes::from_static(b"<p>hi</p>"));
    assert_eq!(
        coordinator.handle_event(LifecycleEvent::RequestCompleted {
            request_id: RequestId::from("r1"),
        }),
        EventOutcome::Updated
    );
    assert_eq!(
        coordinator.entry(&entry_id).unwrap().status(),
        CaptureStatus::Pending
    );

    coordinator.stream_stopped(&RequestId::from("r1")).await;
    assert_eq!(
        coordinator.entry(&entry_id).unwrap().response().unwrap().body,
        "<p>hi</p>"
    );
}

#[tokio::test]
async fn redirect_storm_stays_within_capacity() {
    let config = config_with(|config| config.storage.max_entries = 10);
    let (coordinator, _) = coordinator(&config);

    for i in 0..200 {
        let request_id = format!("hop{i}");
        observe(&coordinator, &request_id, 1);
        respond(&coordinator, &request_id, 302, None);
        if i % 2 == 0 {
            coordinator.handle_event(LifecycleEvent::RequestCompleted {
                request_id: RequestId::from(request_id.as_str()),
            });
        }
        assert!(coordinator.size_info().current <= 10);
    }
    let target = observe(&coordinator, "final", 1);
    respond(&coordinator, "final", 200, Some("application/json"));
    stream(&coordinator, "final", &[b"{}"]).await;

    let entries = coordinator.entries();
    assert_eq!(entries.len(), 10);
    assert_eq!(entries[0].id, target);
    assert_entry_invariants(&entries);

    let stats = coordinator.stats();
    assert_eq!(stats.total_entries, 10);
    assert_eq!(
        stats.completed_entries + stats.pending_entries + stats.error_entries,
        10
    );
    assert_eq!(stats.total_data_size, 2);
}

#[tokio::test]
async fn query_surface_reflects_a_mixed_session() {
    let (coordinator, _) = coordinator(&Config::default());
    observe(&coordinator, "ok", 1);
    respond(&coordinator, "ok", 200, Some("application/json"));
    stream(&coordinator, "ok", &[b"[1]"]).await;
    observe(&coordinator, "failed", 1);
    coordinator.handle_event(LifecycleEvent::RequestFailed {
        request_id: RequestId::from("failed"),
        error: "NS_ERROR_CONNECTION_REFUSED".to_owned(),
    });
    observe(&coordinator, "waiting", 1);

    let stats = serde_json::to_value(dispatch(&coordinator, QueryRequest::GetStats)).unwrap();
    assert_eq!(stats["success"], true);
    assert_eq!(stats["data"]["totalEntries"], 3);
    assert_eq!(stats["data"]["completedEntries"], 1);
    assert_eq!(stats["data"]["errorEntries"], 1);
    assert_eq!(stats["data"]["pendingEntries"], 1);
    assert_eq!(stats["data"]["totalDataSize"], 3);
    assert!(stats["data"]["lastCaptureTime"].is_i64());

    assert_entry_invariants(&coordinator.entries());

    dispatch(&coordinator, QueryRequest::ClearAllEntries);
    dispatch(&coordinator, QueryRequest::ClearAllEntries);
    assert!(coordinator.entries().is_empty());
    let health = serde_json::to_value(dispatch(&coordinator, QueryRequest::HealthCheck)).unwrap();
    assert_eq!(health["data"]["streamInterceptionAvailable"], true);
}

struct SlowPolicy;

impl PolicyStore for SlowPolicy {
    fn load(&self) -> PolicyFuture {
        Box::pin(async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok(CaptureConfig::default())
        })
    }
}

async fn finalize_with_slow_policy(
    cancel: impl FnOnce(&CaptureCoordinator),
) -> (CaptureCoordinator, EntryId, EventOutcome) {
    let interceptor = Arc::new(ReplayInterceptor::default());
    let coordinator =
        CaptureCoordinator::new(&Config::default(), interceptor.clone(), Arc::new(SlowPolicy))
            .expect("coordinator should build");
    let entry_id = observe(&coordinator, "r1", 7);
    respond(&coordinator, "r1", 200, Some("text/plain"));
    coordinator.stream_data(&RequestId::from("r1"), Bytes::from_static(b"secret"));

    let finishing = coordinator.clone();
    let stopped =
        tokio::spawn(async move { finishing.stream_stopped(&RequestId::from("r1")).await });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    cancel(&coordinator);

    let outcome = stopped.await.expect("finalize task should not panic");
    assert_eq!(interceptor.forwarded_bytes(), 6);
    (coordinator, entry_id, outcome)
}

#[tokio::test]
async fn context_destroyed_during_policy_wait_drops_the_buffered_body() {
    let (coordinator, entry_id, outcome) = finalize_with_slow_policy(|coordinator| {
        assert_eq!(
            coordinator.handle_event(LifecycleEvent::ContextDestroyed {
                context_id: ContextId(7),
            }),
            EventOutcome::Purged(2)
        );
    })
    .await;

    assert_eq!(outcome, EventOutcome::Ignored);
    let entry = coordinator.entry(&entry_id).unwrap();
    assert_eq!(entry.status(), CaptureStatus::Pending);
    assert!(entry.response().is_none());
    assert!(coordinator.pending_requests().is_empty());
}

#[tokio::test]
async fn stop_during_policy_wait_drops_the_buffered_body() {
    let (coordinator, entry_id, outcome) =
        finalize_with_slow_policy(CaptureCoordinator::stop).await;

    assert_eq!(outcome, EventOutcome::Ignored);
    assert_eq!(
        coordinator.entry(&entry_id).unwrap().status(),
        CaptureStatus::Pending
    );
}

#[tokio::test]
async fn completion_during_policy_wait_keeps_the_buffered_body() {
    let (coordinator, entry_id, outcome) = finalize_with_slow_policy(|coordinator| {
        assert_eq!(
            coordinator.handle_event(LifecycleEvent::RequestCompleted {
                request_id: RequestId::from("r1"),
            }),
            EventOutcome::Updated
        );
    })
    .await;

    assert_eq!(outcome, EventOutcome::Finalized);
    assert_eq!(
        coordinator.entry(&entry_id).unwrap().response().unwrap().body,
        "secret"
    );
}
