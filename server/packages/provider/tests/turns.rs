mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use codex_provider::mock::APPROVAL_METHOD;
use codex_provider::{
    MockAppServer, MockScript, PoolConfig, PoolRegistry, ProviderError, StreamChunk, TurnRequest,
    TurnState,
};
use codex_provider_protocol::{DeltaKind, Model, TurnStatus};
use common::*;
use serde_json::json;

#[tokio::test]
async fn end_to_end_turn_yields_one_delta_and_finishes() {
    let server = mock(MockScript::default());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("say hello"))
        .await
        .expect("stream");
    let chunks = drain(&mut stream).await;

    let chunks: Vec<StreamChunk> = chunks
        .into_iter()
        .map(|chunk| chunk.expect("no errors"))
        .collect();
    let thread_id = stream.session().thread_id().to_string();
    let turn_id = stream.session().turn_id().to_string();
    let item_id = format!("item-{turn_id}");
    assert_eq!(
        chunks,
        vec![
            StreamChunk::TurnStarted {
                turn_id: turn_id.clone()
            },
            StreamChunk::ItemStarted {
                item_id: item_id.clone(),
                item_type: "agentMessage".to_string(),
            },
            StreamChunk::Delta {
                item_id: item_id.clone(),
                kind: DeltaKind::AgentMessage,
                delta: "Hello from the mock agent.".to_string(),
            },
            StreamChunk::ItemCompleted {
                item_id,
                item_type: "agentMessage".to_string(),
            },
            StreamChunk::Finished {
                status: TurnStatus::Completed,
            },
        ]
    );
    assert_eq!(stream.session().state(), TurnState::Completed);
    assert!(!stream.session().is_active());
    assert!(next_chunk(&mut stream).await.is_none());

    let turn_start = server.requests("turn/start");
    assert_eq!(turn_start.len(), 1);
    let params = turn_start[0].params.clone().expect("params");
    assert_eq!(params["threadId"], thread_id);
    assert_eq!(
        params["input"],
        json!([{ "type": "text", "text": "say hello", "text_elements": [] }])
    );
    assert_eq!(server.count("initialized"), 1);
    assert_eq!(provider.pool().stats().idle, 1);
}

#[tokio::test]
async fn session_is_active_inside_the_creation_hook() {
    let server = mock(MockScript::default());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let seen: Arc<Mutex<Option<(bool, String)>>> = Arc::new(Mutex::new(None));
    let hook_seen = seen.clone();
    let stream = provider
        .stream(TurnRequest::text("hi").on_session_created(move |session| {
            *hook_seen.lock().expect("lock") =
                Some((session.is_active(), session.turn_id().to_string()));
        }))
        .await
        .expect("stream");

    let (active, turn_id) = seen.lock().expect("lock").clone().expect("hook ran");
    assert!(active);
    assert_eq!(turn_id, stream.session().turn_id());

    stream.collect_text().await.expect("turn");
}

#[tokio::test]
async fn steer_and_interrupt_target_the_running_turn() {
    let server = mock(MockScript::default().hold_turn_open());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("start"))
        .await
        .expect("stream");
    let session = stream.session().clone();
    assert!(session.is_active());

    session
        .inject_message("also run the tests")
        .await
        .expect("steer");
    let steers = server.requests("turn/steer");
    assert_eq!(steers.len(), 1);
    assert_eq!(
        steers[0].params,
        Some(json!({
            "threadId": session.thread_id(),
            "expectedTurnId": session.turn_id(),
            "input": [{ "type": "text", "text": "also run the tests", "text_elements": [] }]
        }))
    );

    session.interrupt().await.expect("interrupt");
    assert!(!session.is_active());
    assert_eq!(session.state(), TurnState::Interrupted);
    let interrupts = server.requests("turn/interrupt");
    assert_eq!(interrupts.len(), 1);
    assert_eq!(
        interrupts[0].params,
        Some(json!({ "threadId": session.thread_id(), "turnId": session.turn_id() }))
    );

    assert!(matches!(
        session.inject_message("too late").await,
        Err(ProviderError::SessionInactive { .. })
    ));
    assert!(matches!(
        session.interrupt().await,
        Err(ProviderError::SessionInactive { .. })
    ));
    assert_eq!(server.count("turn/steer"), 1);
    assert_eq!(server.count("turn/interrupt"), 1);

    let chunks = drain(&mut stream).await;
    assert_eq!(delta_texts(&chunks), vec!["Hello from the mock agent."]);
    assert!(matches!(
        chunks.last(),
        Some(Ok(StreamChunk::Finished {
            status: TurnStatus::Interrupted
        }))
    ));
}

#[tokio::test]
async fn late_completion_after_interrupt_does_not_reopen_the_turn() {
    let server = mock(
        MockScript::default()
            .hold_turn_open()
            .complete_on_interrupt(),
    );
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("start"))
        .await
        .expect("stream");
    let session = stream.session().clone();
    session.interrupt().await.expect("interrupt");

    let chunks = drain(&mut stream).await;
    let finishes = chunks
        .iter()
        .filter(|chunk| matches!(chunk, Ok(StreamChunk::Finished { .. })))
        .count();
    assert_eq!(finishes, 1);
    assert!(chunks.iter().all(Result::is_ok));
    assert_eq!(session.state(), TurnState::Interrupted);
}

#[tokio::test]
async fn failed_turn_ends_with_exactly_one_error() {
    let server = mock(MockScript::default().fail_with("model overloaded"));
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("hi"))
        .await
        .expect("stream");
    let chunks = drain(&mut stream).await;

    let errors: Vec<&ProviderError> = chunks.iter().filter_map(|chunk| chunk.as_ref().err()).collect();
    assert_eq!(errors.len(), 1);
    match errors[0] {
        ProviderError::TurnFailed { message, turn_id } => {
            assert_eq!(message, "model overloaded");
            assert_eq!(turn_id, stream.session().turn_id());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(chunks.last().map(Result::is_err).unwrap_or(false));
    assert_eq!(stream.session().state(), TurnState::Failed);
}

#[tokio::test]
async fn crash_during_turn_start_rejects_the_call() {
    let server = mock(MockScript::default().crash_on_turn_start());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let result = provider.stream(TurnRequest::text("hi")).await;
    assert!(matches!(result, Err(ProviderError::TransportClosed { .. })));

    let stats = provider.pool().stats();
    assert_eq!(stats.live(), 0);
    assert_eq!(stats.created, 1);
}

#[tokio::test]
async fn transport_loss_mid_turn_surfaces_one_terminal_error() {
    let server = mock(MockScript::default().hold_turn_open());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("hi"))
        .await
        .expect("stream");
    assert!(matches!(
        next_chunk(&mut stream).await,
        Some(Ok(StreamChunk::TurnStarted { .. }))
    ));

    let session = stream.session().clone();
    provider.shutdown();
    assert_eq!(session.state(), TurnState::Failed);
    assert!(matches!(
        session.inject_message("anyone there?").await,
        Err(ProviderError::SessionInactive { .. })
    ));

    let chunks = drain(&mut stream).await;
    let errors = chunks.iter().filter(|chunk| chunk.is_err()).count();
    assert_eq!(errors, 1);
    assert!(matches!(
        chunks.last(),
        Some(Err(ProviderError::TransportClosed { .. }))
    ));
    assert_eq!(server.count("turn/steer"), 0);

    assert!(matches!(
        provider.stream(TurnRequest::text("again")).await,
        Err(ProviderError::PoolClosed)
    ));
}

#[tokio::test]
async fn approval_requests_reach_the_caller_and_can_be_answered() {
    let server = mock(MockScript::default().approval_request());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("run it"))
        .await
        .expect("stream");
    let session = stream.session().clone();
    let chunks = drain(&mut stream).await;

    let request_id = chunks
        .iter()
        .find_map(|chunk| match chunk {
            Ok(StreamChunk::ServerRequest { id, method, .. }) if method == APPROVAL_METHOD => {
                Some(id.clone())
            }
            _ => None,
        })
        .expect("approval request chunk");

    session
        .respond(request_id, Ok(json!({ "decision": "accept" })))
        .await
        .expect("respond");
    wait_until(|| server.count("response") == 1).await;
    assert_eq!(
        server.requests("response")[0].params,
        Some(json!({ "decision": "accept" }))
    );
}

#[tokio::test]
async fn list_models_keeps_catalog_fields() {
    let server = mock(MockScript::default());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let models = provider.list_models().await.expect("models");
    assert_eq!(models.len(), 1);
    assert!(models[0].is_default);
    assert_eq!(models[0].input_modalities, vec!["text", "image"]);
    assert_eq!(models[0], MockAppServer::default_model());
}

#[tokio::test]
async fn list_models_follows_pagination_in_order() {
    let catalog: Vec<Model> = ["alpha", "beta", "gamma"]
        .into_iter()
        .map(|id| Model {
            id: id.to_string(),
            model: id.to_string(),
            display_name: id.to_uppercase(),
            is_default: id == "beta",
            ..MockAppServer::default_model()
        })
        .collect();
    let server = mock(MockScript::default().models(catalog, Some(2)));
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let models = provider.list_models().await.expect("models");
    let ids: Vec<&str> = models.iter().map(|model| model.id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "beta", "gamma"]);
    assert_eq!(server.count("model/list"), 2);
    assert_eq!(
        server.requests("model/list")[1].params,
        Some(json!({ "cursor": "2" }))
    );
}

#[tokio::test]
async fn dropping_a_stream_releases_its_connection() {
    let server = mock(MockScript::default().hold_turn_open());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let stream = provider
        .stream(TurnRequest::text("hi"))
        .await
        .expect("stream");
    let session = stream.session().clone();
    assert_eq!(provider.pool().stats().in_use, 1);

    drop(stream);
    assert_eq!(provider.pool().stats().idle, 1);
    assert_eq!(session.state(), TurnState::Detached);
    assert!(matches!(
        session.interrupt().await,
        Err(ProviderError::SessionInactive { .. })
    ));
    assert!(matches!(
        session.inject_message("still listening?").await,
        Err(ProviderError::SessionInactive { .. })
    ));
    assert_eq!(server.count("turn/interrupt"), 0);
    assert_eq!(server.count("turn/steer"), 0);
}

#[tokio::test]
async fn dropping_a_finished_stream_keeps_the_completed_state() {
    let server = mock(MockScript::default());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let stream = provider
        .stream(TurnRequest::text("hi"))
        .await
        .expect("stream");
    let session = stream.session().clone();
    wait_until(|| !session.is_active()).await;

    drop(stream);
    assert_eq!(session.state(), TurnState::Completed);
}

#[tokio::test]
async fn session_ends_when_the_turn_completes_without_pulling() {
    let server = mock(MockScript::default());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("hi"))
        .await
        .expect("stream");
    let session = stream.session().clone();

    wait_until(|| !session.is_active()).await;
    assert_eq!(session.state(), TurnState::Completed);
    assert!(matches!(
        session.inject_message("too late").await,
        Err(ProviderError::SessionInactive { .. })
    ));
    assert_eq!(server.count("turn/steer"), 0);

    let chunks = drain(&mut stream).await;
    assert_eq!(delta_texts(&chunks), vec!["Hello from the mock agent."]);
    assert!(matches!(
        chunks.last(),
        Some(Ok(StreamChunk::Finished {
            status: TurnStatus::Completed
        }))
    ));
}

#[tokio::test]
async fn late_consumer_still_receives_every_delta_of_a_long_turn() {
    let deltas: Vec<String> = (0..1500).map(|n| format!("chunk-{n} ")).collect();
    let server = mock(MockScript::default().deltas(deltas.clone()));
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("write a lot"))
        .await
        .expect("stream");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let chunks = drain(&mut stream).await;
    assert!(chunks.iter().all(Result::is_ok));
    assert_eq!(delta_texts(&chunks), deltas);
    assert!(matches!(
        chunks.last(),
        Some(Ok(StreamChunk::Finished {
            status: TurnStatus::Completed
        }))
    ));
    assert_eq!(stream.session().state(), TurnState::Completed);
}

#[tokio::test]
async fn nested_turn_completion_finishes_the_stream() {
    let server = mock(MockScript::default().nested_completion());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("hi"))
        .await
        .expect("stream");
    let chunks = drain(&mut stream).await;

    assert!(chunks.iter().all(Result::is_ok));
    assert!(matches!(
        chunks.last(),
        Some(Ok(StreamChunk::Finished {
            status: TurnStatus::Completed
        }))
    ));
    assert_eq!(stream.session().state(), TurnState::Completed);
}

#[tokio::test]
async fn unreadable_completion_for_the_turn_ends_with_a_parse_error() {
    let server = mock(MockScript::default().malformed_completion());
    let registry = PoolRegistry::new();
    let provider = provider(PoolConfig::private(1), &factory(&server), &registry);

    let mut stream = provider
        .stream(TurnRequest::text("hi"))
        .await
        .expect("stream");
    let chunks = drain(&mut stream).await;

    let errors: Vec<&ProviderError> = chunks.iter().filter_map(|chunk| chunk.as_ref().err()).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ProviderError::Parse { .. }));
    assert!(chunks.last().map(Result::is_err).unwrap_or(false));
    assert_eq!(delta_texts(&chunks), vec!["Hello from the mock agent."]);
    assert_eq!(stream.session().state(), TurnState::Failed);
    assert_eq!(provider.pool().stats().idle, 1);
}
