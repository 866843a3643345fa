//! Integration tests for chat turns
//!
//! Runs turns through the orchestrator on in-memory storage with scripted
//! model backends and checks both the streamed events and what ends up
//! persisted afterwards.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;

use common::*;
use encore_api::error::ApiError;
use encore_api::models::{KnowledgeEntry, Message, MessageRole, NewRoom, ToolResultState};
use encore_api::repositories::ChatStore;
use encore_api::services::router::{BackendEvent, ModelMessage};
use encore_api::services::{
    BackendError, BindingError, ChatError, NotificationEvent, StreamErrorCode, TurnEvent,
};
use uuid::Uuid;

#[tokio::test]
async fn test_conversation_round_trip_persists_in_order() {
    let app = TestApp::new(vec![
        text(&["Hello", " there"]),
        text(&["The tour starts in May."]),
    ]);
    let room_id = Uuid::new_v4();

    let first = Message::user("Hi");
    let stream = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), app.request(room_id, vec![first.clone()]))
        .await
        .unwrap();
    let events = collect_events(stream).await;

    assert_eq!(
        event_names(&events),
        vec!["binding", "text-delta", "text-delta", "finish"]
    );
    assert_eq!(streamed_text(&events), "Hello there");

    let stored = wait_for_messages(app.store.as_ref(), room_id, 2).await;
    assert_eq!(stored[0], first);
    assert_eq!(stored[1].role, MessageRole::Assistant);
    assert_eq!(stored[1].content.text(), "Hello there");
    assert_matches!(
        events.last(),
        Some(TurnEvent::Finish { message_id, finish_reason })
            if *message_id == stored[1].id && finish_reason.as_deref() == Some("stop")
    );

    // The client resends the history it was shown plus the next message
    let mut history = stored.clone();
    history.push(Message::user("When does the tour start?"));
    let stream = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), app.request(room_id, history))
        .await
        .unwrap();
    collect_events(stream).await;

    let stored = wait_for_messages(app.store.as_ref(), room_id, 4).await;
    assert_eq!(
        texts(&stored),
        vec![
            "Hi",
            "Hello there",
            "When does the tour start?",
            "The tour starts in May."
        ]
    );

    let room = app.store.get_room(room_id).await.unwrap().unwrap();
    assert_eq!(room.account_id, app.account_id);
    assert_eq!(room.topic, "Hi");
}

#[tokio::test]
async fn test_new_room_is_announced_once() {
    let app = TestApp::new(vec![text(&["One"]), text(&["Two"])]);
    let room_id = Uuid::new_v4();

    let stream = app
        .services
        .orchestrator
        .handle_turn(
            &app.identity(),
            app.request(room_id, vec![Message::user("Plan the spring release for Nova")]),
        )
        .await
        .unwrap();
    collect_events(stream).await;

    let event = app.notifier.wait_for("new_conversation").await;
    assert_matches!(
        event,
        Some(NotificationEvent::NewConversation { room_id: id, topic, .. })
            if id == room_id && topic == "Plan the spring release for"
    );

    let mut history = wait_for_messages(app.store.as_ref(), room_id, 2).await;
    history.push(Message::user("And the summer?"));
    let stream = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), app.request(room_id, history))
        .await
        .unwrap();
    collect_events(stream).await;
    wait_for_messages(app.store.as_ref(), room_id, 4).await;

    let announced = app
        .notifier
        .kinds()
        .into_iter()
        .filter(|kind| *kind == "new_conversation")
        .count();
    assert_eq!(announced, 1);
}

#[tokio::test]
async fn test_room_binding_wins_over_selection() {
    let app = TestApp::new(vec![text(&["Working on it"])]);
    let bound = app.seed_artist("Nova").await;
    let selected = app.seed_artist("Lumen").await;
    let history = vec![Message::user("Hi"), Message::assistant("Hello")];
    let room = app.seed_room(Some(bound), &history).await;

    let mut messages = history.clone();
    messages.push(Message::user("Draft a press release"));
    let mut request = app.request(room.id, messages);
    request.artist_id = Some(selected);

    let stream = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), request)
        .await
        .unwrap();
    let events = collect_events(stream).await;

    assert_eq!(
        events[0],
        TurnEvent::Binding {
            room_id: room.id,
            artist_id: Some(bound),
            binding_changed: true,
        }
    );
    assert!(app.primary.requests()[0]
        .system
        .contains(&bound.to_string()));

    wait_for_messages(app.store.as_ref(), room.id, 4).await;
    let stored = app.store.get_room(room.id).await.unwrap().unwrap();
    assert_eq!(stored.artist_id, Some(bound));
}

#[tokio::test]
async fn test_bound_artist_knowledge_reaches_the_prompt() {
    let app = TestApp::new(vec![text(&["Noted"])]);
    let artist = app.seed_artist("Nova").await;
    app.store
        .add_knowledge(
            artist,
            KnowledgeEntry {
                name: "bio.md".to_string(),
                mime_type: "text/markdown".to_string(),
                content: "Nova is a synth-pop duo from Lyon.".to_string(),
            },
        )
        .await;
    app.store
        .add_knowledge(
            artist,
            KnowledgeEntry {
                name: "cover.png".to_string(),
                mime_type: "image/png".to_string(),
                content: "binary".to_string(),
            },
        )
        .await;

    let mut request = app.request(Uuid::new_v4(), vec![Message::user("Who is Nova?")]);
    request.artist_id = Some(artist);
    let stream = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), request)
        .await
        .unwrap();
    collect_events(stream).await;

    let system = &app.primary.requests()[0].system;
    assert!(system.contains("--- bio.md ---"));
    assert!(system.contains("synth-pop duo from Lyon"));
    assert!(!system.contains("cover.png"));
}

#[tokio::test]
async fn test_create_artist_forks_room() {
    let app = TestApp::new(vec![
        call_tool("create_artist", json!({"name": "Lumen"})),
        text(&["Lumen is ready."]),
    ]);
    let original = app.seed_artist("Nova").await;
    let history = vec![Message::user("Hi"), Message::assistant("Hello")];
    let room = app.seed_room(Some(original), &history).await;

    let mut messages = history.clone();
    messages.push(Message::user("Create an artist called Lumen"));
    let stream = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), app.request(room.id, messages))
        .await
        .unwrap();
    let events = collect_events(stream).await;

    assert_eq!(
        event_names(&events),
        vec![
            "binding",
            "tool-call",
            "tool-result",
            "room-forked",
            "text-delta",
            "finish"
        ]
    );
    let (new_room_id, created) = match &events[3] {
        TurnEvent::RoomForked { room_id, artist_id } => (*room_id, *artist_id),
        other => panic!("expected room-forked, got {:?}", other),
    };
    assert_ne!(new_room_id, room.id);

    let artist = app.store.get_artist(created).await.unwrap().unwrap();
    assert_eq!(artist.name, "Lumen");
    assert_eq!(artist.account_id, app.account_id);

    let source = wait_for_messages(app.store.as_ref(), room.id, 4).await;
    let forked = wait_for_messages(app.store.as_ref(), new_room_id, 4).await;
    assert_eq!(forked, source);

    let forked_room = app.store.get_room(new_room_id).await.unwrap().unwrap();
    assert_eq!(forked_room.artist_id, Some(created));
    assert_eq!(forked_room.account_id, app.account_id);

    let source_room = app.store.get_room(room.id).await.unwrap().unwrap();
    assert_eq!(source_room.artist_id, Some(original));
}

#[tokio::test]
async fn test_invalid_tool_arguments_are_fed_back() {
    let tools = CountingTools::new(Duration::ZERO);
    let app = TestApp::builder(vec![
        call_tool(COUNT_TOOL, json!({"track": 42})),
        text(&["Which track did you mean?"]),
    ])
    .tool_source(tools.clone())
    .build();

    let stream = app
        .services
        .orchestrator
        .handle_turn(
            &app.identity(),
            app.request(Uuid::new_v4(), vec![Message::user("Log a play")]),
        )
        .await
        .unwrap();
    let events = collect_events(stream).await;

    assert_matches!(
        &events[2],
        TurnEvent::ToolResult { result: ToolResultState::Error { reason }, .. }
            if reason.contains("track")
    );
    assert_eq!(tools.executions(), 0);

    let requests = app.primary.requests();
    assert_eq!(requests.len(), 2);
    assert_matches!(
        requests[1].messages.last(),
        Some(ModelMessage::Tool { tool_name, content, .. })
            if tool_name == COUNT_TOOL && content.contains("error")
    );
    assert_matches!(events.last(), Some(TurnEvent::Finish { .. }));
}

#[tokio::test]
async fn test_tool_step_limit_finishes_turn() {
    let tools = CountingTools::new(Duration::ZERO);
    let app = TestApp::builder(vec![call_tool(COUNT_TOOL, json!({"track": "Intro"}))])
        .tool_source(tools.clone())
        .max_tool_steps(2)
        .build();

    let stream = app
        .services
        .orchestrator
        .handle_turn(
            &app.identity(),
            app.request(Uuid::new_v4(), vec![Message::user("Loop forever")]),
        )
        .await
        .unwrap();
    let events = collect_events(stream).await;

    assert_matches!(
        events.last(),
        Some(TurnEvent::Finish { finish_reason, .. }) if finish_reason.as_deref() == Some("max-steps")
    );
    assert_eq!(app.primary.calls(), 2);
    assert_eq!(tools.executions(), 2);
}

#[tokio::test]
async fn test_turn_timeout_ends_stream_with_error() {
    let app = TestApp::builder(vec![Script::Stall(vec![BackendEvent::Delta(
        "Thinking".to_string(),
    )])])
    .turn_timeout(Duration::from_millis(200))
    .build();
    let room_id = Uuid::new_v4();

    let stream = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), app.request(room_id, vec![Message::user("Hi")]))
        .await
        .unwrap();
    let events = collect_events(stream).await;

    assert_eq!(event_names(&events), vec!["binding", "text-delta", "error"]);
    assert_matches!(
        events.last(),
        Some(TurnEvent::Error { code: StreamErrorCode::Timeout, .. })
    );

    assert!(app.notifier.wait_for("turn_failed").await.is_some());
    let stored = wait_for_messages(app.store.as_ref(), room_id, 2).await;
    assert_eq!(stored[1].content.text(), "Thinking");
}

#[tokio::test]
async fn test_mid_stream_provider_error() {
    let app = TestApp::new(vec![Script::FailAfter(
        vec![BackendEvent::Delta("Half an ans".to_string())],
        BackendError::Provider("model crashed".to_string()),
    )]);
    let room_id = Uuid::new_v4();

    let stream = app
        .services
        .orchestrator
        .handle_turn(
            &app.identity(),
            app.request(room_id, vec![Message::user("Tell me everything")]),
        )
        .await
        .unwrap();
    let events = collect_events(stream).await;

    assert_eq!(event_names(&events), vec!["binding", "text-delta", "error"]);
    assert_matches!(
        events.last(),
        Some(TurnEvent::Error { code: StreamErrorCode::ProviderError, .. })
    );

    let failure = app.notifier.wait_for("turn_failed").await;
    assert_matches!(
        failure,
        Some(NotificationEvent::TurnFailed { email, last_message, .. })
            if email == "am@label.test" && last_message.as_deref() == Some("Tell me everything")
    );
}

#[tokio::test]
async fn test_persistence_failure_does_not_break_stream() {
    let app = TestApp::new(vec![text(&["Saved?"])]);
    app.store.set_fail_writes(true);
    let room_id = Uuid::new_v4();

    let stream = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), app.request(room_id, vec![Message::user("Hi")]))
        .await
        .unwrap();
    let events = collect_events(stream).await;

    assert_matches!(events.last(), Some(TurnEvent::Finish { .. }));
    assert_matches!(
        app.notifier.wait_for("persistence_failed").await,
        Some(NotificationEvent::PersistenceFailed { room_id: id, .. }) if id == room_id
    );
    assert!(app.store.get_room(room_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_turns_never_start() {
    let app = TestApp::new(vec![text(&["unused"])]);

    let empty = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), app.request(Uuid::new_v4(), vec![]))
        .await;
    assert!(empty.is_err());

    let trailing_assistant = app
        .services
        .orchestrator
        .handle_turn(
            &app.identity(),
            app.request(Uuid::new_v4(), vec![Message::assistant("Hi")]),
        )
        .await;
    assert!(trailing_assistant.is_err());

    let outsider = Uuid::new_v4();
    let foreign = app
        .store
        .create_room(NewRoom {
            id: Uuid::new_v4(),
            account_id: outsider,
            artist_id: None,
            topic: "Private".to_string(),
        })
        .await
        .unwrap();
    let mut request = app.request(foreign.id, vec![Message::user("Let me in")]);
    request.account_id = app.account_id;
    let forbidden = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), request)
        .await;
    assert_matches!(forbidden, Err(ChatError::RoomForbidden(id)) if id == foreign.id);

    let mut mismatched = app.request(Uuid::new_v4(), vec![Message::user("Hi")]);
    mismatched.account_id = outsider;
    let mismatched = app
        .services
        .orchestrator
        .handle_turn(&app.identity(), mismatched)
        .await;
    assert_matches!(mismatched, Err(ChatError::AccountMismatch));

    assert_eq!(app.primary.calls(), 0);
}

#[tokio::test]
async fn test_storage_failure_before_streaming_is_notified() {
    let app = TestApp::new(vec![text(&["unused"])]);
    app.store.set_fail_reads(true);
    let room_id = Uuid::new_v4();

    let result = app
        .services
        .orchestrator
        .handle_turn(
            &app.identity(),
            app.request(room_id, vec![Message::user("Where are we?")]),
        )
        .await;

    let err = match result {
        Err(e) => e,
        Ok(_) => panic!("turn started although the room could not be read"),
    };
    assert_matches!(&err, ChatError::Binding(BindingError::Storage(_)));
    assert!(ApiError::from(err).status_code().is_server_error());
    assert_matches!(
        app.notifier.wait_for("turn_failed").await,
        Some(NotificationEvent::TurnFailed { room_id: id, last_message, .. })
            if id == room_id && last_message.as_deref() == Some("Where are we?")
    );
    assert_eq!(app.primary.calls(), 0);
    assert!(!app.services.binder.is_streaming(room_id));
}

#[tokio::test]
async fn test_rebind_is_refused_while_turn_is_prepared() {
    let gate = GatedKnowledge::new();
    let app = TestApp::builder(vec![text(&["Noted."])])
        .knowledge(gate.clone())
        .build();
    let bound = app.seed_artist("Nova").await;
    let other = app.seed_artist("Lumen").await;
    let history = vec![Message::user("What is next?")];
    let room = app.seed_room(Some(bound), &history).await;

    let orchestrator = app.services.orchestrator.clone();
    let identity = app.identity();
    let request = app.request(room.id, history);
    let pending = tokio::spawn(async move { orchestrator.handle_turn(&identity, request).await });

    // The binding is resolved and the knowledge lookup is parked
    gate.entered().await;
    let rebind = app
        .services
        .binder
        .rebind(room.id, app.account_id, Some(other))
        .await;
    assert_matches!(rebind, Err(BindingError::TurnInFlight(id)) if id == room.id);

    gate.open();
    let events = collect_events(pending.await.unwrap().unwrap()).await;
    assert_matches!(
        &events[0],
        TurnEvent::Binding { artist_id, .. } if *artist_id == Some(bound)
    );
    assert_eq!(streamed_text(&events), "Noted.");
    assert_eq!(
        app.store.get_room(room.id).await.unwrap().unwrap().artist_id,
        Some(bound)
    );
}
