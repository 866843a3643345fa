//! Chat turn endpoint
//!
//! - `POST /api/chat` - run a turn and stream its events as SSE
//!
//! Validation, authorization and binding failures are returned as ordinary
//! JSON errors. Once the stream has started, failures arrive as a terminal
//! `error` event instead.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tracing::info;

use crate::error::ApiResult;
use crate::middleware::AuthAccount;
use crate::services::{ChatOrchestrator, TurnEvent, TurnRequest};

#[derive(Clone)]
pub struct ChatState {
    pub orchestrator: ChatOrchestrator,
}

impl ChatState {
    pub fn new(orchestrator: ChatOrchestrator) -> Self {
        Self { orchestrator }
    }
}

/// Create the chat router
pub fn chat_router(state: ChatState) -> Router {
    Router::new()
        .route("/", post(chat_turn))
        .with_state(state)
}

fn to_sse(event: &TurnEvent) -> Event {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            tracing::error!(error = %e, event = event.name(), "Failed to encode stream event");
            Event::default()
                .event("error")
                .data(r#"{"type":"error","code":"INTERNAL","message":"An internal error occurred."}"#)
        }
    }
}

async fn chat_turn(
    State(state): State<ChatState>,
    auth: AuthAccount,
    Json(request): Json<TurnRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let stream = state
        .orchestrator
        .handle_turn(&auth.identity, request)
        .await?;

    info!(room_id = %stream.room_id(), account_id = %auth.identity.account_id, "Streaming chat turn");

    let events = stream.map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_event_names_follow_payload_type() {
        let event = TurnEvent::Finish {
            message_id: Uuid::new_v4(),
            finish_reason: Some("stop".to_string()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.name());
        // Encoding never fails for turn events
        let _ = to_sse(&event);
    }
}
