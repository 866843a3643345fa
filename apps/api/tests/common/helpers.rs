//! Test helper functions for API integration tests

#![allow(dead_code)]

use std::time::Duration;

use axum::body::Body;
use axum::http::Response;
use futures_util::StreamExt;
use uuid::Uuid;

use encore_api::models::Message;
use encore_api::repositories::ChatStore;
use encore_api::services::{TurnEvent, TurnStream};

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout_ms: u64, poll_interval_ms: u64) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    let interval = Duration::from_millis(poll_interval_ms);

    loop {
        if condition().await {
            return true;
        }

        if start.elapsed() >= timeout {
            return false;
        }

        tokio::time::sleep(interval).await;
    }
}

/// Drain a turn stream to its end
pub async fn collect_events(stream: TurnStream) -> Vec<TurnEvent> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("turn stream did not finish")
}

/// Wait until a room holds `count` messages and return them
///
/// Persistence runs after the stream closes, so tests poll for it.
pub async fn wait_for_messages(store: &dyn ChatStore, room_id: Uuid, count: usize) -> Vec<Message> {
    let persisted = wait_for(
        move || async move {
            store
                .get_messages(room_id)
                .await
                .map(|messages| messages.len() == count)
                .unwrap_or(false)
        },
        2_000,
        10,
    )
    .await;
    let messages = store.get_messages(room_id).await.unwrap();
    assert!(
        persisted,
        "expected {} messages in room {}, found {}",
        count,
        room_id,
        messages.len()
    );
    messages
}

pub fn texts(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.content.text()).collect()
}

/// Concatenated text deltas of a turn
pub fn streamed_text(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            TurnEvent::TextDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

pub fn event_names(events: &[TurnEvent]) -> Vec<&'static str> {
    events.iter().map(TurnEvent::name).collect()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
