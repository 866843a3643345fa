//! Room management endpoints
//!
//! - `GET /api/rooms` - rooms of the caller, most recently updated first
//! - `GET /api/rooms/:room_id/messages` - persisted history in order
//! - `PATCH /api/rooms/:room_id` - rename
//! - `DELETE /api/rooms/:room_id` - delete with its messages
//! - `PUT /api/rooms/:room_id/artist` - explicit rebind
//! - `POST /api/rooms/:room_id/fork` - copy the room into one bound to another artist
//!
//! Rooms of other accounts are reported as not found.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::middleware::AuthAccount;
use crate::models::{Message, Room};
use crate::repositories::DynChatStore;
use crate::services::{BindingError, RoomArtistBinder};

const MAX_TOPIC_LENGTH: usize = 200;

#[derive(Clone)]
pub struct RoomsState {
    pub store: DynChatStore,
    pub binder: Arc<RoomArtistBinder>,
}

impl RoomsState {
    pub fn new(store: DynChatStore, binder: Arc<RoomArtistBinder>) -> Self {
        Self { store, binder }
    }
}

/// Create the rooms router
pub fn rooms_router(state: RoomsState) -> Router {
    Router::new()
        .route("/", get(list_rooms))
        .route("/:room_id", patch(rename_room).delete(delete_room))
        .route("/:room_id/messages", get(room_messages))
        .route("/:room_id/artist", put(rebind_room))
        .route("/:room_id/fork", post(fork_room))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub topic: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebindRequest {
    #[serde(default)]
    pub artist_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkRequest {
    pub artist_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForkResponse {
    pub new_room_id: Uuid,
    pub original_room_id: Uuid,
    pub artist_id: Uuid,
}

impl From<BindingError> for ApiError {
    fn from(err: BindingError) -> Self {
        match err {
            BindingError::TurnInFlight(room_id) => ApiError::conflict("room", room_id.to_string()),
            BindingError::RoomNotFound(room_id) => ApiError::not_found("room", room_id.to_string()),
            BindingError::ArtistNotFound(artist_id) => {
                ApiError::not_found("artist", artist_id.to_string())
            }
            BindingError::Storage(e) => ApiError::from(e),
        }
    }
}

/// Load a room owned by the caller
async fn owned_room(state: &RoomsState, auth: &AuthAccount, room_id: Uuid) -> ApiResult<Room> {
    state
        .store
        .get_room(room_id)
        .await?
        .filter(|room| room.account_id == auth.identity.account_id)
        .ok_or_else(|| ApiError::not_found("room", room_id.to_string()))
}

async fn list_rooms(
    State(state): State<RoomsState>,
    auth: AuthAccount,
) -> ApiResult<Json<Vec<Room>>> {
    let rooms = state.store.list_rooms(auth.identity.account_id).await?;
    Ok(Json(rooms))
}

async fn room_messages(
    State(state): State<RoomsState>,
    auth: AuthAccount,
    Path(room_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Message>>> {
    owned_room(&state, &auth, room_id).await?;
    let messages = state.store.get_messages(room_id).await?;
    Ok(Json(messages))
}

#[instrument(skip(state, auth, request))]
async fn rename_room(
    State(state): State<RoomsState>,
    auth: AuthAccount,
    Path(room_id): Path<Uuid>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Json<Room>> {
    let topic = request.topic.trim();
    if topic.is_empty() {
        return Err(ApiError::MissingField("topic"));
    }
    if topic.chars().count() > MAX_TOPIC_LENGTH {
        return Err(ApiError::ValidationError(format!(
            "topic must be at most {} characters",
            MAX_TOPIC_LENGTH
        )));
    }

    owned_room(&state, &auth, room_id).await?;
    let room = state.store.update_topic(room_id, topic).await?;
    Ok(Json(room))
}

#[instrument(skip(state, auth))]
async fn delete_room(
    State(state): State<RoomsState>,
    auth: AuthAccount,
    Path(room_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    owned_room(&state, &auth, room_id).await?;
    if state.binder.is_streaming(room_id) {
        return Err(ApiError::conflict("room", room_id.to_string()));
    }

    state.store.delete_room(room_id).await?;
    info!("Room deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn rebind_room(
    State(state): State<RoomsState>,
    auth: AuthAccount,
    Path(room_id): Path<Uuid>,
    Json(request): Json<RebindRequest>,
) -> ApiResult<Json<Room>> {
    owned_room(&state, &auth, room_id).await?;
    let room = state
        .binder
        .rebind(room_id, auth.identity.account_id, request.artist_id)
        .await?;
    Ok(Json(room))
}

async fn fork_room(
    State(state): State<RoomsState>,
    auth: AuthAccount,
    Path(room_id): Path<Uuid>,
    Json(request): Json<ForkRequest>,
) -> ApiResult<(StatusCode, Json<ForkResponse>)> {
    owned_room(&state, &auth, room_id).await?;
    state
        .store
        .get_artist(request.artist_id)
        .await?
        .filter(|artist| artist.account_id == auth.identity.account_id)
        .ok_or_else(|| ApiError::not_found("artist", request.artist_id.to_string()))?;

    let forked = state
        .binder
        .fork(room_id, request.artist_id, Uuid::new_v4())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ForkResponse {
            new_room_id: forked.id,
            original_room_id: room_id,
            artist_id: request.artist_id,
        }),
    ))
}
