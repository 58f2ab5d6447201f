#![forbid(unsafe_code)]

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use roomcast_domain::{Identity, RoomId, User};
use roomcast_protocol::MessagePayload;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::server::connection;
use crate::server::state::AppState;

const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 200;

/// Full server surface: the WebSocket endpoints, the cached read
/// endpoints and the health probes.
pub fn build_router(app: AppState) -> Router {
	Router::new()
		.route("/ws/chat", get(connection::chat_ws))
		.route("/ws/chat/{room_id}", get(connection::chat_ws_room))
		.route("/api/rooms/{room_id}/messages", get(list_room_messages))
		.route("/api/rooms/{room_id}/online", get(room_online_users))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.with_state(app)
}

#[derive(Debug, Deserialize)]
struct PageParams {
	limit: Option<u32>,
	offset: Option<u32>,
}

fn error_response(status: StatusCode, detail: &str) -> Response {
	let mut response = (status, Json(json!({ "detail": detail }))).into_response();
	if status == StatusCode::SERVICE_UNAVAILABLE {
		// Transient store failures are retryable; say so.
		if let Ok(value) = header::HeaderValue::from_str("1") {
			response.headers_mut().insert(header::RETRY_AFTER, value);
		}
	}
	response
}

/// Authenticate the request and require active room membership.
async fn participant_gate(
	app: &AppState,
	headers: &HeaderMap,
	query: Option<&str>,
	room: RoomId,
) -> Result<User, Response> {
	let identity = app.validator.resolve(headers, query).await;
	let Identity::User(user) = identity else {
		return Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized"));
	};

	match app.store.is_active_participant(room, user.id).await {
		Ok(true) => Ok(user),
		Ok(false) => Err(error_response(StatusCode::FORBIDDEN, "not_a_participant")),
		Err(e) => {
			warn!(%room, error = %e, "membership check failed on read path");
			Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"))
		}
	}
}

fn json_body(body: String) -> Response {
	([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// `GET /api/rooms/{room_id}/messages?limit&offset`
///
/// Served through the versioned cache: pages are keyed by the room's
/// current version, so a concurrent write makes this read miss instead of
/// returning stale data.
async fn list_room_messages(
	Path(room_id): Path<i64>,
	Query(params): Query<PageParams>,
	State(app): State<AppState>,
	headers: HeaderMap,
	RawQuery(query): RawQuery,
) -> Response {
	let Ok(room) = RoomId::new(room_id) else {
		return error_response(StatusCode::NOT_FOUND, "room_not_found");
	};

	let user = match participant_gate(&app, &headers, query.as_deref(), room).await {
		Ok(user) => user,
		Err(response) => return response,
	};

	let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
	let offset = params.offset.unwrap_or(0);

	// A cache failure downgrades to an uncached read; the store stays the
	// source of truth.
	let (cached, cache_key, version) = match app.cache.cached_messages(room, limit, offset).await {
		Ok(found) => found,
		Err(e) => {
			warn!(%room, error = %e, "message cache read failed; serving uncached");
			(None, String::new(), 0)
		}
	};

	if let Some(body) = cached {
		metrics::counter!("roomcast_server_message_cache_hits_total").increment(1);
		return json_body(body);
	}

	metrics::counter!("roomcast_server_message_cache_misses_total").increment(1);
	debug!(%room, user_id = %user.id, version, limit, offset, "message list cache miss");

	let messages = match app.store.list_messages(room, limit, offset).await {
		Ok(messages) => messages,
		Err(e) => {
			warn!(%room, error = %e, "message list read failed");
			return error_response(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable");
		}
	};

	let payloads: Vec<MessagePayload> = messages.into_iter().map(MessagePayload::from).collect();
	let body = match serde_json::to_string(&payloads) {
		Ok(body) => body,
		Err(e) => {
			warn!(%room, error = %e, "failed to encode message list");
			return error_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding_failed");
		}
	};

	if !cache_key.is_empty()
		&& let Err(e) = app.cache.store_messages(&cache_key, &body).await
	{
		warn!(%room, error = %e, "message cache write failed");
	}

	json_body(body)
}

/// `GET /api/rooms/{room_id}/online` — distinct user ids with a live
/// presence record in the room.
async fn room_online_users(
	Path(room_id): Path<i64>,
	State(app): State<AppState>,
	headers: HeaderMap,
	RawQuery(query): RawQuery,
) -> Response {
	let Ok(room) = RoomId::new(room_id) else {
		return error_response(StatusCode::NOT_FOUND, "room_not_found");
	};

	if let Err(response) = participant_gate(&app, &headers, query.as_deref(), room).await {
		return response;
	}

	let mut user_ids: Vec<i64> = app.presence.online_users(room).await.into_iter().map(|u| u.as_i64()).collect();
	user_ids.sort_unstable();

	Json(json!({ "room_id": room, "user_ids": user_ids })).into_response()
}

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz(State(app): State<AppState>) -> Response {
	if app.health.is_ready() {
		(StatusCode::OK, "ready").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
	}
}
