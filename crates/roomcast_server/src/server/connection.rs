#![forbid(unsafe_code)]

use std::collections::HashSet;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use roomcast_domain::{ConnectionId, Identity, RoomId, User};
use roomcast_protocol::{CLOSE_POLICY_VIOLATION, CLOSE_UNAUTHORIZED, ClientAction, ErrorDetail, ServerEvent, parse_client_action};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::admission::{self, AdmittedConnection};
use crate::server::rate_limit::SlidingWindow;
use crate::server::room_bus::{BusEvent, SessionHandle};
use crate::server::state::AppState;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub rate_limit_max_events: u32,
	pub rate_limit_per_seconds: u64,

	/// Capacity of the bus fan-in queue; a session that cannot drain it
	/// starts dropping broadcasts and receives lag markers instead.
	pub fan_in_channel_capacity: usize,

	pub outbound_channel_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			rate_limit_max_events: 30,
			rate_limit_per_seconds: 10,
			fan_in_channel_capacity: 1024,
			outbound_channel_capacity: 256,
		}
	}
}

/// Items queued for the connection's writer task.
#[derive(Debug)]
enum Outbound {
	Event(ServerEvent),
	Close { code: u16, reason: &'static str },
}

/// `GET /ws/chat` — upgrade with no room bound in the path.
pub async fn chat_ws(
	State(app): State<AppState>,
	headers: HeaderMap,
	RawQuery(query): RawQuery,
	ws: WebSocketUpgrade,
) -> Response {
	upgrade(app, headers, query, None, ws).await
}

/// `GET /ws/chat/{room_id}` — upgrade with the initial presence record
/// bound to the path room.
pub async fn chat_ws_room(
	Path(room_id): Path<i64>,
	State(app): State<AppState>,
	headers: HeaderMap,
	RawQuery(query): RawQuery,
	ws: WebSocketUpgrade,
) -> Response {
	let path_room = match RoomId::new(room_id) {
		Ok(room) => Some(room),
		Err(e) => {
			debug!(error = %e, room_id, "ignoring malformed room id in connection path");
			None
		}
	};

	upgrade(app, headers, query, path_room, ws).await
}

async fn upgrade(
	app: AppState,
	headers: HeaderMap,
	query: Option<String>,
	path_room: Option<RoomId>,
	ws: WebSocketUpgrade,
) -> Response {
	let conn_id = ConnectionId::generate();
	metrics::counter!("roomcast_server_connections_total").increment(1);

	let admitted = admission::admit(&app.validator, &app.settings, &headers, query.as_deref()).await;

	ws.on_upgrade(move |socket| run_session(app, socket, conn_id, admitted, path_room))
}

async fn run_session(
	app: AppState,
	socket: WebSocket,
	conn_id: ConnectionId,
	admitted: AdmittedConnection,
	path_room: Option<RoomId>,
) {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("roomcast_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("roomcast_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (sink, stream) = socket.split();

	let (out_tx, out_rx) = mpsc::channel::<Outbound>(app.settings.outbound_channel_capacity);
	let writer_task = tokio::spawn(write_outbound(conn_id, sink, out_rx));

	// The admission pipeline resolved the identity already; anonymous
	// connections are accepted only far enough to deliver the close code.
	let Identity::User(user) = admitted.identity else {
		warn!(%conn_id, "unauthorized: missing/invalid credential");
		metrics::counter!("roomcast_server_unauthorized_connections_total").increment(1);

		let _ = out_tx
			.send(Outbound::Close {
				code: CLOSE_UNAUTHORIZED,
				reason: "unauthorized",
			})
			.await;
		drop(out_tx);
		let _ = writer_task.await;
		return;
	};

	info!(%conn_id, user_id = %user.id, username = %user.username, "session established");

	let (fan_in_tx, fan_in_rx) = mpsc::channel::<BusEvent>(app.settings.fan_in_channel_capacity);

	let mut session = Session::new(app, conn_id, user, out_tx, fan_in_tx);
	session.register_initial_presence(path_room).await;

	let mut limiter = admitted.limiter;
	read_loop(&mut session, stream, fan_in_rx, &mut limiter).await;

	// Unconditional: runs for client closes, transport failures and
	// rate-limiter terminations alike.
	session.shutdown().await;
	drop(session);
	let _ = writer_task.await;
}

async fn read_loop(
	session: &mut Session,
	mut stream: SplitStream<WebSocket>,
	mut fan_in_rx: mpsc::Receiver<BusEvent>,
	limiter: &mut SlidingWindow,
) {
	loop {
		tokio::select! {
			inbound = stream.next() => {
				let msg = match inbound {
					Some(Ok(msg)) => msg,
					Some(Err(e)) => {
						debug!(conn_id = %session.conn_id, error = %e, "transport read failed");
						return;
					}
					None => return,
				};

				match msg {
					Message::Text(text) => {
						if !admit_event(session, limiter).await {
							return;
						}
						session.handle_frame(text.as_str()).await;
					}
					Message::Binary(_) => {
						// Counted against the window but carries no action.
						if !admit_event(session, limiter).await {
							return;
						}
					}
					Message::Ping(_) | Message::Pong(_) => {}
					Message::Close(_) => return,
				}
			}
			bus_event = fan_in_rx.recv() => {
				// The session holds a sender clone, so the channel cannot
				// close while this loop runs.
				if let Some(event) = bus_event {
					session.deliver(event).await;
				}
			}
		}
	}
}

/// Rate-limit gate for one inbound transport event. On refusal the
/// connection is closed with the policy-violation code and the caller stops
/// processing; only disconnect cleanup remains.
async fn admit_event(session: &Session, limiter: &mut SlidingWindow) -> bool {
	if limiter.allow() {
		return true;
	}

	warn!(conn_id = %session.conn_id, user_id = %session.user.id, "rate window exceeded; closing connection");
	metrics::counter!("roomcast_server_rate_limited_connections_total").increment(1);

	session.force_close(CLOSE_POLICY_VIOLATION, "policy violation").await;
	false
}

async fn write_outbound(conn_id: ConnectionId, mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
	while let Some(item) = rx.recv().await {
		match item {
			Outbound::Event(event) => {
				let text = match serde_json::to_string(&event) {
					Ok(text) => text,
					Err(e) => {
						error!(%conn_id, error = %e, "failed to encode outbound event");
						continue;
					}
				};

				metrics::counter!("roomcast_server_events_out_total").increment(1);
				if sink.send(Message::Text(text.into())).await.is_err() {
					break;
				}
			}
			Outbound::Close { code, reason } => {
				let _ = sink
					.send(Message::Close(Some(CloseFrame {
						code,
						reason: reason.into(),
					})))
					.await;
				break;
			}
		}
	}
}

/// Server-side state for one authenticated connection.
///
/// Inbound client events are processed strictly in arrival order; bus
/// deliveries interleave between them. All cross-session effects go through
/// the bus, the store and the key-value store.
pub struct Session {
	app: AppState,
	conn_id: ConnectionId,
	user: User,
	out: mpsc::Sender<Outbound>,
	fan_in_tx: mpsc::Sender<BusEvent>,
	joined: HashSet<RoomId>,
	closed: bool,
}

impl Session {
	fn new(
		app: AppState,
		conn_id: ConnectionId,
		user: User,
		out: mpsc::Sender<Outbound>,
		fan_in_tx: mpsc::Sender<BusEvent>,
	) -> Self {
		Self {
			app,
			conn_id,
			user,
			out,
			fan_in_tx,
			joined: HashSet::new(),
			closed: false,
		}
	}

	async fn register_initial_presence(&self, path_room: Option<RoomId>) {
		self.app.presence.mark_online(self.conn_id, self.user.id, path_room).await;
	}

	async fn send_event(&self, event: ServerEvent) {
		let _ = self.out.send(Outbound::Event(event)).await;
	}

	async fn send_error(&self, detail: ErrorDetail) {
		metrics::counter!("roomcast_server_session_errors_total", "detail" => detail.as_str()).increment(1);
		self.send_event(ServerEvent::error(detail)).await;
	}

	async fn force_close(&self, code: u16, reason: &'static str) {
		let _ = self.out.send(Outbound::Close { code, reason }).await;
	}

	async fn handle_frame(&mut self, text: &str) {
		metrics::counter!("roomcast_server_actions_in_total").increment(1);
		let action = parse_client_action(text);
		self.handle_action(action).await;
	}

	async fn handle_action(&mut self, action: ClientAction) {
		match action {
			ClientAction::Join { room_id } => self.handle_join(room_id).await,
			ClientAction::Leave { room_id } => self.handle_leave(room_id).await,
			ClientAction::SendMessage {
				room_id,
				content,
				temp_id,
			} => self.handle_send_message(room_id, content, temp_id).await,
			ClientAction::Typing { room_id, is_typing } => self.handle_typing(room_id, is_typing).await,
			ClientAction::Unknown => self.send_error(ErrorDetail::UnknownAction).await,
		}
	}

	/// Membership check against the store. Fails closed: an unreachable
	/// store denies rather than letting an unverified session into a room.
	async fn is_participant(&self, room: RoomId) -> bool {
		match self.app.store.is_active_participant(room, self.user.id).await {
			Ok(is_participant) => is_participant,
			Err(e) => {
				warn!(conn_id = %self.conn_id, %room, error = %e, "membership check failed; denying");
				metrics::counter!("roomcast_server_membership_check_failures_total").increment(1);
				false
			}
		}
	}

	async fn handle_join(&mut self, room_id: Option<RoomId>) {
		let Some(room) = room_id else {
			return self.send_error(ErrorDetail::RoomIdRequired).await;
		};

		if !self.is_participant(room).await {
			return self.send_error(ErrorDetail::NotAParticipant).await;
		}

		if self.joined.insert(room) {
			self.app
				.bus
				.subscribe(
					room,
					SessionHandle {
						conn: self.conn_id,
						tx: self.fan_in_tx.clone(),
					},
				)
				.await;
		}

		self.app.presence.mark_online(self.conn_id, self.user.id, Some(room)).await;

		debug!(conn_id = %self.conn_id, %room, "joined room");
		self.send_event(ServerEvent::Joined { room_id: room }).await;
	}

	/// Leaving is idempotent: a room never joined still gets the ack.
	async fn handle_leave(&mut self, room_id: Option<RoomId>) {
		if let Some(room) = room_id
			&& self.joined.remove(&room)
		{
			self.app.bus.unsubscribe(room, self.conn_id).await;
			self.app.presence.clear_room(self.conn_id, room).await;
			debug!(conn_id = %self.conn_id, %room, "left room");
		}

		self.send_event(ServerEvent::Left { room_id }).await;
	}

	async fn handle_send_message(&mut self, room_id: Option<RoomId>, content: String, temp_id: Option<Value>) {
		let Some(room) = room_id else {
			return self.send_error(ErrorDetail::RoomIdRequired).await;
		};

		let content = content.trim();
		if content.is_empty() {
			return self.send_error(ErrorDetail::EmptyContent).await;
		}

		// Re-checked per message; membership can be revoked while the
		// session is connected.
		if !self.is_participant(room).await {
			return self.send_error(ErrorDetail::NotAParticipant).await;
		}

		let message = match self.app.store.create_message(room, self.user.id, content).await {
			Ok(message) => message,
			Err(e) => {
				// Durability failed, so nothing is broadcast and no version
				// is bumped; the sender learns explicitly.
				error!(conn_id = %self.conn_id, %room, error = %e, "message persist failed");
				metrics::counter!("roomcast_server_message_persist_failures_total").increment(1);
				return self.send_error(ErrorDetail::MessageNotPersisted).await;
			}
		};

		metrics::counter!("roomcast_server_messages_total").increment(1);

		let payload = roomcast_protocol::MessagePayload::from(message);

		// Direct ack to the sender, bound to its temp_id for optimistic
		// local echo.
		self.send_event(ServerEvent::MessageCreated {
			message: payload.clone(),
			temp_id,
		})
		.await;

		// Version bump sits after the durable write and before the publish,
		// so a re-read triggered by the broadcast observes the new version.
		if let Err(e) = self.app.cache.bump_version(room).await {
			warn!(conn_id = %self.conn_id, %room, error = %e, "cache version bump failed");
			metrics::counter!("roomcast_server_cache_bump_failures_total").increment(1);
		}

		self.app
			.bus
			.publish(
				room,
				BusEvent::MessageCreated {
					message: payload,
					origin: self.conn_id,
				},
			)
			.await;
	}

	/// Ephemeral: no persistence, no version bump, no ack. Non-participants
	/// with a room id are ignored silently.
	async fn handle_typing(&mut self, room_id: Option<RoomId>, is_typing: bool) {
		let Some(room) = room_id else {
			return self.send_error(ErrorDetail::RoomIdRequired).await;
		};

		if !self.is_participant(room).await {
			return;
		}

		self.app
			.bus
			.publish(
				room,
				BusEvent::Typing {
					room_id: room,
					user_id: self.user.id,
					is_typing,
				},
			)
			.await;
	}

	/// Forward one bus event to the transport.
	async fn deliver(&self, event: BusEvent) {
		match event {
			BusEvent::MessageCreated { message, origin } => {
				if origin == self.conn_id {
					// The sender already observed the message via its ack.
					return;
				}

				metrics::counter!("roomcast_server_broadcasts_delivered_total").increment(1);
				self.send_event(ServerEvent::MessageCreated { message, temp_id: None }).await;
			}
			BusEvent::Typing {
				room_id,
				user_id,
				is_typing,
			} => {
				self.send_event(ServerEvent::Typing {
					room_id,
					user_id,
					is_typing,
				})
				.await;
			}
			BusEvent::Lagged { dropped } => {
				warn!(conn_id = %self.conn_id, dropped, "session lagged; broadcasts were dropped");
				metrics::counter!("roomcast_server_session_lagged_events_total").increment(dropped);
			}
		}
	}

	/// Disconnect cleanup. Must run exactly once for every session however
	/// it ended, and must not assume any room was ever joined.
	async fn shutdown(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;

		let rooms: Vec<RoomId> = self.joined.drain().collect();
		for room in rooms {
			self.app.bus.unsubscribe(room, self.conn_id).await;
		}

		self.app.presence.mark_offline(self.conn_id).await;
		debug!(conn_id = %self.conn_id, "session closed");
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;

	/// A session wired to in-memory collaborators, with both queues exposed
	/// the way the transport tasks would see them.
	pub(crate) struct SessionUnderTest {
		pub session: Session,
		/// Events the writer task would have serialized to the socket.
		pub events: mpsc::Receiver<ServerEvent>,
		/// The bus fan-in queue; drain it through `deliver` to simulate the
		/// select loop's broadcast arm.
		pub fan_in: mpsc::Receiver<BusEvent>,
	}

	pub(crate) fn session_for_test(app: AppState, user: User) -> SessionUnderTest {
		let conn_id = ConnectionId::generate();
		let (out_tx, mut raw_out_rx) = mpsc::channel::<Outbound>(64);
		let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(64);

		tokio::spawn(async move {
			while let Some(item) = raw_out_rx.recv().await {
				if let Outbound::Event(event) = item
					&& event_tx.send(event).await.is_err()
				{
					break;
				}
			}
		});

		let (fan_in_tx, fan_in_rx) = mpsc::channel::<BusEvent>(64);
		let session = Session::new(app, conn_id, user, out_tx, fan_in_tx);

		SessionUnderTest {
			session,
			events: event_rx,
			fan_in: fan_in_rx,
		}
	}

	impl Session {
		pub(crate) async fn test_handle_action(&mut self, action: ClientAction) {
			self.handle_action(action).await;
		}

		pub(crate) async fn test_deliver(&self, event: BusEvent) {
			self.deliver(event).await;
		}

		pub(crate) async fn test_shutdown(&mut self) {
			self.shutdown().await;
		}

		pub(crate) async fn test_register_initial_presence(&self, room: Option<RoomId>) {
			self.register_initial_presence(room).await;
		}

		pub(crate) fn connection_id(&self) -> ConnectionId {
			self.conn_id
		}
	}
}
