#![forbid(unsafe_code)]

use roomcast_domain::{RoomId, StoredMessage, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of structured error reasons reported to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDetail {
	UnknownAction,
	RoomIdRequired,
	NotAParticipant,
	EmptyContent,
	/// The durable write failed; nothing was broadcast.
	MessageNotPersisted,
}

impl ErrorDetail {
	/// Stable wire string, also used as a metrics label.
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorDetail::UnknownAction => "unknown_action",
			ErrorDetail::RoomIdRequired => "room_id_required",
			ErrorDetail::NotAParticipant => "not_a_participant",
			ErrorDetail::EmptyContent => "empty_content",
			ErrorDetail::MessageNotPersisted => "message_not_persisted",
		}
	}
}

/// Canonical message body shared by the sender ack and the room broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
	pub id: i64,
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub content: String,
	pub created_at_unix_ms: i64,
}

impl From<StoredMessage> for MessagePayload {
	fn from(m: StoredMessage) -> Self {
		Self {
			id: m.id,
			room_id: m.room_id,
			sender_id: m.sender_id,
			content: m.content,
			created_at_unix_ms: m.created_at_unix_ms,
		}
	}
}

/// One outbound server event, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	Joined {
		room_id: RoomId,
	},
	Left {
		/// Echoes whatever the client sent, absent included; leaving is
		/// acknowledged unconditionally.
		room_id: Option<RoomId>,
	},
	MessageCreated {
		message: MessagePayload,
		/// Present only on the direct ack to the sending connection.
		#[serde(skip_serializing_if = "Option::is_none")]
		temp_id: Option<Value>,
	},
	Typing {
		room_id: RoomId,
		user_id: UserId,
		is_typing: bool,
	},
	Error {
		detail: ErrorDetail,
	},
}

impl ServerEvent {
	pub fn error(detail: ErrorDetail) -> Self {
		ServerEvent::Error { detail }
	}
}
