#![forbid(unsafe_code)]

use roomcast_domain::RoomId;
use serde::Deserialize;
use serde_json::Value;

/// One inbound client event.
///
/// The wire form is a JSON object tagged by `action`. Decoding is lenient:
/// hostile or malformed frames never fail, they degrade field by field
/// (a `room_id` that is not a positive JSON integer decodes as absent) or
/// collapse to [`ClientAction::Unknown`] when the frame is not an object
/// with a recognized tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
	Join {
		room_id: Option<RoomId>,
	},
	Leave {
		room_id: Option<RoomId>,
	},
	SendMessage {
		room_id: Option<RoomId>,
		content: String,
		/// Client-chosen correlation id, echoed verbatim on the direct ack.
		temp_id: Option<Value>,
	},
	Typing {
		room_id: Option<RoomId>,
		is_typing: bool,
	},
	Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct RawAction {
	action: Option<Value>,
	room_id: Option<Value>,
	content: Option<Value>,
	temp_id: Option<Value>,
	is_typing: Option<Value>,
}

/// Decode one inbound text frame.
pub fn parse_client_action(text: &str) -> ClientAction {
	let raw: RawAction = match serde_json::from_str(text) {
		Ok(raw) => raw,
		Err(_) => return ClientAction::Unknown,
	};

	let room_id = raw
		.room_id
		.as_ref()
		.and_then(Value::as_i64)
		.and_then(|id| RoomId::new(id).ok());

	match raw.action.as_ref().and_then(Value::as_str) {
		Some("join") => ClientAction::Join { room_id },
		Some("leave") => ClientAction::Leave { room_id },
		Some("send_message") => ClientAction::SendMessage {
			room_id,
			content: raw
				.content
				.as_ref()
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string(),
			temp_id: raw.temp_id,
		},
		Some("typing") => ClientAction::Typing {
			room_id,
			is_typing: raw.is_typing.as_ref().and_then(Value::as_bool).unwrap_or(false),
		},
		_ => ClientAction::Unknown,
	}
}
