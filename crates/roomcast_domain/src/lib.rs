#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("identifier must be a positive integer: {0}")]
	OutOfRange(i64),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Durable room identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(i64);

impl RoomId {
	/// Create a `RoomId`; room ids are positive integers.
	pub fn new(id: i64) -> Result<Self, ParseIdError> {
		if id <= 0 {
			return Err(ParseIdError::OutOfRange(id));
		}
		Ok(Self(id))
	}

	pub const fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let id: i64 = s.parse().map_err(|_| ParseIdError::InvalidFormat(s.to_string()))?;
		RoomId::new(id)
	}
}

/// Durable user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
	/// Create a `UserId`; user ids are positive integers.
	pub fn new(id: i64) -> Result<Self, ParseIdError> {
		if id <= 0 {
			return Err(ParseIdError::OutOfRange(id));
		}
		Ok(Self(id))
	}

	pub const fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let id: i64 = s.parse().map_err(|_| ParseIdError::InvalidFormat(s.to_string()))?;
		UserId::new(id)
	}
}

/// Opaque handle for one live connection. Ephemeral; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
	/// Generate a fresh connection handle.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A secret value that never leaks through `Debug`/`Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// A registered account as the store reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub id: UserId,
	pub username: String,
	pub is_active: bool,
}

/// The identity a connection resolved to.
///
/// Every failure path of credential validation collapses into `Anonymous`;
/// only a verified token naming an active account yields `User`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
	Anonymous,
	User(User),
}

impl Identity {
	pub fn user(&self) -> Option<&User> {
		match self {
			Identity::User(u) => Some(u),
			Identity::Anonymous => None,
		}
	}

	pub fn is_anonymous(&self) -> bool {
		matches!(self, Identity::Anonymous)
	}
}

/// A chat room record. Group rooms are named; direct rooms may be anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub name: Option<String>,
	pub is_group: bool,
	/// Set at creation and immutable; creator precedence does not depend on
	/// participant rows surviving.
	pub owner_id: UserId,
	pub created_at_unix_ms: i64,
	pub updated_at_unix_ms: i64,
}

/// A user's membership record in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
	pub room_id: RoomId,
	pub user_id: UserId,
	/// Preserved across deactivate/rejoin cycles.
	pub joined_at_unix_ms: i64,
	pub is_active: bool,
}

/// A persisted chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	pub id: i64,
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub content: String,
	pub created_at_unix_ms: i64,
}
