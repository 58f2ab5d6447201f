#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use roomcast_domain::{Participant, Room, RoomId, StoredMessage, User, UserId};
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// The durable relational collaborator, reduced to the create/query
/// operations the realtime core needs.
///
/// Membership is always re-queried here rather than trusted from session
/// state; an administrative action can revoke it between two messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
	async fn create_user(&self, username: &str) -> anyhow::Result<User>;

	/// Look up a user only if the account is active.
	async fn active_user(&self, user: UserId) -> anyhow::Result<Option<User>>;

	async fn touch_last_seen(&self, user: UserId) -> anyhow::Result<()>;

	/// Create a room owned by `owner`. The owner's participant row is
	/// written in the same transaction; a room never exists without its
	/// creator.
	async fn create_room(&self, name: Option<&str>, is_group: bool, owner: UserId) -> anyhow::Result<Room>;

	async fn room(&self, room: RoomId) -> anyhow::Result<Option<Room>>;

	/// Delete a room; its participants and messages cascade.
	async fn delete_room(&self, room: RoomId) -> anyhow::Result<()>;

	/// Add or reactivate a participant. A rejoin reuses the original row,
	/// so `joined_at_unix_ms` is preserved across deactivate/rejoin cycles.
	async fn add_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<Participant>;

	/// Returns whether a row was deactivated.
	async fn deactivate_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<bool>;

	async fn is_active_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<bool>;

	async fn create_message(&self, room: RoomId, sender: UserId, content: &str) -> anyhow::Result<StoredMessage>;

	/// Messages for a room, oldest first.
	async fn list_messages(&self, room: RoomId, limit: u32, offset: u32) -> anyhow::Result<Vec<StoredMessage>>;
}

/// SQL-backed store; the backend is chosen by the database URL prefix.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

fn user_from_row(row: (i64, String, bool)) -> anyhow::Result<User> {
	Ok(User {
		id: UserId::new(row.0).context("user id from store")?,
		username: row.1,
		is_active: row.2,
	})
}

fn room_from_row(row: (i64, Option<String>, bool, i64, i64, i64)) -> anyhow::Result<Room> {
	Ok(Room {
		id: RoomId::new(row.0).context("room id from store")?,
		name: row.1,
		is_group: row.2,
		owner_id: UserId::new(row.3).context("owner id from store")?,
		created_at_unix_ms: row.4,
		updated_at_unix_ms: row.5,
	})
}

fn participant_from_row(row: (i64, i64, i64, bool)) -> anyhow::Result<Participant> {
	Ok(Participant {
		room_id: RoomId::new(row.0).context("room id from store")?,
		user_id: UserId::new(row.1).context("user id from store")?,
		joined_at_unix_ms: row.2,
		is_active: row.3,
	})
}

fn message_from_row(row: (i64, i64, i64, String, i64)) -> anyhow::Result<StoredMessage> {
	Ok(StoredMessage {
		id: row.0,
		room_id: RoomId::new(row.1).context("room id from store")?,
		sender_id: UserId::new(row.2).context("sender id from store")?,
		content: row.3,
		created_at_unix_ms: row.4,
	})
}

#[async_trait]
impl ChatStore for SqlStore {
	async fn create_user(&self, username: &str) -> anyhow::Result<User> {
		let row: (i64, String, bool) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("INSERT INTO users (username, is_active) VALUES (?, 1) RETURNING id, username, is_active")
					.bind(username)
					.fetch_one(pool)
					.await
					.context("insert user (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("INSERT INTO users (username, is_active) VALUES ($1, TRUE) RETURNING id, username, is_active")
					.bind(username)
					.fetch_one(pool)
					.await
					.context("insert user (postgres)")?
			}
		};

		user_from_row(row)
	}

	async fn active_user(&self, user: UserId) -> anyhow::Result<Option<User>> {
		let row: Option<(i64, String, bool)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT id, username, is_active FROM users WHERE id = ? AND is_active = 1")
					.bind(user.as_i64())
					.fetch_optional(pool)
					.await
					.context("select active user (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT id, username, is_active FROM users WHERE id = $1 AND is_active = TRUE")
					.bind(user.as_i64())
					.fetch_optional(pool)
					.await
					.context("select active user (postgres)")?
			}
		};

		row.map(user_from_row).transpose()
	}

	async fn touch_last_seen(&self, user: UserId) -> anyhow::Result<()> {
		let now = unix_ms_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE users SET last_seen_unix_ms = ? WHERE id = ?")
					.bind(now)
					.bind(user.as_i64())
					.execute(pool)
					.await
					.context("touch last seen (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE users SET last_seen_unix_ms = $1 WHERE id = $2")
					.bind(now)
					.bind(user.as_i64())
					.execute(pool)
					.await
					.context("touch last seen (postgres)")?;
			}
		}

		Ok(())
	}

	async fn create_room(&self, name: Option<&str>, is_group: bool, owner: UserId) -> anyhow::Result<Room> {
		let now = unix_ms_now();

		let row: (i64, Option<String>, bool, i64, i64, i64) = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;

				let row: (i64, Option<String>, bool, i64, i64, i64) = sqlx::query_as(
					"INSERT INTO chat_rooms (name, is_group, owner_id, created_at_unix_ms, updated_at_unix_ms) \
					VALUES (?, ?, ?, ?, ?) \
					RETURNING id, name, is_group, owner_id, created_at_unix_ms, updated_at_unix_ms",
				)
				.bind(name)
				.bind(is_group)
				.bind(owner.as_i64())
				.bind(now)
				.bind(now)
				.fetch_one(&mut *tx)
				.await
				.context("insert room (sqlite)")?;

				sqlx::query(
					"INSERT INTO chat_participants (room_id, user_id, joined_at_unix_ms, is_active) VALUES (?, ?, ?, 1)",
				)
				.bind(row.0)
				.bind(owner.as_i64())
				.bind(now)
				.execute(&mut *tx)
				.await
				.context("insert owner participant (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				row
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;

				let row: (i64, Option<String>, bool, i64, i64, i64) = sqlx::query_as(
					"INSERT INTO chat_rooms (name, is_group, owner_id, created_at_unix_ms, updated_at_unix_ms) \
					VALUES ($1, $2, $3, $4, $5) \
					RETURNING id, name, is_group, owner_id, created_at_unix_ms, updated_at_unix_ms",
				)
				.bind(name)
				.bind(is_group)
				.bind(owner.as_i64())
				.bind(now)
				.bind(now)
				.fetch_one(&mut *tx)
				.await
				.context("insert room (postgres)")?;

				sqlx::query(
					"INSERT INTO chat_participants (room_id, user_id, joined_at_unix_ms, is_active) \
					VALUES ($1, $2, $3, TRUE)",
				)
				.bind(row.0)
				.bind(owner.as_i64())
				.bind(now)
				.execute(&mut *tx)
				.await
				.context("insert owner participant (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				row
			}
		};

		room_from_row(row)
	}

	async fn room(&self, room: RoomId) -> anyhow::Result<Option<Room>> {
		let row: Option<(i64, Option<String>, bool, i64, i64, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, name, is_group, owner_id, created_at_unix_ms, updated_at_unix_ms \
				FROM chat_rooms WHERE id = ?",
			)
			.bind(room.as_i64())
			.fetch_optional(pool)
			.await
			.context("select room (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, name, is_group, owner_id, created_at_unix_ms, updated_at_unix_ms \
				FROM chat_rooms WHERE id = $1",
			)
			.bind(room.as_i64())
			.fetch_optional(pool)
			.await
			.context("select room (postgres)")?,
		};

		row.map(room_from_row).transpose()
	}

	async fn delete_room(&self, room: RoomId) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM chat_rooms WHERE id = ?")
					.bind(room.as_i64())
					.execute(pool)
					.await
					.context("delete room (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM chat_rooms WHERE id = $1")
					.bind(room.as_i64())
					.execute(pool)
					.await
					.context("delete room (postgres)")?;
			}
		}

		Ok(())
	}

	async fn add_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<Participant> {
		let now = unix_ms_now();

		let row: (i64, i64, i64, bool) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO chat_participants (room_id, user_id, joined_at_unix_ms, is_active) \
				VALUES (?, ?, ?, 1) \
				ON CONFLICT (room_id, user_id) DO UPDATE SET is_active = 1 \
				RETURNING room_id, user_id, joined_at_unix_ms, is_active",
			)
			.bind(room.as_i64())
			.bind(user.as_i64())
			.bind(now)
			.fetch_one(pool)
			.await
			.context("upsert participant (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"INSERT INTO chat_participants (room_id, user_id, joined_at_unix_ms, is_active) \
				VALUES ($1, $2, $3, TRUE) \
				ON CONFLICT (room_id, user_id) DO UPDATE SET is_active = TRUE \
				RETURNING room_id, user_id, joined_at_unix_ms, is_active",
			)
			.bind(room.as_i64())
			.bind(user.as_i64())
			.bind(now)
			.fetch_one(pool)
			.await
			.context("upsert participant (postgres)")?,
		};

		participant_from_row(row)
	}

	async fn deactivate_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE chat_participants SET is_active = 0 WHERE room_id = ? AND user_id = ? AND is_active = 1")
					.bind(room.as_i64())
					.bind(user.as_i64())
					.execute(pool)
					.await
					.context("deactivate participant (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"UPDATE chat_participants SET is_active = FALSE \
					WHERE room_id = $1 AND user_id = $2 AND is_active = TRUE",
				)
				.bind(room.as_i64())
				.bind(user.as_i64())
				.execute(pool)
				.await
				.context("deactivate participant (postgres)")?
				.rows_affected()
			}
		};

		Ok(affected > 0)
	}

	async fn is_active_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<bool> {
		let row: Option<(i32,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT 1 FROM chat_participants WHERE room_id = ? AND user_id = ? AND is_active = 1")
					.bind(room.as_i64())
					.bind(user.as_i64())
					.fetch_optional(pool)
					.await
					.context("select participant (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT 1 FROM chat_participants WHERE room_id = $1 AND user_id = $2 AND is_active = TRUE")
					.bind(room.as_i64())
					.bind(user.as_i64())
					.fetch_optional(pool)
					.await
					.context("select participant (postgres)")?
			}
		};

		Ok(row.is_some())
	}

	async fn create_message(&self, room: RoomId, sender: UserId, content: &str) -> anyhow::Result<StoredMessage> {
		let now = unix_ms_now();

		let row: (i64, i64, i64, String, i64) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO messages (room_id, sender_id, content, created_at_unix_ms) \
				VALUES (?, ?, ?, ?) \
				RETURNING id, room_id, sender_id, content, created_at_unix_ms",
			)
			.bind(room.as_i64())
			.bind(sender.as_i64())
			.bind(content)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert message (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"INSERT INTO messages (room_id, sender_id, content, created_at_unix_ms) \
				VALUES ($1, $2, $3, $4) \
				RETURNING id, room_id, sender_id, content, created_at_unix_ms",
			)
			.bind(room.as_i64())
			.bind(sender.as_i64())
			.bind(content)
			.bind(now)
			.fetch_one(pool)
			.await
			.context("insert message (postgres)")?,
		};

		message_from_row(row)
	}

	async fn list_messages(&self, room: RoomId, limit: u32, offset: u32) -> anyhow::Result<Vec<StoredMessage>> {
		let rows: Vec<(i64, i64, i64, String, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, room_id, sender_id, content, created_at_unix_ms FROM messages \
				WHERE room_id = ? ORDER BY created_at_unix_ms ASC, id ASC LIMIT ? OFFSET ?",
			)
			.bind(room.as_i64())
			.bind(i64::from(limit))
			.bind(i64::from(offset))
			.fetch_all(pool)
			.await
			.context("list messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, room_id, sender_id, content, created_at_unix_ms FROM messages \
				WHERE room_id = $1 ORDER BY created_at_unix_ms ASC, id ASC LIMIT $2 OFFSET $3",
			)
			.bind(room.as_i64())
			.bind(i64::from(limit))
			.bind(i64::from(offset))
			.fetch_all(pool)
			.await
			.context("list messages (postgres)")?,
		};

		rows.into_iter().map(message_from_row).collect()
	}
}

/// In-process store for single-node dev deployments and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
	inner: Arc<Mutex<MemInner>>,
}

struct MemInner {
	available: bool,
	writes_available: bool,
	next_user_id: i64,
	next_room_id: i64,
	next_message_id: i64,
	users: HashMap<i64, User>,
	last_seen: HashMap<i64, i64>,
	rooms: HashMap<i64, Room>,
	participants: Vec<Participant>,
	messages: Vec<StoredMessage>,
}

impl Default for MemInner {
	fn default() -> Self {
		Self {
			available: true,
			writes_available: true,
			next_user_id: 1,
			next_room_id: 1,
			next_message_id: 1,
			users: HashMap::new(),
			last_seen: HashMap::new(),
			rooms: HashMap::new(),
			participants: Vec::new(),
			messages: Vec::new(),
		}
	}
}

impl MemInner {
	fn ensure_available(&self) -> anyhow::Result<()> {
		if self.available {
			Ok(())
		} else {
			Err(anyhow!("store unavailable"))
		}
	}

	fn ensure_writable(&self) -> anyhow::Result<()> {
		self.ensure_available()?;
		if self.writes_available {
			Ok(())
		} else {
			Err(anyhow!("store rejects writes"))
		}
	}
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Flip availability; every operation fails while unavailable. Lets
	/// tests exercise the transient-store-failure paths.
	pub async fn set_available(&self, available: bool) {
		self.inner.lock().await.available = available;
	}

	/// Fail writes only, keeping reads (membership checks) working. Lets
	/// tests reach the persist-failure path past the membership gate.
	pub async fn set_writes_available(&self, writes_available: bool) {
		self.inner.lock().await.writes_available = writes_available;
	}

	/// Flip an account's active flag.
	pub async fn set_user_active(&self, user: UserId, is_active: bool) {
		let mut inner = self.inner.lock().await;
		if let Some(u) = inner.users.get_mut(&user.as_i64()) {
			u.is_active = is_active;
		}
	}

	/// Last-seen timestamp written by the presence hook, if any.
	pub async fn last_seen(&self, user: UserId) -> Option<i64> {
		let inner = self.inner.lock().await;
		inner.last_seen.get(&user.as_i64()).copied()
	}
}

#[async_trait]
impl ChatStore for MemoryStore {
	async fn create_user(&self, username: &str) -> anyhow::Result<User> {
		let mut inner = self.inner.lock().await;
		inner.ensure_available()?;

		let id = inner.next_user_id;
		inner.next_user_id += 1;

		let user = User {
			id: UserId::new(id).context("allocate user id")?,
			username: username.to_string(),
			is_active: true,
		};
		inner.users.insert(id, user.clone());
		Ok(user)
	}

	async fn active_user(&self, user: UserId) -> anyhow::Result<Option<User>> {
		let inner = self.inner.lock().await;
		inner.ensure_available()?;

		Ok(inner.users.get(&user.as_i64()).filter(|u| u.is_active).cloned())
	}

	async fn touch_last_seen(&self, user: UserId) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner.ensure_available()?;

		inner.last_seen.insert(user.as_i64(), unix_ms_now());
		Ok(())
	}

	async fn create_room(&self, name: Option<&str>, is_group: bool, owner: UserId) -> anyhow::Result<Room> {
		let mut inner = self.inner.lock().await;
		inner.ensure_available()?;

		let now = unix_ms_now();
		let id = inner.next_room_id;
		inner.next_room_id += 1;

		let room = Room {
			id: RoomId::new(id).context("allocate room id")?,
			name: name.map(str::to_string),
			is_group,
			owner_id: owner,
			created_at_unix_ms: now,
			updated_at_unix_ms: now,
		};
		inner.rooms.insert(id, room.clone());
		inner.participants.push(Participant {
			room_id: room.id,
			user_id: owner,
			joined_at_unix_ms: now,
			is_active: true,
		});
		Ok(room)
	}

	async fn room(&self, room: RoomId) -> anyhow::Result<Option<Room>> {
		let inner = self.inner.lock().await;
		inner.ensure_available()?;

		Ok(inner.rooms.get(&room.as_i64()).cloned())
	}

	async fn delete_room(&self, room: RoomId) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner.ensure_available()?;

		inner.rooms.remove(&room.as_i64());
		inner.participants.retain(|p| p.room_id != room);
		inner.messages.retain(|m| m.room_id != room);
		Ok(())
	}

	async fn add_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<Participant> {
		let mut inner = self.inner.lock().await;
		inner.ensure_available()?;

		if let Some(existing) = inner
			.participants
			.iter_mut()
			.find(|p| p.room_id == room && p.user_id == user)
		{
			existing.is_active = true;
			return Ok(existing.clone());
		}

		let participant = Participant {
			room_id: room,
			user_id: user,
			joined_at_unix_ms: unix_ms_now(),
			is_active: true,
		};
		inner.participants.push(participant.clone());
		Ok(participant)
	}

	async fn deactivate_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<bool> {
		let mut inner = self.inner.lock().await;
		inner.ensure_available()?;

		match inner
			.participants
			.iter_mut()
			.find(|p| p.room_id == room && p.user_id == user && p.is_active)
		{
			Some(p) => {
				p.is_active = false;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	async fn is_active_participant(&self, room: RoomId, user: UserId) -> anyhow::Result<bool> {
		let inner = self.inner.lock().await;
		inner.ensure_available()?;

		Ok(inner
			.participants
			.iter()
			.any(|p| p.room_id == room && p.user_id == user && p.is_active))
	}

	async fn create_message(&self, room: RoomId, sender: UserId, content: &str) -> anyhow::Result<StoredMessage> {
		let mut inner = self.inner.lock().await;
		inner.ensure_writable()?;

		let id = inner.next_message_id;
		inner.next_message_id += 1;

		let message = StoredMessage {
			id,
			room_id: room,
			sender_id: sender,
			content: content.to_string(),
			created_at_unix_ms: unix_ms_now(),
		};
		inner.messages.push(message.clone());
		Ok(message)
	}

	async fn list_messages(&self, room: RoomId, limit: u32, offset: u32) -> anyhow::Result<Vec<StoredMessage>> {
		let inner = self.inner.lock().await;
		inner.ensure_available()?;

		let mut messages: Vec<StoredMessage> = inner.messages.iter().filter(|m| m.room_id == room).cloned().collect();
		messages.sort_by_key(|m| (m.created_at_unix_ms, m.id));

		Ok(messages
			.into_iter()
			.skip(offset as usize)
			.take(limit as usize)
			.collect())
	}
}
