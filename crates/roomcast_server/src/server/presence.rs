#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use roomcast_domain::{ConnectionId, RoomId, UserId};
use tokio::sync::Mutex;
use tracing::debug;

/// Hook invoked whenever a presence record is written.
///
/// The server wires this to the store's last-seen touch; tests can observe
/// it directly. An explicit call, not an implicit event dispatch.
#[async_trait]
pub trait PresenceHook: Send + Sync {
	async fn user_seen(&self, user: UserId);
}

/// Tracks which connections are attached to which rooms.
///
/// Records are ephemeral: created on connect/room attach, removed on leave
/// and disconnect. A user with several tabs holds several independent
/// records and counts as online while at least one remains.
#[derive(Clone, Default)]
pub struct PresenceTracker {
	inner: Arc<Mutex<Inner>>,
	hook: Option<Arc<dyn PresenceHook>>,
}

#[derive(Default)]
struct Inner {
	records: HashMap<ConnectionId, HashSet<(UserId, Option<RoomId>)>>,
}

impl PresenceTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_hook(hook: Arc<dyn PresenceHook>) -> Self {
		Self {
			inner: Arc::default(),
			hook: Some(hook),
		}
	}

	/// Upsert a presence record for the connection.
	///
	/// `room` is absent between connect and the first join when the
	/// connection path names no room.
	pub async fn mark_online(&self, conn: ConnectionId, user: UserId, room: Option<RoomId>) {
		{
			let mut inner = self.inner.lock().await;
			inner.records.entry(conn).or_default().insert((user, room));
		}

		debug!(%conn, %user, room = ?room, "presence: online");

		if let Some(hook) = &self.hook {
			hook.user_seen(user).await;
		}
	}

	/// Remove every presence record for the connection.
	pub async fn mark_offline(&self, conn: ConnectionId) {
		let removed = {
			let mut inner = self.inner.lock().await;
			inner.records.remove(&conn)
		};

		if removed.is_some() {
			debug!(%conn, "presence: offline");
		}
	}

	/// Remove the connection's record for one room, keeping the rest.
	pub async fn clear_room(&self, conn: ConnectionId, room: RoomId) {
		let mut inner = self.inner.lock().await;
		if let Some(records) = inner.records.get_mut(&conn) {
			records.retain(|(_, r)| *r != Some(room));
			if records.is_empty() {
				inner.records.remove(&conn);
			}
		}
	}

	/// Distinct user ids with a live record in the room.
	pub async fn online_users(&self, room: RoomId) -> HashSet<UserId> {
		let inner = self.inner.lock().await;
		inner
			.records
			.values()
			.flatten()
			.filter(|record| record.1 == Some(room))
			.map(|record| record.0)
			.collect()
	}

	/// Number of records held for a connection.
	pub async fn record_count(&self, conn: ConnectionId) -> usize {
		let inner = self.inner.lock().await;
		inner.records.get(&conn).map(HashSet::len).unwrap_or(0)
	}
}
