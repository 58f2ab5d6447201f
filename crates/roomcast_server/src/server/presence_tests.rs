#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use roomcast_domain::{ConnectionId, RoomId, UserId};

use crate::server::presence::{PresenceHook, PresenceTracker};

fn room(id: i64) -> RoomId {
	RoomId::new(id).expect("valid RoomId")
}

fn user(id: i64) -> UserId {
	UserId::new(id).expect("valid UserId")
}

#[tokio::test]
async fn online_users_returns_distinct_ids() {
	let tracker = PresenceTracker::new();
	let room_a = room(1);

	// Two tabs for user 1 plus one connection for user 2.
	tracker.mark_online(ConnectionId::generate(), user(1), Some(room_a)).await;
	tracker.mark_online(ConnectionId::generate(), user(1), Some(room_a)).await;
	tracker.mark_online(ConnectionId::generate(), user(2), Some(room_a)).await;

	let online = tracker.online_users(room_a).await;
	assert_eq!(online.len(), 2);
	assert!(online.contains(&user(1)));
	assert!(online.contains(&user(2)));
}

#[tokio::test]
async fn user_stays_online_while_one_connection_remains() {
	let tracker = PresenceTracker::new();
	let room_a = room(1);

	let tab_one = ConnectionId::generate();
	let tab_two = ConnectionId::generate();
	tracker.mark_online(tab_one, user(1), Some(room_a)).await;
	tracker.mark_online(tab_two, user(1), Some(room_a)).await;

	tracker.mark_offline(tab_one).await;
	assert!(tracker.online_users(room_a).await.contains(&user(1)));

	tracker.mark_offline(tab_two).await;
	assert!(tracker.online_users(room_a).await.is_empty());
}

#[tokio::test]
async fn mark_offline_removes_every_record_for_the_connection() {
	let tracker = PresenceTracker::new();
	let conn = ConnectionId::generate();

	tracker.mark_online(conn, user(1), Some(room(1))).await;
	tracker.mark_online(conn, user(1), Some(room(2))).await;
	assert_eq!(tracker.record_count(conn).await, 2);

	tracker.mark_offline(conn).await;
	assert_eq!(tracker.record_count(conn).await, 0);
	assert!(tracker.online_users(room(1)).await.is_empty());
	assert!(tracker.online_users(room(2)).await.is_empty());
}

#[tokio::test]
async fn clear_room_removes_only_that_room() {
	let tracker = PresenceTracker::new();
	let conn = ConnectionId::generate();

	tracker.mark_online(conn, user(1), Some(room(1))).await;
	tracker.mark_online(conn, user(1), Some(room(2))).await;

	tracker.clear_room(conn, room(1)).await;

	assert!(tracker.online_users(room(1)).await.is_empty());
	assert!(tracker.online_users(room(2)).await.contains(&user(1)));
}

#[tokio::test]
async fn connect_without_a_room_counts_nowhere() {
	let tracker = PresenceTracker::new();
	let conn = ConnectionId::generate();

	tracker.mark_online(conn, user(1), None).await;

	assert_eq!(tracker.record_count(conn).await, 1);
	assert!(tracker.online_users(room(1)).await.is_empty());
}

#[tokio::test]
async fn mark_offline_is_idempotent() {
	let tracker = PresenceTracker::new();
	let conn = ConnectionId::generate();

	tracker.mark_online(conn, user(1), Some(room(1))).await;
	tracker.mark_offline(conn).await;
	tracker.mark_offline(conn).await;

	assert_eq!(tracker.record_count(conn).await, 0);
}

struct CountingHook {
	calls: AtomicUsize,
}

#[async_trait]
impl PresenceHook for CountingHook {
	async fn user_seen(&self, _user: UserId) {
		self.calls.fetch_add(1, Ordering::SeqCst);
	}
}

#[tokio::test]
async fn every_presence_write_invokes_the_hook() {
	let hook = Arc::new(CountingHook {
		calls: AtomicUsize::new(0),
	});
	let tracker = PresenceTracker::with_hook(Arc::clone(&hook) as Arc<dyn PresenceHook>);

	let conn = ConnectionId::generate();
	tracker.mark_online(conn, user(1), None).await;
	tracker.mark_online(conn, user(1), Some(room(1))).await;
	tracker.mark_offline(conn).await;

	// Two writes, no hook call on removal.
	assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
}
