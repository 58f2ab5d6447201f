#![forbid(unsafe_code)]

use crate::server::store::{ChatStore, MemoryStore};

#[tokio::test]
async fn create_room_inserts_the_owner_as_participant() {
	let store = MemoryStore::new();
	let owner = store.create_user("alice").await.expect("create user");

	let room = store.create_room(Some("lobby"), true, owner.id).await.expect("create room");

	assert_eq!(room.owner_id, owner.id);
	assert!(
		store.is_active_participant(room.id, owner.id).await.expect("check"),
		"a room must never exist without its creator"
	);
}

#[tokio::test]
async fn active_user_filters_deactivated_accounts() {
	let store = MemoryStore::new();
	let user = store.create_user("bob").await.expect("create user");

	assert!(store.active_user(user.id).await.expect("lookup").is_some());

	store.set_user_active(user.id, false).await;
	assert!(store.active_user(user.id).await.expect("lookup").is_none());
}

#[tokio::test]
async fn rejoin_reactivates_and_preserves_the_original_join_timestamp() {
	let store = MemoryStore::new();
	let owner = store.create_user("alice").await.expect("create user");
	let member = store.create_user("bob").await.expect("create user");
	let room = store.create_room(None, false, owner.id).await.expect("create room");

	let first = store.add_participant(room.id, member.id).await.expect("join");

	assert!(store.deactivate_participant(room.id, member.id).await.expect("deactivate"));
	assert!(!store.is_active_participant(room.id, member.id).await.expect("check"));

	// Deactivating twice affects nothing.
	assert!(!store.deactivate_participant(room.id, member.id).await.expect("deactivate"));

	let rejoined = store.add_participant(room.id, member.id).await.expect("rejoin");
	assert!(rejoined.is_active);
	assert_eq!(
		rejoined.joined_at_unix_ms, first.joined_at_unix_ms,
		"rejoin must reuse the original row"
	);
}

#[tokio::test]
async fn messages_list_oldest_first_with_pagination() {
	let store = MemoryStore::new();
	let owner = store.create_user("alice").await.expect("create user");
	let room = store.create_room(Some("lobby"), true, owner.id).await.expect("create room");

	for i in 0..5 {
		store
			.create_message(room.id, owner.id, &format!("m-{i}"))
			.await
			.expect("create message");
	}

	let page = store.list_messages(room.id, 2, 0).await.expect("list");
	assert_eq!(page.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), ["m-0", "m-1"]);

	let rest = store.list_messages(room.id, 10, 2).await.expect("list");
	assert_eq!(
		rest.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
		["m-2", "m-3", "m-4"]
	);
}

#[tokio::test]
async fn deleting_a_room_cascades_to_messages_and_participants() {
	let store = MemoryStore::new();
	let owner = store.create_user("alice").await.expect("create user");
	let room = store.create_room(Some("lobby"), true, owner.id).await.expect("create room");
	store.create_message(room.id, owner.id, "hello").await.expect("create message");

	store.delete_room(room.id).await.expect("delete");

	assert!(store.room(room.id).await.expect("lookup").is_none());
	assert!(store.list_messages(room.id, 10, 0).await.expect("list").is_empty());
	assert!(!store.is_active_participant(room.id, owner.id).await.expect("check"));
}

#[tokio::test]
async fn operations_fail_while_the_store_is_unavailable() {
	let store = MemoryStore::new();
	let owner = store.create_user("alice").await.expect("create user");
	let room = store.create_room(None, false, owner.id).await.expect("create room");

	store.set_available(false).await;

	assert!(store.active_user(owner.id).await.is_err());
	assert!(store.is_active_participant(room.id, owner.id).await.is_err());
	assert!(store.create_message(room.id, owner.id, "x").await.is_err());
	assert!(store.list_messages(room.id, 10, 0).await.is_err());

	store.set_available(true).await;
	assert!(store.active_user(owner.id).await.is_ok());
}

#[tokio::test]
async fn touch_last_seen_records_a_timestamp() {
	let store = MemoryStore::new();
	let user = store.create_user("alice").await.expect("create user");

	assert!(store.last_seen(user.id).await.is_none());
	store.touch_last_seen(user.id).await.expect("touch");
	assert!(store.last_seen(user.id).await.is_some());
}
