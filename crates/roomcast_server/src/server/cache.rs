#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use roomcast_domain::RoomId;
use tokio::sync::Mutex;

/// Injected key-value capability.
///
/// The room version counters and the identity cache are the only shared
/// mutable resources in the system; both go through this seam so a
/// multi-instance deployment can back it with a shared service while
/// single-process deployments and tests use [`MemoryKvStore`]. `incr` and
/// `compare_and_set` must be atomic with respect to concurrent callers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()>;

	/// Atomic increment; a missing key counts from zero.
	async fn incr(&self, key: &str) -> anyhow::Result<i64>;

	/// Atomic compare-and-set. `expected: None` succeeds only when the key
	/// is absent.
	async fn compare_and_set(
		&self,
		key: &str,
		expected: Option<&str>,
		value: &str,
		ttl: Option<Duration>,
	) -> anyhow::Result<bool>;
}

/// In-process key-value store with lazy TTL expiry.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
	inner: Arc<Mutex<HashMap<String, Entry>>>,
}

#[derive(Debug, Clone)]
struct Entry {
	value: String,
	expires_at: Option<Instant>,
}

impl Entry {
	fn expired(&self, now: Instant) -> bool {
		self.expires_at.is_some_and(|at| now >= at)
	}
}

impl MemoryKvStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
		let now = Instant::now();
		let mut map = self.inner.lock().await;

		match map.get(key) {
			Some(entry) if entry.expired(now) => {
				map.remove(key);
				Ok(None)
			}
			Some(entry) => Ok(Some(entry.value.clone())),
			None => Ok(None),
		}
	}

	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
		let mut map = self.inner.lock().await;
		map.insert(
			key.to_string(),
			Entry {
				value: value.to_string(),
				expires_at: ttl.map(|ttl| Instant::now() + ttl),
			},
		);
		Ok(())
	}

	async fn incr(&self, key: &str) -> anyhow::Result<i64> {
		let now = Instant::now();
		let mut map = self.inner.lock().await;

		let current = match map.get(key) {
			Some(entry) if !entry.expired(now) => entry.value.parse::<i64>().context("incr on non-integer value")?,
			_ => 0,
		};

		let next = current + 1;
		map.insert(
			key.to_string(),
			Entry {
				value: next.to_string(),
				expires_at: None,
			},
		);
		Ok(next)
	}

	async fn compare_and_set(
		&self,
		key: &str,
		expected: Option<&str>,
		value: &str,
		ttl: Option<Duration>,
	) -> anyhow::Result<bool> {
		let now = Instant::now();
		let mut map = self.inner.lock().await;

		let matches = map.get(key).filter(|entry| !entry.expired(now)).map(|entry| entry.value.as_str()) == expected;
		if !matches {
			return Ok(false);
		}

		map.insert(
			key.to_string(),
			Entry {
				value: value.to_string(),
				expires_at: ttl.map(|ttl| Instant::now() + ttl),
			},
		);
		Ok(true)
	}
}

/// Versioned read cache for room message lists.
///
/// Each room carries a monotonically increasing version; cached pages are
/// keyed by `(room, version, page params)` so a bump invalidates every page
/// without deleting anything. Pages expire after a bounded TTL, so a missed
/// invalidation self-heals.
#[derive(Clone)]
pub struct RoomReadCache {
	kv: Arc<dyn KeyValueStore>,
	message_ttl: Duration,
}

fn version_key(room: RoomId) -> String {
	format!("chat:room:{room}:v")
}

impl RoomReadCache {
	pub fn new(kv: Arc<dyn KeyValueStore>, message_ttl: Duration) -> Self {
		Self { kv, message_ttl }
	}

	/// Current version for a room, initializing to 1 on first access.
	///
	/// Initialization races through compare-and-set; losers re-read, so
	/// every concurrent first-access observes the same value.
	pub async fn current_version(&self, room: RoomId) -> anyhow::Result<i64> {
		let key = version_key(room);
		loop {
			if let Some(raw) = self.kv.get(&key).await? {
				return raw.parse::<i64>().context("parse room version");
			}

			if self.kv.compare_and_set(&key, None, "1", None).await? {
				return Ok(1);
			}
		}
	}

	/// Atomically bump the room's version so cached pages are bypassed.
	pub async fn bump_version(&self, room: RoomId) -> anyhow::Result<i64> {
		// Initialize before incrementing so a fresh room bumps 1 -> 2 and a
		// concurrent first read cannot observe a version it then caches
		// against stale data.
		self.current_version(room).await?;
		self.kv.incr(&version_key(room)).await
	}

	fn messages_key(room: RoomId, version: i64, limit: u32, offset: u32) -> String {
		format!("chat:room:{room}:messages:v{version}:limit{limit}:offset{offset}")
	}

	/// Look up the cached page for the room's current version.
	///
	/// Returns `(payload, key, version)`; on a miss the caller fills the
	/// cache under `key` with [`RoomReadCache::store_messages`].
	pub async fn cached_messages(
		&self,
		room: RoomId,
		limit: u32,
		offset: u32,
	) -> anyhow::Result<(Option<String>, String, i64)> {
		let version = self.current_version(room).await?;
		let key = Self::messages_key(room, version, limit, offset);
		let payload = self.kv.get(&key).await?;
		Ok((payload, key, version))
	}

	pub async fn store_messages(&self, key: &str, payload: &str) -> anyhow::Result<()> {
		self.kv.set(key, payload, Some(self.message_ttl)).await
	}
}
