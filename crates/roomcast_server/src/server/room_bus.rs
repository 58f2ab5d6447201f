#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use roomcast_domain::{ConnectionId, RoomId, UserId};
use roomcast_protocol::MessagePayload;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Events delivered through a room's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
	MessageCreated {
		message: MessagePayload,
		/// Connection that produced the message. It already holds the direct
		/// ack, so it drops this broadcast; the same user's other
		/// connections deliver it.
		origin: ConnectionId,
	},
	Typing {
		room_id: RoomId,
		user_id: UserId,
		is_typing: bool,
	},
	/// The subscriber fell behind and events were dropped.
	Lagged {
		dropped: u64,
	},
}

/// Handle a session registers with the bus; events arrive on `tx`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
	pub conn: ConnectionId,
	pub tx: mpsc::Sender<BusEvent>,
}

/// Fan-out seam between sessions, potentially spanning server processes.
///
/// Delivery is at-least-once to every currently subscribed session. Publish
/// order is preserved per publisher; cross-publisher interleaving is
/// unspecified, and there is no ordering across rooms.
#[async_trait]
pub trait RoomBus: Send + Sync {
	async fn subscribe(&self, room: RoomId, handle: SessionHandle);
	async fn unsubscribe(&self, room: RoomId, conn: ConnectionId);
	async fn publish(&self, room: RoomId, event: BusEvent);
}

/// Single-process bus implementation.
#[derive(Clone, Default)]
pub struct MemoryRoomBus {
	inner: Arc<Mutex<Inner>>,
}

impl MemoryRoomBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Snapshot of live subscriber counts per room.
	pub async fn room_subscriber_counts(&self) -> HashMap<RoomId, usize> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.map(|(k, v)| (*k, v.subscribers.iter().filter(|s| !s.tx.is_closed()).count()))
			.collect()
	}
}

#[async_trait]
impl RoomBus for MemoryRoomBus {
	async fn subscribe(&self, room: RoomId, handle: SessionHandle) {
		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(room).or_default();

		prune_closed_subscribers(entry);

		entry.subscribers.retain(|s| s.conn != handle.conn);
		entry.subscribers.push(Subscriber {
			conn: handle.conn,
			tx: handle.tx,
			pending_lag: 0,
		});

		debug!(%room, subs = entry.subscribers.len(), "room bus: subscribed");
	}

	async fn unsubscribe(&self, room: RoomId, conn: ConnectionId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(&room) {
			entry.subscribers.retain(|s| s.conn != conn && !s.tx.is_closed());

			if entry.subscribers.is_empty() {
				inner.rooms.remove(&room);
			}
		}
	}

	async fn publish(&self, room: RoomId, event: BusEvent) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(&room) else {
			return;
		};

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(&room);
			return;
		}

		let mut dropped_total: u64 = 0;

		for sub in entry.subscribers.iter_mut() {
			match sub.tx.try_send(event.clone()) {
				Ok(()) => {
					if sub.pending_lag > 0
						&& sub
							.tx
							.try_send(BusEvent::Lagged {
								dropped: sub.pending_lag,
							})
							.is_ok()
					{
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(&room);
		}

		if dropped_total > 0 {
			metrics::counter!("roomcast_server_bus_dropped_events_total").increment(dropped_total);
			debug!(%room, dropped = dropped_total, "room bus: dropped due to full subscriber queues");
		}
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<RoomId, RoomEntry>,
}

#[derive(Debug, Default)]
struct RoomEntry {
	subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	conn: ConnectionId,
	tx: mpsc::Sender<BusEvent>,

	/// Events dropped for this subscriber since its last successful send.
	pending_lag: u64,
}

fn prune_closed_subscribers(entry: &mut RoomEntry) {
	entry.subscribers.retain(|s| !s.tx.is_closed());
}
