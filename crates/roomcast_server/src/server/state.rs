#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::server::auth::CredentialValidator;
use crate::server::cache::{KeyValueStore, RoomReadCache};
use crate::server::connection::ConnectionSettings;
use crate::server::presence::PresenceTracker;
use crate::server::room_bus::RoomBus;
use crate::server::store::ChatStore;

/// Readiness flag flipped once startup wiring (store, cache) is complete.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Shared server state handed to every handler.
///
/// Sessions never share mutable state directly; everything cross-session
/// goes through the bus, the key-value store or the chat store behind these
/// handles.
#[derive(Clone)]
pub struct AppState {
	pub store: Arc<dyn ChatStore>,
	pub kv: Arc<dyn KeyValueStore>,
	pub bus: Arc<dyn RoomBus>,
	pub presence: PresenceTracker,
	pub cache: RoomReadCache,
	pub validator: CredentialValidator,
	pub settings: ConnectionSettings,
	pub health: HealthState,
}
