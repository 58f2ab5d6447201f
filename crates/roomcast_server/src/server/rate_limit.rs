#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-connection sliding-window limiter over inbound transport events.
///
/// Owned exclusively by one session for that connection's lifetime; state is
/// never shared across connections and is lost on restart. Best effort, not
/// a security boundary.
#[derive(Debug)]
pub struct SlidingWindow {
	max_events: u32,
	window: Duration,
	events: VecDeque<Instant>,
}

impl SlidingWindow {
	pub fn new(max_events: u32, per_seconds: u64) -> Self {
		Self {
			max_events,
			window: Duration::from_secs(per_seconds),
			events: VecDeque::new(),
		}
	}

	/// Admit or refuse one inbound event.
	///
	/// Refusal means the connection is done: the caller closes with the
	/// policy-violation code and processes nothing further.
	pub fn allow(&mut self) -> bool {
		self.allow_at(Instant::now())
	}

	/// Clock-injected form of [`SlidingWindow::allow`].
	pub fn allow_at(&mut self, now: Instant) -> bool {
		while let Some(front) = self.events.front() {
			if now.duration_since(*front) > self.window {
				self.events.pop_front();
			} else {
				break;
			}
		}

		if self.events.len() as u32 >= self.max_events {
			return false;
		}

		self.events.push_back(now);
		true
	}

	/// Events currently inside the window.
	pub fn occupancy(&self) -> usize {
		self.events.len()
	}
}
