//! Connection status snapshot and the rolling byte-rate counters behind it.
//! Grounded on `ws-connection/src/metrics/notifier.rs`'s pattern of plain
//! `AtomicU64` counters read without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ChannelStatus {
	pub id: u8,
	pub send_queue_size: usize,
	pub recently_sent: i64,
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
	pub channels: Vec<ChannelStatus>,
	pub send_rate_bytes_per_sec: f64,
	pub recv_rate_bytes_per_sec: f64,
}

/// Cumulative byte counter plus a lazily-advanced sampling window, so
/// `status()` can report a rate without a background task maintaining one.
#[derive(Debug)]
pub struct RateTracker {
	total: AtomicU64,
	window: Mutex<(Instant, u64)>,
}

impl RateTracker {
	pub fn new() -> Self {
		Self {
			total: AtomicU64::new(0),
			window: Mutex::new((Instant::now(), 0)),
		}
	}

	pub fn add(&self, bytes: usize) {
		#[allow(clippy::cast_possible_truncation)]
		self.total.fetch_add(bytes as u64, Ordering::Relaxed);
	}

	/// Bytes per second since the previous call to `sample`.
	pub fn sample(&self) -> f64 {
		let total_now = self.total.load(Ordering::Relaxed);
		let mut window = self.window.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
		let (start, start_total) = *window;
		let elapsed = start.elapsed().as_secs_f64();
		let rate = if elapsed > 0.0 {
			(total_now.saturating_sub(start_total)) as f64 / elapsed
		} else {
			0.0
		};
		*window = (Instant::now(), total_now);
		rate
	}
}

impl Default for RateTracker {
	fn default() -> Self {
		Self::new()
	}
}
