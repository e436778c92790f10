//! Priority-weighted least-recently-sent channel scheduler: among sendable
//! channels, pick the one minimizing `recently_sent / priority`, with
//! `recently_sent` periodically decayed so long-idle channels recover
//! priority. No teacher file does multi-channel scheduling directly; this
//! follows `core/conn.rs`'s style of small pure functions over owned state.

use crate::channel::SendChannel;

/// Multiply every channel's `recently_sent` by this factor once every
/// [`DECAY_EVERY_N_CYCLES`] send-loop cycles.
pub const DECAY_FACTOR: f64 = 0.5;
pub const DECAY_EVERY_N_CYCLES: u64 = 16;

/// Returns the index of the sendable channel with the lowest
/// `recently_sent / priority` score, ties broken by ascending channel id.
pub fn select(channels: &[SendChannel]) -> Option<usize> {
	channels
		.iter()
		.enumerate()
		.filter(|(_, ch)| ch.is_sendable())
		.min_by(|(_, a), (_, b)| {
			let score_a = a.shared.recently_sent() as f64 / f64::from(a.shared.descriptor.priority);
			let score_b = b.shared.recently_sent() as f64 / f64::from(b.shared.descriptor.priority);
			score_a
				.partial_cmp(&score_b)
				.unwrap_or(std::cmp::Ordering::Equal)
				.then_with(|| a.shared.descriptor.id.cmp(&b.shared.descriptor.id))
		})
		.map(|(i, _)| i)
}

pub fn maybe_decay(channels: &[SendChannel], cycle: u64) {
	if cycle % DECAY_EVERY_N_CYCLES == 0 {
		for channel in channels {
			channel.decay(DECAY_FACTOR);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::channel::{new_channel, ChannelDescriptor};
	use std::sync::Arc;
	use tokio::sync::Notify;

	fn channel(id: u8, priority: u32) -> SendChannel {
		let (_, send, _) = new_channel(ChannelDescriptor::new(id, priority, 8, 1024, 1024), Arc::new(Notify::new()));
		send
	}

	#[test]
	fn picks_lowest_weighted_score() {
		let mut a = channel(1, 1);
		let mut b = channel(2, 2);
		a.shared.try_send(b"x".to_vec());
		b.shared.try_send(b"y".to_vec());
		a.next_packet(1024); // recently_sent(a) now > 0
		let channels = vec![a, b];
		// b has priority 2 and recently_sent 0, so its score (0) beats a's.
		assert_eq!(select(&channels), Some(1));
	}

	#[test]
	fn ties_break_on_ascending_id() {
		let mut hi = channel(5, 1);
		let mut lo = channel(2, 1);
		hi.shared.try_send(b"x".to_vec());
		lo.shared.try_send(b"y".to_vec());
		let channels = vec![hi, lo];
		assert_eq!(select(&channels), Some(1));
	}

	#[test]
	fn non_sendable_channels_are_skipped() {
		let empty = channel(1, 1);
		let mut ready = channel(2, 1);
		ready.shared.try_send(b"x".to_vec());
		let channels = vec![empty, ready];
		assert_eq!(select(&channels), Some(1));
	}
}
