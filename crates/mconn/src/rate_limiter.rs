//! Shared token-bucket bandwidth cap for the stream. `governor` is not used
//! anywhere in the teacher repo; it's borrowed from `gattaca-com-flux`'s
//! dependency table, the only repo in this workspace's lineage that reaches
//! for a token-bucket crate rather than hand-rolling one. `None` means
//! unlimited, matching the spec's "send_rate / recv_rate" defaults of "—".

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};

pub type ByteLimiter = Governor<NotKeyed, InMemoryState, DefaultClock>;

/// Builds a byte/sec token bucket, or `None` if `bytes_per_sec` is unset
/// (zero), meaning no cap.
pub fn build(bytes_per_sec: Option<u32>) -> Option<Arc<ByteLimiter>> {
	let bytes_per_sec = NonZeroU32::new(bytes_per_sec.unwrap_or(0))?;
	Some(Arc::new(Governor::direct(Quota::per_second(bytes_per_sec))))
}

/// Blocks the caller until `bytes` worth of token-bucket capacity is
/// available. A single write larger than the bucket's burst capacity is let
/// through immediately rather than deadlocking the send loop forever.
pub async fn acquire(limiter: Option<&Arc<ByteLimiter>>, bytes: usize) {
	let Some(limiter) = limiter else {
		return;
	};
	#[allow(clippy::cast_possible_truncation)]
	let Some(n) = NonZeroU32::new(bytes.min(u32::MAX as usize) as u32) else {
		return;
	};
	loop {
		match limiter.check_n(n) {
			Ok(Ok(())) => return,
			Ok(Err(not_until)) => {
				let wait = not_until.wait_time_from(DefaultClock::default().now());
				tokio::time::sleep(wait).await;
			}
			// the write is bigger than the bucket will ever hold; let it
			// through rather than stall the connection forever.
			Err(_insufficient_capacity) => return,
		}
	}
}
