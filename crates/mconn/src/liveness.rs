//! Ping/pong liveness state machine. Grounded on
//! `ws-connection/src/actor/state.rs`'s `ConnectionState` (a plain struct
//! tracking an `Instant` and a boolean-ish mode, checked against a
//! `Duration` to decide timeout), generalized from "last activity
//! timestamp" to "outstanding ping deadline."

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
	Idle,
	PingSent { deadline: Instant },
}

impl Liveness {
	pub fn new() -> Self {
		Liveness::Idle
	}

	pub fn is_idle(&self) -> bool {
		matches!(self, Liveness::Idle)
	}

	/// Arms the pong deadline. Caller is responsible for only calling this
	/// while `Idle` (at most one outstanding ping at a time).
	pub fn ping_sent(pong_timeout: Duration) -> Self {
		Liveness::PingSent {
			deadline: Instant::now() + pong_timeout,
		}
	}

	/// Clears an outstanding ping. Returns `false` (no-op) if there was none,
	/// per the "unsolicited pongs are ignored" contract.
	pub fn pong_received(&mut self) -> bool {
		match self {
			Liveness::PingSent { .. } => {
				*self = Liveness::Idle;
				true
			}
			Liveness::Idle => false,
		}
	}

	pub fn deadline(&self) -> Option<Instant> {
		match self {
			Liveness::PingSent { deadline } => Some(*deadline),
			Liveness::Idle => None,
		}
	}

	pub fn is_overdue(&self, now: Instant) -> bool {
		matches!(self, Liveness::PingSent { deadline } if now >= *deadline)
	}
}

impl Default for Liveness {
	fn default() -> Self {
		Self::new()
	}
}
