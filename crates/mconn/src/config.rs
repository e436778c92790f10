//! Connection configuration. Grounded on
//! `ws-connection/src/core/monitor.rs`'s `TimeoutMonitorBuilder`: optional
//! fields defaulted at `build()` time, validated, and turned into a plain
//! immutable config struct handed to the connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_MAX_PACKET_MSG_PAYLOAD_SIZE: usize = 1024;
pub const DEFAULT_FLUSH_THROTTLE: Duration = Duration::from_millis(100);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(45);

/// Recognized configuration options, see SPEC_FULL.md §3/§6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	/// Token-bucket cap on bytes written to the stream, shared across
	/// channels. `None` means unlimited.
	pub send_rate: Option<u32>,
	/// Token-bucket cap on bytes read from the stream. `None` means
	/// unlimited.
	pub recv_rate: Option<u32>,
	/// Maximum payload bytes per `PacketMsg`; larger application messages
	/// are fragmented across multiple packets.
	pub max_packet_msg_payload_size: usize,
	/// Maximum interval a buffered byte waits before the send loop forces a
	/// stream flush.
	#[serde(with = "humantime_duration")]
	pub flush_throttle: Duration,
	/// Period between pings when the connection is otherwise quiet.
	#[serde(with = "humantime_duration")]
	pub ping_interval: Duration,
	/// Maximum time from ping emission to pong arrival before the peer is
	/// declared dead.
	#[serde(with = "humantime_duration")]
	pub pong_timeout: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			send_rate: None,
			recv_rate: None,
			max_packet_msg_payload_size: DEFAULT_MAX_PACKET_MSG_PAYLOAD_SIZE,
			flush_throttle: DEFAULT_FLUSH_THROTTLE,
			ping_interval: DEFAULT_PING_INTERVAL,
			pong_timeout: DEFAULT_PONG_TIMEOUT,
		}
	}
}

impl Config {
	#[must_use]
	pub fn builder() -> ConfigBuilder {
		ConfigBuilder::default()
	}
}

#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
	send_rate: Option<u32>,
	recv_rate: Option<u32>,
	max_packet_msg_payload_size: Option<usize>,
	flush_throttle: Option<Duration>,
	ping_interval: Option<Duration>,
	pong_timeout: Option<Duration>,
}

impl ConfigBuilder {
	#[must_use]
	pub fn send_rate(mut self, bytes_per_sec: u32) -> Self {
		self.send_rate = Some(bytes_per_sec);
		self
	}

	#[must_use]
	pub fn recv_rate(mut self, bytes_per_sec: u32) -> Self {
		self.recv_rate = Some(bytes_per_sec);
		self
	}

	#[must_use]
	pub fn max_packet_msg_payload_size(mut self, size: usize) -> Self {
		self.max_packet_msg_payload_size = Some(size);
		self
	}

	#[must_use]
	pub fn flush_throttle(mut self, duration: Duration) -> Self {
		self.flush_throttle = Some(duration);
		self
	}

	#[must_use]
	pub fn ping_interval(mut self, duration: Duration) -> Self {
		self.ping_interval = Some(duration);
		self
	}

	#[must_use]
	pub fn pong_timeout(mut self, duration: Duration) -> Self {
		self.pong_timeout = Some(duration);
		self
	}

	/// Validates and finalizes the config. `pong_timeout < ping_interval` is
	/// accepted without complaint — see DESIGN.md's Open Questions.
	pub fn build(self) -> std::result::Result<Config, ConfigError> {
		let max_packet_msg_payload_size = self.max_packet_msg_payload_size.unwrap_or(DEFAULT_MAX_PACKET_MSG_PAYLOAD_SIZE);
		if max_packet_msg_payload_size == 0 {
			return Err(ConfigError::ZeroPayloadSize);
		}
		Ok(Config {
			send_rate: self.send_rate,
			recv_rate: self.recv_rate,
			max_packet_msg_payload_size,
			flush_throttle: self.flush_throttle.unwrap_or(DEFAULT_FLUSH_THROTTLE),
			ping_interval: self.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
			pong_timeout: self.pong_timeout.unwrap_or(DEFAULT_PONG_TIMEOUT),
		})
	}
}

mod humantime_duration {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serialize, Serializer};

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		duration.as_secs_f64().serialize(serializer)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
		let secs = f64::deserialize(deserializer)?;
		Ok(Duration::from_secs_f64(secs))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec_table() {
		let config = Config::builder().build().unwrap();
		assert_eq!(config.max_packet_msg_payload_size, 1024);
		assert_eq!(config.send_rate, None);
		assert_eq!(config.recv_rate, None);
	}

	#[test]
	fn zero_payload_size_is_rejected() {
		let err = Config::builder().max_packet_msg_payload_size(0).build().unwrap_err();
		assert!(matches!(err, ConfigError::ZeroPayloadSize));
	}

	#[test]
	fn builder_overrides_apply() {
		let config = Config::builder()
			.ping_interval(Duration::from_secs(1))
			.pong_timeout(Duration::from_secs(2))
			.send_rate(4096)
			.build()
			.unwrap();
		assert_eq!(config.ping_interval, Duration::from_secs(1));
		assert_eq!(config.pong_timeout, Duration::from_secs(2));
		assert_eq!(config.send_rate, Some(4096));
	}
}
