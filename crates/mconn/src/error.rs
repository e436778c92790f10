use thiserror::Error;

/// Result type alias for fallible MConn operations.
pub type Result<T> = std::result::Result<T, MConnError>;

/// Fatal error taxonomy for an `MConn`. Every variant is terminal: once
/// raised, the connection reports it via `on_error` at most once and stops.
#[derive(Debug, Error)]
pub enum MConnError {
	#[error("malformed frame: {0}")]
	BadEncoding(String),

	#[error("unrecognized packet type")]
	UnknownMsgType,

	#[error("unknown channel id {0}")]
	UnknownChannel(i32),

	#[error("message exceeds capacity: {len} > {limit}")]
	MessageTooLong { len: usize, limit: usize },

	#[error("no pong within pong_timeout")]
	PongTimeout,

	#[error("stream I/O error: {0}")]
	StreamIo(#[from] std::io::Error),

	#[error("task panicked: {0}")]
	Panic(String),
}

/// Error raised while building a [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("max_packet_msg_payload_size must be greater than zero")]
	ZeroPayloadSize,
}
