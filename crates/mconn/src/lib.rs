//! Multiplexed peer-to-peer connection over a single duplex byte stream.
//!
//! An [`MConn`] carries one or more independently flow-controlled, prioritized
//! channels over a single underlying stream, using length-delimited protobuf
//! framing, a least-recently-sent scheduler, and ping/pong liveness checking.
//! See `SPEC_FULL.md` for the full protocol description.

mod channel;
mod conn;
mod config;
mod error;
mod liveness;
mod rate_limiter;
mod recv_loop;
mod scheduler;
mod send_loop;
mod status;
mod wire;

pub use channel::ChannelDescriptor;
pub use config::{Config, ConfigBuilder};
pub use conn::MConn;
pub use error::{ConfigError, MConnError, Result};
pub use status::{ChannelStatus, ConnectionStatus};
