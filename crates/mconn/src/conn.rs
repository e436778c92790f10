//! The public connection handle: lifecycle, shared state, and the
//! application-facing send/status API. Grounded on
//! `ws-connection/src/actor/handle.rs` (a cheaply-cloned handle around
//! `Arc`'d shared state) and `core/monitor.rs`'s single-fire error
//! reporting.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::channel::{self, ChannelDescriptor, ChannelShared, RecvChannel, SendChannel};
use crate::config::Config;
use crate::error::{MConnError, Result};
use crate::rate_limiter;
use crate::recv_loop;
use crate::send_loop;
use crate::status::{ChannelStatus, ConnectionStatus, RateTracker};
use crate::wire::PacketCodec;

/// Application callback invoked with `(channel_id, message)` for every fully
/// reassembled inbound message.
pub type OnReceive = Arc<dyn Fn(u8, Vec<u8>) + Send + Sync>;

/// Application callback invoked at most once, the first time the connection
/// fails for any reason.
pub type OnError = Arc<dyn Fn(MConnError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ConnectionState {
	Created = 0,
	Started = 1,
	Stopping = 2,
	Stopped = 3,
}

/// Advances `state` to `to` if that is forward progress, logging the
/// transition. Shared by [`Shared::transition`] and [`ErrorSink::fire`] so
/// both can drive the same monotonic state machine.
fn transition(state: &Mutex<ConnectionState>, to: ConnectionState) {
	let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
	if *state < to {
		tracing::info!(from = ?*state, to = ?to, "mconn state transition");
		*state = to;
	}
}

/// Ensures `on_error` runs exactly once, then cancels both loops. Grounded on
/// `core/monitor.rs`'s pattern of a single atomic guard around a
/// caller-supplied callback.
pub(crate) struct ErrorSink {
	fired: AtomicBool,
	callback: OnError,
	cancel: CancellationToken,
	state: Arc<Mutex<ConnectionState>>,
}

impl ErrorSink {
	pub(crate) fn fire(&self, err: MConnError) {
		if self.fired.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
			// `is_running()` must observe the stop before or at the same moment
			// `on_error` is invoked, so the state transition happens first even
			// though the background loops themselves unwind afterward.
			transition(&self.state, ConnectionState::Stopped);
			tracing::error!(error = %err, "mconn connection failed");
			(self.callback)(err);
			self.cancel.cancel();
		}
	}
}

/// State shared between the connection handle and both background loops.
pub(crate) struct Shared {
	state: Arc<Mutex<ConnectionState>>,
	pub draining: AtomicBool,
	pub cancel: CancellationToken,
	pub drained: Notify,
	pub wake: Arc<Notify>,
	pub error_sink: ErrorSink,
	pub send_bytes: RateTracker,
	pub recv_bytes: RateTracker,
}

impl Shared {
	fn transition(&self, to: ConnectionState) {
		transition(&self.state, to);
	}

	fn get(&self) -> ConnectionState {
		*self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// A multiplexed connection over a single duplex byte stream, carrying one
/// or more independently flow-controlled channels.
///
/// `new` wires up the channels but does not touch the stream; `start` spawns
/// the send and receive loops. Messages may be enqueued with `send`/
/// `try_send` before `start` — they simply wait in the channel's queue.
pub struct MConn<S> {
	channels: HashMap<u8, Arc<ChannelShared>>,
	send_channels: Mutex<Option<Vec<SendChannel>>>,
	recv_channels: Mutex<Option<HashMap<u8, RecvChannel>>>,
	stream: Mutex<Option<S>>,
	config: Config,
	on_receive: OnReceive,
	wake: Arc<Notify>,
	shared: Arc<Shared>,
	tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl<S> MConn<S>
where
	S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
	/// Builds a connection over `stream` with the given channel descriptors.
	/// Does not start the send/receive loops; call [`MConn::start`] for that.
	///
	/// # Panics
	/// Panics if two descriptors share a channel id.
	#[must_use]
	pub fn new(stream: S, descriptors: Vec<ChannelDescriptor>, on_receive: impl Fn(u8, Vec<u8>) + Send + Sync + 'static, on_error: impl Fn(MConnError) + Send + Sync + 'static, config: Config) -> Self {
		let wake = Arc::new(Notify::new());
		let cancel = CancellationToken::new();
		let state = Arc::new(Mutex::new(ConnectionState::Created));
		let error_sink = ErrorSink {
			fired: AtomicBool::new(false),
			callback: Arc::new(on_error),
			cancel: cancel.clone(),
			state: Arc::clone(&state),
		};
		let shared = Arc::new(Shared {
			state,
			draining: AtomicBool::new(false),
			cancel,
			drained: Notify::new(),
			wake: Arc::clone(&wake),
			error_sink,
			send_bytes: RateTracker::new(),
			recv_bytes: RateTracker::new(),
		});

		let mut channels = HashMap::with_capacity(descriptors.len());
		let mut send_channels = Vec::with_capacity(descriptors.len());
		let mut recv_channels = HashMap::with_capacity(descriptors.len());
		for descriptor in descriptors {
			let (shared_channel, send_channel, recv_channel) = channel::new_channel(descriptor, Arc::clone(&wake));
			assert!(channels.insert(descriptor.id, shared_channel).is_none(), "duplicate channel id {}", descriptor.id);
			send_channels.push(send_channel);
			recv_channels.insert(descriptor.id, recv_channel);
		}

		Self {
			channels,
			send_channels: Mutex::new(Some(send_channels)),
			recv_channels: Mutex::new(Some(recv_channels)),
			stream: Mutex::new(Some(stream)),
			config,
			on_receive: Arc::new(on_receive),
			wake,
			shared,
			tasks: Mutex::new(None),
		}
	}

	/// Splits the stream and spawns the send and receive loops. Idempotent:
	/// calling this more than once is a no-op.
	pub fn start(&self) -> Result<()> {
		let stream = {
			let mut guard = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
			guard.take()
		};
		let Some(stream) = stream else {
			return Ok(());
		};

		let send_channels = self
			.send_channels
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
			.expect("stream and channel buffers are taken together");
		let recv_channels = self
			.recv_channels
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
			.expect("stream and channel buffers are taken together");

		let (read_half, write_half) = tokio::io::split(stream);
		let codec = PacketCodec::new(self.config.max_packet_msg_payload_size);
		let framed_read = FramedRead::new(read_half, codec.clone());
		let framed_write = FramedWrite::new(write_half, codec);

		let (reply_pong_tx, reply_pong_rx) = mpsc::unbounded_channel();
		let (pong_ack_tx, pong_ack_rx) = mpsc::unbounded_channel();

		let send_limiter = rate_limiter::build(self.config.send_rate);
		let recv_limiter = rate_limiter::build(self.config.recv_rate);

		self.shared.transition(ConnectionState::Started);

		let send_shared = Arc::clone(&self.shared);
		let send_config = self.config.clone();
		let send_task = tokio::spawn(async move {
			let outcome = AssertUnwindSafe(send_loop::run(framed_write, send_channels, send_config, Arc::clone(&send_shared), reply_pong_rx, pong_ack_rx, send_limiter))
				.catch_unwind()
				.await;
			if let Err(panic) = outcome {
				send_shared.error_sink.fire(MConnError::Panic(panic_message(&panic)));
			}
			send_shared.transition(ConnectionState::Stopped);
		});

		let recv_shared = Arc::clone(&self.shared);
		let on_receive = Arc::clone(&self.on_receive);
		let max_packet_msg_payload_size = self.config.max_packet_msg_payload_size;
		let recv_task = tokio::spawn(async move {
			let outcome = AssertUnwindSafe(recv_loop::run(
				framed_read,
				recv_channels,
				max_packet_msg_payload_size,
				on_receive,
				reply_pong_tx,
				pong_ack_tx,
				Arc::clone(&recv_shared),
				recv_limiter,
			))
			.catch_unwind()
			.await;
			if let Err(panic) = outcome {
				recv_shared.error_sink.fire(MConnError::Panic(panic_message(&panic)));
			}
		});

		*self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = Some((send_task, recv_task));
		Ok(())
	}

	/// Waits for both background loops to exit, e.g. after `stop` or
	/// `flush_stop`. A no-op if the connection was never started, or if
	/// called more than once.
	pub async fn wait(&self) {
		let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).take();
		if let Some((send_task, recv_task)) = tasks {
			let _ = send_task.await;
			let _ = recv_task.await;
		}
	}

	/// Cancels both loops immediately, dropping anything still queued.
	/// Idempotent.
	pub fn stop(&self) -> Result<()> {
		self.shared.transition(ConnectionState::Stopping);
		self.shared.cancel.cancel();
		self.shared.transition(ConnectionState::Stopped);
		Ok(())
	}

	/// Stops accepting new sends and waits in the background for all queued
	/// messages to drain before cancelling the loops. Idempotent.
	pub fn flush_stop(&self) {
		if self.shared.draining.swap(true, Ordering::AcqRel) {
			return;
		}
		self.shared.transition(ConnectionState::Stopping);
		self.wake.notify_waiters();
		let shared = Arc::clone(&self.shared);
		tokio::spawn(async move {
			shared.drained.notified().await;
			shared.cancel.cancel();
			shared.transition(ConnectionState::Stopped);
		});
	}

	/// Enqueues `bytes` on `channel_id`, waiting for queue space if full.
	/// Returns `false` if the channel is unknown or the connection is
	/// stopping/stopped.
	pub async fn send(&self, channel_id: u8, bytes: Vec<u8>) -> bool {
		if self.is_stopping_or_stopped() {
			return false;
		}
		match self.channels.get(&channel_id) {
			Some(channel) => channel.send(bytes).await,
			None => {
				tracing::debug!(channel_id, "send on unknown channel");
				false
			}
		}
	}

	/// Non-blocking `send`: fails immediately instead of waiting for queue
	/// space.
	pub fn try_send(&self, channel_id: u8, bytes: Vec<u8>) -> bool {
		if self.is_stopping_or_stopped() {
			return false;
		}
		match self.channels.get(&channel_id) {
			Some(channel) => channel.try_send(bytes),
			None => {
				tracing::debug!(channel_id, "try_send on unknown channel");
				false
			}
		}
	}

	#[must_use]
	pub fn can_send(&self, channel_id: u8) -> bool {
		!self.is_stopping_or_stopped() && self.channels.get(&channel_id).is_some_and(|channel| channel.can_send())
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.shared.get() == ConnectionState::Started
	}

	#[must_use]
	pub fn status(&self) -> ConnectionStatus {
		let mut channels: Vec<_> = self
			.channels
			.values()
			.map(|channel| ChannelStatus {
				id: channel.descriptor.id,
				send_queue_size: channel.queue_len(),
				recently_sent: channel.recently_sent(),
			})
			.collect();
		channels.sort_by_key(|channel| channel.id);
		ConnectionStatus {
			channels,
			send_rate_bytes_per_sec: self.shared.send_bytes.sample(),
			recv_rate_bytes_per_sec: self.shared.recv_bytes.sample(),
		}
	}

	fn is_stopping_or_stopped(&self) -> bool {
		matches!(self.shared.get(), ConnectionState::Stopping | ConnectionState::Stopped)
	}
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown panic".to_string()
	}
}
