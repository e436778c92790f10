//! The outbound task: selects a channel, emits one packet, rate-limits, and
//! flushes on a timer. Grounded on
//! `ws-connection/src/core/monitor.rs`'s `TimeoutMonitor::run` — a
//! `tokio::select!` cycle over an `interval` and a `CancellationToken`,
//! structured `tracing` on every state change.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::codec::FramedWrite;

use crate::channel::SendChannel;
use crate::conn::Shared;
use crate::config::Config;
use crate::error::{MConnError, Result};
use crate::liveness::Liveness;
use crate::rate_limiter::{self, ByteLimiter};
use crate::scheduler;
use crate::wire::{Packet, PacketCodec};

/// Far enough in the future that the pong-deadline `select!` arm never
/// fires while liveness is `Idle`. Reset to the real deadline once a ping is
/// sent.
fn disabled_deadline() -> TokioInstant {
	TokioInstant::now() + Duration::from_secs(365 * 24 * 3600)
}

pub async fn run<W>(
	mut framed_write: FramedWrite<W, PacketCodec>,
	mut send_channels: Vec<SendChannel>,
	config: Config,
	shared: Arc<Shared>,
	mut reply_pong_rx: mpsc::UnboundedReceiver<()>,
	mut pong_ack_rx: mpsc::UnboundedReceiver<()>,
	send_limiter: Option<Arc<ByteLimiter>>,
) where
	W: AsyncWrite + Unpin,
{
	let max_payload = config.max_packet_msg_payload_size;
	let mut liveness = Liveness::new();
	let mut ping_timer = interval(config.ping_interval);
	ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
	let mut flush_timer = interval(config.flush_throttle);
	flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
	let mut dirty = false;
	let mut cycle: u64 = 0;

	let pong_deadline = sleep(Duration::from_secs(0));
	tokio::pin!(pong_deadline);
	pong_deadline.as_mut().reset(disabled_deadline());

	'outer: loop {
		if shared.draining.load(Ordering::Acquire) && !send_channels.iter().any(SendChannel::is_sendable) {
			tracing::debug!("send loop drained, exiting");
			break;
		}

		tokio::select! {
			biased;

			() = shared.cancel.cancelled() => {
				tracing::debug!("send loop cancelled");
				break 'outer;
			}

			() = &mut pong_deadline, if !liveness.is_idle() => {
				shared.error_sink.fire(MConnError::PongTimeout);
				break 'outer;
			}

			Some(()) = reply_pong_rx.recv() => {
				if let Err(err) = emit(&mut framed_write, Packet::pong(), send_limiter.as_ref(), &shared).await {
					shared.error_sink.fire(err);
					break 'outer;
				}
				dirty = true;
				continue 'outer;
			}

			Some(()) = pong_ack_rx.recv() => {
				if liveness.pong_received() {
					pong_deadline.as_mut().reset(disabled_deadline());
				}
				continue 'outer;
			}

			_ = ping_timer.tick(), if !shared.draining.load(Ordering::Acquire) => {
				if liveness.is_idle() {
					if let Err(err) = emit(&mut framed_write, Packet::ping(), send_limiter.as_ref(), &shared).await {
						shared.error_sink.fire(err);
						break 'outer;
					}
					dirty = true;
					liveness = Liveness::ping_sent(config.pong_timeout);
					pong_deadline.as_mut().reset(liveness.deadline().expect("just armed"));
				}
				continue 'outer;
			}

			_ = flush_timer.tick() => {
				if dirty {
					if let Err(err) = framed_write.flush().await {
						shared.error_sink.fire(err);
						break 'outer;
					}
					dirty = false;
				}
				continue 'outer;
			}

			() = shared.wake.notified() => {}
		}

		cycle += 1;
		scheduler::maybe_decay(&send_channels, cycle);

		if let Some(idx) = scheduler::select(&send_channels) {
			if let Some(packet_msg) = send_channels[idx].next_packet(max_payload) {
				let channel_id = packet_msg.channel_id;
				let eof = packet_msg.eof;
				let packet = Packet {
					sum: Some(crate::wire::packet::Sum::Msg(packet_msg)),
				};
				if let Err(err) = emit(&mut framed_write, packet, send_limiter.as_ref(), &shared).await {
					shared.error_sink.fire(err);
					break 'outer;
				}
				dirty = true;
				tracing::debug!(channel_id, eof, "packet dispatched");
			}
		}
	}

	let _ = framed_write.flush().await;
	shared.drained.notify_one();
}

async fn emit<W>(framed_write: &mut FramedWrite<W, PacketCodec>, packet: Packet, limiter: Option<&Arc<ByteLimiter>>, shared: &Shared) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	let len = prost::Message::encoded_len(&packet);
	rate_limiter::acquire(limiter, len).await;
	framed_write.feed(packet).await?;
	shared.send_bytes.add(len);
	Ok(())
}
