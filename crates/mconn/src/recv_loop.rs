//! The inbound task: reads frames, answers pings, feeds pongs back to the
//! send loop's liveness tracker, reassembles messages, and invokes the
//! application callback. Mirrors `send_loop`'s `tokio::select!` structure.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::channel::RecvChannel;
use crate::conn::{OnReceive, Shared};
use crate::error::{MConnError, Result};
use crate::rate_limiter::{self, ByteLimiter};
use crate::wire::{packet, Packet, PacketCodec};

pub async fn run<R>(
	mut framed_read: FramedRead<R, PacketCodec>,
	mut recv_channels: HashMap<u8, RecvChannel>,
	max_packet_msg_payload_size: usize,
	on_receive: OnReceive,
	reply_pong_tx: mpsc::UnboundedSender<()>,
	pong_ack_tx: mpsc::UnboundedSender<()>,
	shared: Arc<Shared>,
	recv_limiter: Option<Arc<ByteLimiter>>,
) where
	R: AsyncRead + Unpin,
{
	loop {
		tokio::select! {
			biased;

			() = shared.cancel.cancelled() => {
				tracing::debug!("recv loop cancelled");
				break;
			}

			frame = framed_read.next() => {
				match frame {
					None => {
						shared.error_sink.fire(MConnError::StreamIo(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed the connection")));
						break;
					}
					Some(Err(err)) => {
						shared.error_sink.fire(err);
						break;
					}
					Some(Ok(packet)) => {
						let len = prost::Message::encoded_len(&packet);
						rate_limiter::acquire(recv_limiter.as_ref(), len).await;
						shared.recv_bytes.add(len);
						if let Err(err) = dispatch(packet, &mut recv_channels, max_packet_msg_payload_size, &on_receive, &reply_pong_tx, &pong_ack_tx) {
							shared.error_sink.fire(err);
							break;
						}
					}
				}
			}
		}
	}
}

fn dispatch(packet: Packet, recv_channels: &mut HashMap<u8, RecvChannel>, max_packet_msg_payload_size: usize, on_receive: &OnReceive, reply_pong_tx: &mpsc::UnboundedSender<()>, pong_ack_tx: &mpsc::UnboundedSender<()>) -> Result<()> {
	match packet.sum {
		Some(packet::Sum::Ping(_)) => {
			let _ = reply_pong_tx.send(());
			Ok(())
		}
		Some(packet::Sum::Pong(_)) => {
			let _ = pong_ack_tx.send(());
			Ok(())
		}
		Some(packet::Sum::Msg(msg)) => {
			if msg.data.len() > max_packet_msg_payload_size {
				return Err(MConnError::MessageTooLong {
					len: msg.data.len(),
					limit: max_packet_msg_payload_size,
				});
			}
			let channel_id = u8::try_from(msg.channel_id).map_err(|_| MConnError::UnknownChannel(msg.channel_id))?;
			let channel = recv_channels.get_mut(&channel_id).ok_or(MConnError::UnknownChannel(msg.channel_id))?;
			if let Some(message) = channel.recv(msg)? {
				on_receive(channel_id, message);
			}
			Ok(())
		}
		None => Err(MConnError::UnknownMsgType),
	}
}
