//! Per-channel state: the bounded send queue, in-flight outbound
//! fragmentation, inbound reassembly, and the `recently_sent` counter the
//! scheduler reads. Grounded on `ws-connection/src/core/conn.rs`'s shape
//! (plain data + pure state-transition methods, no I/O of its own),
//! generalized from "one connection's lifecycle" to "one channel's queue
//! plus reassembly buffer."

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use prost::Message;
use tokio::sync::{mpsc, Notify};

use crate::error::{MConnError, Result};
use crate::wire::packet::PacketMsg;

/// Immutable per-channel configuration, fixed for the lifetime of the
/// connection.
#[derive(Debug, Clone, Copy)]
pub struct ChannelDescriptor {
	pub id: u8,
	pub priority: u32,
	pub send_queue_capacity: usize,
	pub recv_message_capacity: usize,
	pub recv_buffer_capacity: usize,
}

impl ChannelDescriptor {
	/// # Panics
	/// Panics if `priority` is zero; the spec requires priority `>= 1`.
	#[must_use]
	pub fn new(id: u8, priority: u32, send_queue_capacity: usize, recv_message_capacity: usize, recv_buffer_capacity: usize) -> Self {
		assert!(priority >= 1, "channel priority must be >= 1");
		Self {
			id,
			priority,
			send_queue_capacity,
			recv_message_capacity,
			recv_buffer_capacity,
		}
	}
}

/// State shared between the caller-facing handle and the send loop that
/// owns the consuming half of the queue: the descriptor, the
/// priority-scheduling counter, and how many whole messages are currently
/// queued (tracked redundantly from `mpsc`'s own bookkeeping so `status()`
/// never needs to ask the send loop for it).
#[derive(Debug)]
pub struct ChannelShared {
	pub descriptor: ChannelDescriptor,
	recently_sent: AtomicI64,
	queued: AtomicUsize,
	queue_tx: mpsc::Sender<Vec<u8>>,
	wake: Arc<Notify>,
}

impl ChannelShared {
	/// Blocks until the message is enqueued or the channel is closed
	/// (connection stopping). Mirrors `Send`.
	pub async fn send(&self, bytes: Vec<u8>) -> bool {
		match self.queue_tx.send(bytes).await {
			Ok(()) => {
				self.queued.fetch_add(1, Ordering::AcqRel);
				self.wake.notify_one();
				true
			}
			Err(_) => false,
		}
	}

	/// Never blocks. Mirrors `TrySend`.
	pub fn try_send(&self, bytes: Vec<u8>) -> bool {
		match self.queue_tx.try_send(bytes) {
			Ok(()) => {
				self.queued.fetch_add(1, Ordering::AcqRel);
				self.wake.notify_one();
				true
			}
			Err(_) => false,
		}
	}

	pub fn can_send(&self) -> bool {
		self.queued.load(Ordering::Acquire) < self.descriptor.send_queue_capacity
	}

	pub fn queue_len(&self) -> usize {
		self.queued.load(Ordering::Acquire)
	}

	pub fn recently_sent(&self) -> i64 {
		self.recently_sent.load(Ordering::Acquire)
	}

	fn decay(&self, factor: f64) {
		let current = self.recently_sent.load(Ordering::Acquire);
		#[allow(clippy::cast_possible_truncation)]
		let decayed = (current as f64 * factor) as i64;
		self.recently_sent.store(decayed, Ordering::Release);
	}
}

/// The message currently being fragmented into outbound packets.
struct PendingSend {
	data: Vec<u8>,
	offset: usize,
}

/// Owned exclusively by the send loop: the consuming half of the queue plus
/// whatever message is mid-fragmentation. Never touched from outside the
/// send loop, so no locking is needed here even though `ChannelShared` is
/// reached concurrently by every caller thread.
pub struct SendChannel {
	pub shared: Arc<ChannelShared>,
	queue_rx: mpsc::Receiver<Vec<u8>>,
	sending: Option<PendingSend>,
}

impl SendChannel {
	pub fn is_sendable(&self) -> bool {
		self.sending.is_some() || self.shared.queue_len() > 0
	}

	/// Pops the next queued message into `sending` if nothing is in flight,
	/// then emits up to `max_payload` bytes of it. Returns `None` if there is
	/// nothing to send right now.
	pub fn next_packet(&mut self, max_payload: usize) -> Option<PacketMsg> {
		if self.sending.is_none() {
			let bytes = self.queue_rx.try_recv().ok()?;
			self.shared.queued.fetch_sub(1, Ordering::AcqRel);
			self.sending = Some(PendingSend { data: bytes, offset: 0 });
		}
		let pending = self.sending.as_mut().expect("just populated above");
		let remaining = pending.data.len() - pending.offset;
		let take = remaining.min(max_payload);
		let chunk = pending.data[pending.offset..pending.offset + take].to_vec();
		pending.offset += take;
		let eof = pending.offset == pending.data.len();
		if eof {
			self.sending = None;
		}

		let packet = PacketMsg {
			channel_id: i32::from(self.shared.descriptor.id),
			eof,
			data: chunk,
		};
		#[allow(clippy::cast_possible_wrap)]
		self.shared.recently_sent.fetch_add(packet.encoded_len() as i64, Ordering::AcqRel);
		Some(packet)
	}

	pub fn decay(&self, factor: f64) {
		self.shared.decay(factor);
	}
}

/// Owned exclusively by the receive loop: the reassembly buffer for the
/// channel's current inbound message.
pub struct RecvChannel {
	pub descriptor: ChannelDescriptor,
	recving: Vec<u8>,
}

impl RecvChannel {
	pub fn new(descriptor: ChannelDescriptor) -> Self {
		Self {
			descriptor,
			recving: Vec::new(),
		}
	}

	/// Appends `packet.data`, failing fatally if the reassembled message
	/// would exceed `recv_message_capacity`. Returns the complete message on
	/// `eof`, otherwise `None`.
	pub fn recv(&mut self, packet: PacketMsg) -> Result<Option<Vec<u8>>> {
		let new_len = self.recving.len() + packet.data.len();
		if new_len > self.descriptor.recv_message_capacity {
			return Err(MConnError::MessageTooLong {
				len: new_len,
				limit: self.descriptor.recv_message_capacity,
			});
		}
		self.recving.extend_from_slice(&packet.data);
		if packet.eof {
			Ok(Some(std::mem::take(&mut self.recving)))
		} else {
			Ok(None)
		}
	}
}

/// Builds the shared/send/recv triple for one descriptor, wired to the same
/// `Notify` the send loop waits on for "queue became non-empty."
pub fn new_channel(descriptor: ChannelDescriptor, wake: Arc<Notify>) -> (Arc<ChannelShared>, SendChannel, RecvChannel) {
	let (queue_tx, queue_rx) = mpsc::channel(descriptor.send_queue_capacity.max(1));
	let shared = Arc::new(ChannelShared {
		descriptor,
		recently_sent: AtomicI64::new(0),
		queued: AtomicUsize::new(0),
		queue_tx,
		wake,
	});
	let send_channel = SendChannel {
		shared: Arc::clone(&shared),
		queue_rx,
		sending: None,
	};
	let recv_channel = RecvChannel::new(descriptor);
	(shared, send_channel, recv_channel)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn descriptor() -> ChannelDescriptor {
		ChannelDescriptor::new(1, 1, 4, 1024, 1024)
	}

	#[tokio::test]
	async fn next_packet_fragments_and_marks_eof() {
		let (_, mut send, _) = new_channel(descriptor(), Arc::new(Notify::new()));
		assert!(send.shared.try_send(b"hello world".to_vec()));
		assert!(send.is_sendable());

		let first = send.next_packet(5).unwrap();
		assert_eq!(first.data, b"hello");
		assert!(!first.eof);
		assert!(send.is_sendable());

		let second = send.next_packet(5).unwrap();
		assert_eq!(second.data, b" worl");
		assert!(!second.eof);

		let third = send.next_packet(5).unwrap();
		assert_eq!(third.data, b"d");
		assert!(third.eof);
		assert!(!send.is_sendable());
	}

	#[tokio::test]
	async fn empty_message_emits_single_eof_packet() {
		let (_, mut send, _) = new_channel(descriptor(), Arc::new(Notify::new()));
		assert!(send.shared.try_send(Vec::new()));
		let packet = send.next_packet(1024).unwrap();
		assert!(packet.eof);
		assert!(packet.data.is_empty());
	}

	#[test]
	fn recv_reassembles_across_fragments() {
		let mut recv = RecvChannel::new(descriptor());
		assert!(recv
			.recv(PacketMsg {
				channel_id: 1,
				eof: false,
				data: b"hel".to_vec(),
			})
			.unwrap()
			.is_none());
		let complete = recv
			.recv(PacketMsg {
				channel_id: 1,
				eof: true,
				data: b"lo".to_vec(),
			})
			.unwrap();
		assert_eq!(complete, Some(b"hello".to_vec()));
	}

	#[test]
	fn recv_rejects_oversize_reassembly() {
		let descriptor = ChannelDescriptor::new(1, 1, 4, 4, 1024);
		let mut recv = RecvChannel::new(descriptor);
		let err = recv
			.recv(PacketMsg {
				channel_id: 1,
				eof: false,
				data: b"too long".to_vec(),
			})
			.unwrap_err();
		assert!(matches!(err, MConnError::MessageTooLong { .. }));
	}

	#[tokio::test]
	async fn try_send_fails_when_queue_full() {
		let (shared, _send, _recv) = new_channel(ChannelDescriptor::new(1, 1, 1, 1024, 1024), Arc::new(Notify::new()));
		assert!(shared.try_send(b"a".to_vec()));
		assert!(!shared.can_send());
		assert!(!shared.try_send(b"b".to_vec()));
	}
}
