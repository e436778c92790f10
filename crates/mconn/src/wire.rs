//! Wire framing: a tagged union {Ping, Pong, Msg} carried as length-delimited
//! protobuf frames. The packet bodies are hand-declared `prost::Message`
//! structs (no `.proto`/`build.rs`), the same way `ws-events` declares its
//! event messages directly in Rust.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::MConnError;

pub mod packet {
	use prost::{Message, Oneof};

	#[derive(Clone, PartialEq, Message)]
	pub struct PacketPing {}

	#[derive(Clone, PartialEq, Message)]
	pub struct PacketPong {}

	#[derive(Clone, PartialEq, Message)]
	pub struct PacketMsg {
		#[prost(int32, tag = "1")]
		pub channel_id: i32,
		#[prost(bool, tag = "2")]
		pub eof: bool,
		#[prost(bytes = "vec", tag = "3")]
		pub data: Vec<u8>,
	}

	#[derive(Clone, PartialEq, Oneof)]
	pub enum Sum {
		#[prost(message, tag = "1")]
		Ping(PacketPing),
		#[prost(message, tag = "2")]
		Pong(PacketPong),
		#[prost(message, tag = "3")]
		Msg(PacketMsg),
	}
}

/// The tagged-union frame body. `sum` is `None` only for a frame whose outer
/// tag the peer's encoder didn't recognize; decoding such a frame always
/// yields [`MConnError::UnknownMsgType`] before a `Packet` with `sum: None`
/// escapes this module.
#[derive(Clone, PartialEq, Message)]
pub struct Packet {
	#[prost(oneof = "packet::Sum", tags = "1, 2, 3")]
	pub sum: Option<packet::Sum>,
}

impl Packet {
	pub fn ping() -> Self {
		Packet {
			sum: Some(packet::Sum::Ping(packet::PacketPing {})),
		}
	}

	pub fn pong() -> Self {
		Packet {
			sum: Some(packet::Sum::Pong(packet::PacketPong {})),
		}
	}

	pub fn msg(channel_id: i32, eof: bool, data: Vec<u8>) -> Self {
		Packet {
			sum: Some(packet::Sum::Msg(packet::PacketMsg { channel_id, eof, data })),
		}
	}
}

/// Maximum serialized overhead of a `Packet` header around a `PacketMsg`
/// payload: the oneof wrapper tag, the inner message's own length varint,
/// the `channel_id` and `eof` fields, and the `data` field's tag + length
/// varint. Derived from the schema in `packet`, not measured.
const MAX_HEADER_OVERHEAD: usize = 20;

/// Slack above `max_packet_msg_payload_size + MAX_HEADER_OVERHEAD` that the
/// codec still accepts at the framing layer. The codec's job is only to
/// reject frames no legitimate peer could ever produce (a DoS guard); a
/// `PacketMsg` whose payload merely exceeds the configured
/// `max_packet_msg_payload_size` by a modest amount must still decode so
/// `recv_loop` can raise the more specific `MessageTooLong`.
const OVERSIZE_GUARD_SLACK: usize = 512;

/// A frame length prefix is a protobuf-style varint; anything not
/// terminated within 10 bytes cannot be a legal `u64` varint.
const MAX_VARINT_LEN: usize = 10;

fn read_length_prefix(src: &[u8]) -> std::result::Result<Option<(usize, usize)>, MConnError> {
	let mut value: u64 = 0;
	for (i, &byte) in src.iter().enumerate().take(MAX_VARINT_LEN) {
		value |= u64::from(byte & 0x7f) << (7 * i);
		if byte & 0x80 == 0 {
			return Ok(Some((i + 1, value as usize)));
		}
	}
	if src.len() >= MAX_VARINT_LEN {
		return Err(MConnError::BadEncoding("frame length prefix too long".to_string()));
	}
	Ok(None)
}

fn write_length_prefix(mut value: usize, dst: &mut BytesMut) {
	loop {
		let mut byte = (value & 0x7f) as u8;
		value >>= 7;
		if value != 0 {
			byte |= 0x80;
		}
		dst.put_u8(byte);
		if value == 0 {
			break;
		}
	}
}

/// `Decoder`/`Encoder` pair for [`Packet`] over a `tokio_util::codec::Framed`
/// stream. Frames longer than `max_packet_size` are rejected before the
/// protobuf body is even parsed, bounding how much untrusted data the codec
/// will buffer for one frame.
#[derive(Debug, Clone)]
pub struct PacketCodec {
	max_packet_size: usize,
}

impl PacketCodec {
	pub fn new(max_packet_msg_payload_size: usize) -> Self {
		Self {
			max_packet_size: max_packet_msg_payload_size + MAX_HEADER_OVERHEAD + OVERSIZE_GUARD_SLACK,
		}
	}

	pub fn max_packet_size(&self) -> usize {
		self.max_packet_size
	}
}

impl Decoder for PacketCodec {
	type Item = Packet;
	type Error = MConnError;

	fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Packet>, MConnError> {
		let Some((prefix_len, length)) = read_length_prefix(src)? else {
			return Ok(None);
		};
		if length > self.max_packet_size {
			return Err(MConnError::BadEncoding(format!("frame length {length} exceeds max {}", self.max_packet_size)));
		}
		if src.len() < prefix_len + length {
			src.reserve(prefix_len + length - src.len());
			return Ok(None);
		}
		src.advance(prefix_len);
		let frame = src.split_to(length).freeze();
		let packet = Packet::decode(frame).map_err(|e| MConnError::BadEncoding(e.to_string()))?;
		if packet.sum.is_none() {
			return Err(MConnError::UnknownMsgType);
		}
		Ok(Some(packet))
	}
}

impl Encoder<Packet> for PacketCodec {
	type Error = MConnError;

	fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> std::result::Result<(), MConnError> {
		let body = item.encode_to_vec();
		if body.len() > self.max_packet_size {
			return Err(MConnError::MessageTooLong {
				len: body.len(),
				limit: self.max_packet_size,
			});
		}
		write_length_prefix(body.len(), dst);
		dst.extend_from_slice(&body);
		Ok(())
	}
}
