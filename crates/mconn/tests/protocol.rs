//! End-to-end scenarios over an in-memory `tokio::io::duplex` pipe. The wire
//! frames here are built independently of `mconn`'s own codec, the way a
//! conformance test for a real peer would, rather than by importing the
//! crate's private encoder.

use std::time::Duration;

use mconn::{ChannelDescriptor, Config, MConn, MConnError};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn descriptor(id: u8) -> ChannelDescriptor {
	ChannelDescriptor::new(id, 1, 16, 4096, 4096)
}

const PONG_FRAME: [u8; 3] = [0x02, 0x12, 0x00];

fn varint(mut value: u64) -> Vec<u8> {
	let mut out = Vec::new();
	loop {
		let mut byte = (value & 0x7f) as u8;
		value >>= 7;
		if value != 0 {
			byte |= 0x80;
		}
		out.push(byte);
		if value == 0 {
			break;
		}
	}
	out
}

fn tag(field: u32, wire_type: u8) -> u8 {
	(((field << 3) | u32::from(wire_type)) & 0xff) as u8
}

/// Hand-builds a length-prefixed `PacketMsg` frame, independent of the
/// crate's own encoder, so these tests exercise the wire format rather than
/// the implementation.
fn frame_msg(channel_id: i64, eof: bool, data: &[u8]) -> Vec<u8> {
	let mut body = Vec::new();
	if channel_id != 0 {
		body.push(tag(1, 0));
		body.extend(varint(channel_id as u64));
	}
	if eof {
		body.push(tag(2, 0));
		body.push(1);
	}
	if !data.is_empty() {
		body.push(tag(3, 2));
		body.extend(varint(data.len() as u64));
		body.extend_from_slice(data);
	}

	let mut packet = vec![tag(3, 2)];
	packet.extend(varint(body.len() as u64));
	packet.extend(body);

	let mut frame = varint(packet.len() as u64);
	frame.extend(packet);
	frame
}

fn frame_garbage() -> Vec<u8> {
	vec![0x01, 0x02, 0x03, 0x04, 0x05]
}

#[tokio::test]
async fn round_trip_delivers_message_on_correct_channel() {
	let (client_io, server_io) = tokio::io::duplex(4096);

	let (recv_tx, mut recv_rx) = mpsc::unbounded_channel();
	let server = MConn::new(server_io, vec![descriptor(1)], move |channel_id, bytes| drop(recv_tx.send((channel_id, bytes))), |_| {}, Config::default());
	server.start().unwrap();

	let client = MConn::new(client_io, vec![descriptor(1)], |_, _| {}, |_| {}, Config::default());
	client.start().unwrap();

	assert!(client.send(1, b"Cyclops".to_vec()).await);

	let (channel_id, bytes) = timeout(Duration::from_millis(500), recv_rx.recv()).await.expect("message within budget").expect("channel still open");
	assert_eq!(channel_id, 1);
	assert_eq!(bytes, b"Cyclops");
}

#[tokio::test]
async fn send_on_unknown_channel_is_rejected() {
	let (client_io, _peer_io) = tokio::io::duplex(4096);
	let client = MConn::new(client_io, vec![descriptor(1)], |_, _| {}, |_| {}, Config::default());
	client.start().unwrap();

	assert!(!client.send(5, b"Absorbing Man".to_vec()).await);
	assert!(!client.try_send(5, b"Absorbing Man".to_vec()));
}

#[tokio::test]
async fn unknown_channel_on_receive_is_fatal() {
	let (conn_io, mut peer_io) = tokio::io::duplex(4096);
	let (err_tx, mut err_rx) = mpsc::unbounded_channel();
	let conn = MConn::new(conn_io, vec![descriptor(1)], |_, _| {}, move |err| drop(err_tx.send(err)), Config::default());
	conn.start().unwrap();

	peer_io.write_all(&frame_msg(2, true, b"hi")).await.unwrap();

	let err = timeout(Duration::from_millis(500), err_rx.recv()).await.expect("error within budget").expect("sink still open");
	assert!(matches!(err, MConnError::UnknownChannel(2)));
}

#[tokio::test]
async fn bad_encoding_is_fatal() {
	let (conn_io, mut peer_io) = tokio::io::duplex(4096);
	let (err_tx, mut err_rx) = mpsc::unbounded_channel();
	let conn = MConn::new(conn_io, vec![descriptor(1)], |_, _| {}, move |err| drop(err_tx.send(err)), Config::default());
	conn.start().unwrap();

	peer_io.write_all(&frame_garbage()).await.unwrap();

	let err = timeout(Duration::from_millis(500), err_rx.recv()).await.expect("error within budget").expect("sink still open");
	assert!(matches!(err, MConnError::BadEncoding(_)));
}

#[tokio::test]
async fn oversize_payload_is_fatal() {
	let (conn_io, mut peer_io) = tokio::io::duplex(8192);
	let (err_tx, mut err_rx) = mpsc::unbounded_channel();
	let conn = MConn::new(conn_io, vec![descriptor(1)], |_, _| {}, move |err| drop(err_tx.send(err)), Config::default());
	conn.start().unwrap();

	let oversize = vec![0u8; Config::default().max_packet_msg_payload_size + 100];
	peer_io.write_all(&frame_msg(1, true, &oversize)).await.unwrap();

	let err = timeout(Duration::from_millis(500), err_rx.recv()).await.expect("error within budget").expect("sink still open");
	assert!(matches!(err, MConnError::MessageTooLong { .. }));
}

#[tokio::test]
async fn channel_id_above_u8_range_is_unknown_channel() {
	let (conn_io, mut peer_io) = tokio::io::duplex(4096);
	let (err_tx, mut err_rx) = mpsc::unbounded_channel();
	let conn = MConn::new(conn_io, vec![descriptor(1)], |_, _| {}, move |err| drop(err_tx.send(err)), Config::default());
	conn.start().unwrap();

	peer_io.write_all(&frame_msg(1025, true, &[])).await.unwrap();

	let err = timeout(Duration::from_millis(500), err_rx.recv()).await.expect("error within budget").expect("sink still open");
	assert!(matches!(err, MConnError::UnknownChannel(1025)));
}

#[tokio::test(start_paused = true)]
async fn pong_timeout_reports_error_and_stops() {
	let (conn_io, _peer_io) = tokio::io::duplex(4096);
	let config = Config::builder().ping_interval(Duration::from_millis(20)).pong_timeout(Duration::from_millis(50)).build().unwrap();

	let (err_tx, mut err_rx) = mpsc::unbounded_channel();
	let conn = MConn::new(conn_io, vec![descriptor(1)], |_, _| {}, move |err| drop(err_tx.send(err)), config);
	conn.start().unwrap();

	tokio::time::advance(Duration::from_millis(100)).await;

	let err = timeout(Duration::from_millis(200), err_rx.recv()).await.expect("error within budget").expect("sink still open");
	assert!(matches!(err, MConnError::PongTimeout));
	assert!(!conn.is_running());
}

#[tokio::test(start_paused = true)]
async fn unsolicited_pong_burst_is_tolerated() {
	let (conn_io, mut peer_io) = tokio::io::duplex(4096);
	// ping_interval far longer than the test so only the burst itself is
	// under test, not a real ping/pong round trip racing the flush timer.
	let config = Config::builder().ping_interval(Duration::from_secs(3600)).pong_timeout(Duration::from_millis(100)).build().unwrap();

	let (err_tx, mut err_rx) = mpsc::unbounded_channel();
	let conn = MConn::new(conn_io, vec![descriptor(1)], |_, _| {}, move |err| drop(err_tx.send(err)), config);
	conn.start().unwrap();

	for _ in 0..3 {
		peer_io.write_all(&PONG_FRAME).await.unwrap();
	}

	tokio::time::advance(Duration::from_millis(500)).await;

	assert!(timeout(Duration::from_millis(20), err_rx.recv()).await.is_err());
	assert!(conn.is_running());
}
