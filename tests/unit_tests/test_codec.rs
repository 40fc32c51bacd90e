use std::time::Duration;

use mongo_proxy_rs::{
    error::ProxyError,
    protocol::{
        codec::{read_message, write_message},
        header::{HEADER_LEN, MsgHeader},
        opcode::Opcode,
    },
};
use tokio::io::AsyncWriteExt;

const MAX: usize = 16 * 1024 * 1024;
const IO: Duration = Duration::from_secs(2);

fn frame(op: Opcode, request_id: i32, body: &[u8]) -> Vec<u8> {
    let header = MsgHeader::new((HEADER_LEN + body.len()) as i32, request_id, 0, op);
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(body);
    out
}

#[tokio::test]
async fn round_trip_is_byte_exact() {
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    let body = b"some opaque request body".to_vec();
    let wire = frame(Opcode::Query, 77, &body);
    write_message(&mut client, &wire[..HEADER_LEN], &wire[HEADER_LEN..], IO)
        .await
        .expect("write");

    let msg = read_message(&mut server, MAX, IO, false).await.expect("read");
    assert_eq!(msg.header.request_id.get(), 77);
    assert_eq!(msg.header.opcode().expect("opcode"), Opcode::Query);
    assert_eq!(&msg.header_bytes[..], &wire[..HEADER_LEN]);
    assert_eq!(&msg.body[..], &wire[HEADER_LEN..]);

    // And back out again, unchanged.
    let (mut a, mut b) = tokio::io::duplex(64 * 1024);
    write_message(&mut a, &msg.header_bytes, &msg.body, IO)
        .await
        .expect("write back");
    let again = read_message(&mut b, MAX, IO, false).await.expect("read back");
    assert_eq!(again.header_bytes, msg.header_bytes);
    assert_eq!(again.body, msg.body);
}

#[tokio::test]
async fn empty_body_message() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let header = MsgHeader::new(HEADER_LEN as i32, 1, 0, Opcode::Query).to_bytes();
    write_message(&mut client, &header, &[], IO).await.expect("write");

    let msg = read_message(&mut server, MAX, IO, false).await.expect("read");
    assert!(msg.body.is_empty());
}

#[tokio::test]
async fn oversize_message_rejected_before_body() {
    let (mut client, mut server) = tokio::io::duplex(1024);

    let header = MsgHeader::new(32 * 1024 * 1024, 1, 0, Opcode::Query).to_bytes();
    client.write_all(&header).await.expect("send header");
    client.write_all(b"leftover").await.expect("send body");

    let err = read_message(&mut server, MAX, IO, false)
        .await
        .expect_err("oversize must fail");
    assert!(matches!(err, ProxyError::Framing(_)), "got {err:?}");

    // The body was not consumed.
    let mut rest = [0u8; 8];
    tokio::io::AsyncReadExt::read_exact(&mut server, &mut rest)
        .await
        .expect("body still buffered");
    assert_eq!(&rest, b"leftover");
}

#[tokio::test]
async fn undersize_length_rejected() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&8i32.to_le_bytes());
    client.write_all(&header).await.expect("send header");

    assert!(read_message(&mut server, MAX, IO, false).await.is_err());
}

#[tokio::test]
async fn closed_peer_is_a_framing_error() {
    let (client, mut server) = tokio::io::duplex(1024);
    drop(client);
    let err = read_message(&mut server, MAX, IO, true)
        .await
        .expect_err("eof must fail");
    assert!(matches!(err, ProxyError::Framing(_)));
}

#[tokio::test]
async fn stalled_message_times_out() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    // First header byte arrives, the rest never does.
    client.write_all(&[16u8]).await.expect("send one byte");

    let err = read_message(&mut server, MAX, Duration::from_millis(100), true)
        .await
        .expect_err("stall must time out");
    assert!(matches!(err, ProxyError::Framing(_)));
}

#[tokio::test]
async fn truncated_body_is_a_framing_error() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let header = MsgHeader::new(HEADER_LEN as i32 + 10, 1, 0, Opcode::Insert).to_bytes();
    client.write_all(&header).await.expect("send header");
    client.write_all(&[1, 2, 3]).await.expect("send partial body");
    drop(client);

    assert!(read_message(&mut server, MAX, IO, false).await.is_err());
}
