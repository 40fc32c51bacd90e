// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Length-prefixed message framing over async sockets.
//!
//! Every read and write runs under a caller-supplied deadline. The one
//! exception is the wait for the first header byte of a client request:
//! a client is allowed to idle between requests indefinitely, but once
//! the first byte has been seen the rest of the message must arrive
//! within the deadline.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::{
    error::{ProxyError, Result},
    protocol::header::{HEADER_LEN, MsgHeader},
};

/// One framed message as it came off the wire: decoded header, the raw
/// header bytes (kept for verbatim forwarding), and the body.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub header: MsgHeader,
    pub header_bytes: [u8; HEADER_LEN],
    pub body: Bytes,
}

impl RawMessage {
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }
}

/// Run one socket future under a deadline, labelling the failure.
pub async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout(io_timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(ProxyError::Framing(format!("{label}: {e}"))),
        Err(_) => Err(ProxyError::Framing(format!("{label} timed out"))),
    }
}

/// Read exactly one message.
///
/// With `wait_idle` the first header byte is awaited without a deadline;
/// the remaining 15 header bytes and the body are then read under
/// `io_timeout`. `max_len` bounds `messageLength`; anything larger is
/// refused before a single body byte is consumed.
pub async fn read_message<R>(
    reader: &mut R,
    max_len: usize,
    io_timeout: Duration,
    wait_idle: bool,
) -> Result<RawMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_LEN];

    if wait_idle {
        let n = reader
            .read(&mut header_bytes[..1])
            .await
            .map_err(|e| ProxyError::Framing(format!("read header: {e}")))?;
        if n == 0 {
            return Err(ProxyError::Framing("connection closed".into()));
        }
        io_with_timeout(
            "read header",
            reader.read_exact(&mut header_bytes[1..]),
            io_timeout,
        )
        .await?;
    } else {
        io_with_timeout(
            "read header",
            reader.read_exact(&mut header_bytes),
            io_timeout,
        )
        .await?;
    }

    let header = MsgHeader::parse(&header_bytes);
    let message_length = header.message_length.get();
    if (message_length as usize) < HEADER_LEN || message_length as usize > max_len {
        return Err(ProxyError::Framing(format!(
            "bad message length {message_length} (max {max_len})"
        )));
    }

    let body_len = header.body_len();
    let mut body = BytesMut::zeroed(body_len);
    if body_len > 0 {
        io_with_timeout("read body", reader.read_exact(&mut body), io_timeout).await?;
    }

    Ok(RawMessage {
        header,
        header_bytes,
        body: body.freeze(),
    })
}

/// Write header bytes then body bytes under a deadline. A partial write
/// surfaces as an error from `write_all`.
pub async fn write_message<W>(
    writer: &mut W,
    header_bytes: &[u8],
    body: &[u8],
    io_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    io_with_timeout("write header", writer.write_all(header_bytes), io_timeout).await?;
    if !body.is_empty() {
        io_with_timeout("write body", writer.write_all(body), io_timeout).await?;
    }
    io_with_timeout("flush", writer.flush(), io_timeout).await
}
