// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

use crate::{
    cluster::topology::Role,
    error::{ProxyError, Result},
    protocol::codec::{self, RawMessage},
};

/// One TCP connection to a replica-set member.
///
/// Owned by the pool while idle and by exactly one session while checked
/// out. All socket operations run under the upstream deadline.
#[derive(Debug)]
pub struct UpstreamConn {
    stream: TcpStream,
    pub set_name: String,
    pub role: Role,
    /// `"host:port"` of the member; also the cursor-pin key.
    pub host: String,
    io_timeout: Duration,
}

impl UpstreamConn {
    pub async fn connect(
        host: &str,
        set_name: &str,
        role: Role,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(host)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(ProxyError::Pool(format!("connect {host}: {e}")));
            },
            Err(_) => {
                return Err(ProxyError::Pool(format!("connect {host} timed out")));
            },
        };
        stream
            .set_nodelay(true)
            .map_err(|e| ProxyError::Pool(format!("connect {host}: {e}")))?;
        debug!(host, set_name, ?role, "dialed upstream");

        Ok(Self {
            stream,
            set_name: set_name.to_string(),
            role,
            host: host.to_string(),
            io_timeout,
        })
    }

    /// Forward one already-framed message.
    pub async fn write_frame(&mut self, header_bytes: &[u8], body: &[u8]) -> Result<()> {
        codec::write_message(&mut self.stream, header_bytes, body, self.io_timeout)
            .await
            .map_err(upstream_io)
    }

    /// Write a pre-assembled message (header and body in one buffer).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        codec::write_message(&mut self.stream, bytes, &[], self.io_timeout)
            .await
            .map_err(upstream_io)
    }

    /// Read exactly one reply message.
    pub async fn read_reply(&mut self, max_len: usize) -> Result<RawMessage> {
        codec::read_message(&mut self.stream, max_len, self.io_timeout, false)
            .await
            .map_err(upstream_io)
    }
}

/// Codec failures on an upstream socket are upstream I/O errors, not
/// client framing errors.
fn upstream_io(e: ProxyError) -> ProxyError {
    match e {
        ProxyError::Framing(msg) => ProxyError::UpstreamIo(msg),
        other => other,
    }
}
