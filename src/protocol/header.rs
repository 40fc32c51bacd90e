// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire-safe, zero-copy views of the fixed message framing.
//!
//! The layout is defined by the legacy MongoDB wire protocol:
//!
//! ```text
//! int32 messageLength   total bytes, header included
//! int32 requestID
//! int32 responseTo
//! int32 opCode
//! ```
//!
//! followed, for `OP_REPLY`, by a 20-byte reply prefix:
//!
//! ```text
//! int32 responseFlags
//! int64 cursorID
//! int32 startingFrom
//! int32 numberReturned
//! ```
//!
//! All integers are little-endian two's complement.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{I32, I64},
};

use crate::{
    error::ProxyError,
    protocol::opcode::{Opcode, UnknownOpcode},
};

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Fixed length of the OP_REPLY prefix that follows the header.
pub const REPLY_PREFIX_LEN: usize = 20;

#[repr(C)]
#[derive(
    FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug, Default, PartialEq,
    Eq,
)]
pub struct MsgHeader {
    pub message_length: I32,
    pub request_id: I32,
    pub response_to: I32,
    pub op_code: I32,
}

impl MsgHeader {
    pub fn new(message_length: i32, request_id: i32, response_to: i32, op: Opcode) -> Self {
        Self {
            message_length: I32::new(message_length),
            request_id: I32::new(request_id),
            response_to: I32::new(response_to),
            op_code: I32::new(op as i32),
        }
    }

    /// Decode from exactly [`HEADER_LEN`] bytes.
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        // Infallible: the buffer length is the struct size and alignment is 1.
        MsgHeader::read_from_bytes(buf.as_slice()).unwrap_or_default()
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }

    pub fn opcode(&self) -> Result<Opcode, UnknownOpcode> {
        Opcode::try_from(self.op_code.get())
    }

    /// Body length implied by `messageLength`, after the caller has
    /// validated the range against the configured maximum.
    pub fn body_len(&self) -> usize {
        (self.message_length.get() as usize).saturating_sub(HEADER_LEN)
    }
}

#[repr(C)]
#[derive(
    FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug, Default, PartialEq,
    Eq,
)]
pub struct ReplyPrefix {
    pub response_flags: I32,
    pub cursor_id: I64,
    pub starting_from: I32,
    pub number_returned: I32,
}

impl ReplyPrefix {
    /// Decode the first [`REPLY_PREFIX_LEN`] bytes of a reply body.
    pub fn parse(body: &[u8]) -> Result<Self, ProxyError> {
        let raw: &[u8; REPLY_PREFIX_LEN] =
            body.get(..REPLY_PREFIX_LEN)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| {
                    ProxyError::UpstreamIo(format!(
                        "reply body too short for prefix: {} bytes",
                        body.len()
                    ))
                })?;
        Ok(ReplyPrefix::read_from_bytes(raw.as_slice()).unwrap_or_default())
    }

    pub fn to_bytes(self) -> [u8; REPLY_PREFIX_LEN] {
        let mut out = [0u8; REPLY_PREFIX_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }
}
