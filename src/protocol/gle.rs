// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! getLastError plumbing.
//!
//! After forwarding a write the proxy immediately sends a getLastError
//! query on the same upstream socket and caches the reply, so the
//! client's own getLastError round-trip can be answered locally. The
//! command body is marshalled once at startup and reused for every
//! write.

use bson::doc;
use bytes::Bytes;
use once_cell::sync::Lazy;
use zerocopy::little_endian::I32;

use crate::protocol::{
    header::{HEADER_LEN, MsgHeader, ReplyPrefix},
    opcode::Opcode,
};

/// Top-level key that marks a query document as a getLastError probe.
pub const GLE_KEY: &str = "getLastError";

/// `{getLastError: 1, j: true}` — journaled durability acknowledgement.
pub static GLE_BODY: Lazy<Bytes> = Lazy::new(|| {
    let body = bson::to_vec(&doc! { GLE_KEY: 1, "j": true })
        .expect("static getLastError document marshals");
    Bytes::from(body)
});

/// Build the complete follow-up getLastError query message.
///
/// `flags=0`, `skip=0`, `numberToReturn=1`, `responseTo=0` and
/// `requestID = request_id + 1` so the reply is distinguishable from the
/// write it trails.
pub fn build_get_last_error(cmd_ns: &str, request_id: i32) -> Vec<u8> {
    let body_len = 4 + cmd_ns.len() + 1 + 4 + 4 + GLE_BODY.len();
    let header = MsgHeader::new(
        (HEADER_LEN + body_len) as i32,
        request_id.wrapping_add(1),
        0,
        Opcode::Query,
    );

    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(cmd_ns.as_bytes());
    out.push(0);
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&1i32.to_le_bytes());
    out.extend_from_slice(&GLE_BODY);
    out
}

/// Synthesize a successful getLastError reply.
///
/// Used when a client asks for the last error before any write has been
/// proxied (or after a write died before reaching the upstream): there is
/// nothing cached, and leaving the client without a reply would hang it.
pub fn synth_gle_reply(response_to: i32) -> ([u8; HEADER_LEN], Bytes) {
    static OK_DOC: Lazy<Bytes> = Lazy::new(|| {
        Bytes::from(bson::to_vec(&doc! { "ok": 1.0 }).expect("static ok document marshals"))
    });

    let prefix = ReplyPrefix {
        number_returned: I32::new(1),
        ..Default::default()
    };

    let mut body = Vec::with_capacity(prefix.to_bytes().len() + OK_DOC.len());
    body.extend_from_slice(&prefix.to_bytes());
    body.extend_from_slice(&OK_DOC);

    let header = MsgHeader::new(
        (HEADER_LEN + body.len()) as i32,
        0,
        response_to,
        Opcode::Reply,
    );

    (header.to_bytes(), Bytes::from(body))
}
