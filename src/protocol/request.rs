// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-opcode request body parsers.
//!
//! Each accepted opcode has one handler that extracts exactly the fields
//! the pipeline needs for routing: the namespace, the flag word, and the
//! shard-key document (or the cursor id for OP_GET_MORE). Parsing is
//! strict: trailing bytes after the declared fields are refused, which is
//! also what keeps multi-document OP_INSERT out.
//!
//! Field order per opcode:
//!
//! ```text
//! OP_UPDATE    int32 ZERO; cstring ns; int32 flags; doc selector; doc update
//! OP_INSERT    int32 flags; cstring ns; doc
//! OP_QUERY     int32 flags; cstring ns; int32 skip; int32 return; doc query; [doc fields]
//! OP_GET_MORE  int32 ZERO; cstring ns; int32 return; int64 cursorID
//! OP_DELETE    int32 ZERO; cstring ns; int32 flags; doc selector
//! ```

use bitflags::bitflags;
use bson::Document;
use enum_dispatch::enum_dispatch;

use crate::{
    error::{ProxyError, Result},
    protocol::opcode::Opcode,
};

bitflags! {
    /// OP_QUERY flag bits. Only `SLAVE_OK` affects routing; the rest are
    /// forwarded untouched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: i32 {
        const TAILABLE_CURSOR   = 0x02;
        const SLAVE_OK          = 0x04;
        const OPLOG_REPLAY      = 0x08;
        const NO_CURSOR_TIMEOUT = 0x10;
        const AWAIT_DATA        = 0x20;
        const EXHAUST           = 0x40;
        const PARTIAL           = 0x80;
    }
}

/// The routing-relevant view of one parsed request.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// `"<db>.<collection>"`, NUL-terminated on the wire.
    pub ns: String,
    /// The opcode's flag word (zero for opcodes that have none).
    pub flags: i32,
    pub op: RequestOp,
}

#[derive(Debug, Clone)]
pub enum RequestOp {
    Update { selector: Document },
    Insert { doc: Document },
    Query { skip: i32, n_return: i32, query: Document },
    GetMore { n_return: i32, cursor_id: i64 },
    Delete { selector: Document },
}

impl ParsedRequest {
    /// The document whose top-level fields drive shard routing.
    pub fn shard_key(&self) -> Option<&Document> {
        match &self.op {
            RequestOp::Update { selector } | RequestOp::Delete { selector } => {
                Some(selector)
            },
            RequestOp::Insert { doc } => Some(doc),
            RequestOp::Query { query, .. } => Some(query),
            RequestOp::GetMore { .. } => None,
        }
    }

    pub fn cursor_id(&self) -> Option<i64> {
        match self.op {
            RequestOp::GetMore { cursor_id, .. } => Some(cursor_id),
            _ => None,
        }
    }

    /// Queries flagged slave-ok may be served by a secondary; every other
    /// opcode goes to the primary.
    pub fn slave_ok(&self) -> bool {
        matches!(self.op, RequestOp::Query { .. })
            && QueryFlags::from_bits_truncate(self.flags)
                .contains(QueryFlags::SLAVE_OK)
    }

    /// `"<db>.$cmd"`, derived from the prefix of `ns` up to the first dot.
    pub fn cmd_ns(&self) -> String {
        cmd_ns(&self.ns)
    }
}

/// Derive the command namespace of a collection namespace. The parser
/// guarantees `ns` contains a dot with a non-empty database prefix.
pub fn cmd_ns(ns: &str) -> String {
    let db = ns.split('.').next().unwrap_or(ns);
    format!("{db}.$cmd")
}

/// Sequential reader over a request body.
struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_i32(&mut self, what: &str) -> Result<i32> {
        let raw: [u8; 4] = self
            .buf
            .get(self.pos..self.pos + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| ProxyError::Parse(format!("truncated {what}")))?;
        self.pos += 4;
        Ok(i32::from_le_bytes(raw))
    }

    fn read_i64(&mut self, what: &str) -> Result<i64> {
        let raw: [u8; 8] = self
            .buf
            .get(self.pos..self.pos + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| ProxyError::Parse(format!("truncated {what}")))?;
        self.pos += 8;
        Ok(i64::from_le_bytes(raw))
    }

    /// NUL-terminated namespace string. Validated to look like
    /// `"<db>.<collection>"` with a non-empty database prefix.
    fn read_ns(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProxyError::Parse("no namespace found in request".into()))?;
        let ns = std::str::from_utf8(&rest[..nul])
            .map_err(|_| ProxyError::Parse("namespace is not valid utf-8".into()))?
            .to_string();
        self.pos += nul + 1;

        match ns.find('.') {
            Some(dot) if dot > 0 && dot + 1 < ns.len() => Ok(ns),
            _ => Err(ProxyError::Parse(format!("bad namespace {ns:?}"))),
        }
    }

    /// One length-prefixed BSON document, decoded to its top-level keys.
    fn read_document(&mut self, what: &str) -> Result<Document> {
        let len = self.read_i32(what)?;
        if len < 5 {
            return Err(ProxyError::Parse(format!("bad {what} length {len}")));
        }
        let start = self.pos - 4;
        let end = start + len as usize;
        let raw = self
            .buf
            .get(start..end)
            .ok_or_else(|| ProxyError::Parse(format!("truncated {what}")))?;
        let doc = Document::from_reader(raw)
            .map_err(|e| ProxyError::Parse(format!("bad {what}: {e}")))?;
        self.pos = end;
        Ok(doc)
    }

    fn expect_empty(&self, opcode: Opcode) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProxyError::Parse(format!(
                "{} trailing bytes after {opcode:?} fields",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[enum_dispatch]
pub trait OpHandler {
    fn handle(&self, body: &[u8]) -> Result<ParsedRequest>;
}

pub struct UpdateHandler;
pub struct InsertHandler;
pub struct QueryHandler;
pub struct GetMoreHandler;
pub struct DeleteHandler;

impl OpHandler for UpdateHandler {
    fn handle(&self, body: &[u8]) -> Result<ParsedRequest> {
        let mut r = BodyReader::new(body);
        r.read_i32("reserved")?;
        let ns = r.read_ns()?;
        let flags = r.read_i32("flags")?;
        let selector = r.read_document("selector")?;
        r.read_document("update document")?;
        r.expect_empty(Opcode::Update)?;
        Ok(ParsedRequest {
            ns,
            flags,
            op: RequestOp::Update { selector },
        })
    }
}

impl OpHandler for InsertHandler {
    fn handle(&self, body: &[u8]) -> Result<ParsedRequest> {
        let mut r = BodyReader::new(body);
        let flags = r.read_i32("flags")?;
        let ns = r.read_ns()?;
        let doc = r.read_document("document")?;
        if r.remaining() != 0 {
            return Err(ProxyError::Parse(
                "multi-document insert not supported".into(),
            ));
        }
        Ok(ParsedRequest {
            ns,
            flags,
            op: RequestOp::Insert { doc },
        })
    }
}

impl OpHandler for QueryHandler {
    fn handle(&self, body: &[u8]) -> Result<ParsedRequest> {
        let mut r = BodyReader::new(body);
        let flags = r.read_i32("flags")?;
        let ns = r.read_ns()?;
        let skip = r.read_i32("numberToSkip")?;
        let n_return = r.read_i32("numberToReturn")?;
        let query = r.read_document("query")?;
        if r.remaining() > 0 {
            // Optional returnFieldSelector; nothing may follow it.
            r.read_document("field selector")?;
        }
        r.expect_empty(Opcode::Query)?;
        Ok(ParsedRequest {
            ns,
            flags,
            op: RequestOp::Query {
                skip,
                n_return,
                query,
            },
        })
    }
}

impl OpHandler for GetMoreHandler {
    fn handle(&self, body: &[u8]) -> Result<ParsedRequest> {
        let mut r = BodyReader::new(body);
        r.read_i32("reserved")?;
        let ns = r.read_ns()?;
        let n_return = r.read_i32("numberToReturn")?;
        let cursor_id = r.read_i64("cursorID")?;
        r.expect_empty(Opcode::GetMore)?;
        Ok(ParsedRequest {
            ns,
            flags: 0,
            op: RequestOp::GetMore {
                n_return,
                cursor_id,
            },
        })
    }
}

impl OpHandler for DeleteHandler {
    fn handle(&self, body: &[u8]) -> Result<ParsedRequest> {
        let mut r = BodyReader::new(body);
        r.read_i32("reserved")?;
        let ns = r.read_ns()?;
        let flags = r.read_i32("flags")?;
        let selector = r.read_document("selector")?;
        r.expect_empty(Opcode::Delete)?;
        Ok(ParsedRequest {
            ns,
            flags,
            op: RequestOp::Delete { selector },
        })
    }
}

#[enum_dispatch(OpHandler)]
pub enum RequestHandler {
    Update(UpdateHandler),
    Insert(InsertHandler),
    Query(QueryHandler),
    GetMore(GetMoreHandler),
    Delete(DeleteHandler),
}

impl RequestHandler {
    pub fn for_opcode(op: Opcode) -> Result<Self> {
        Ok(match op {
            Opcode::Update => UpdateHandler.into(),
            Opcode::Insert => InsertHandler.into(),
            Opcode::Query => QueryHandler.into(),
            Opcode::GetMore => GetMoreHandler.into(),
            Opcode::Delete => DeleteHandler.into(),
            other => return Err(ProxyError::UnsupportedOpcode(other as i32)),
        })
    }
}

/// Dispatch one request body to its opcode's handler.
pub fn parse_request(op: Opcode, body: &[u8]) -> Result<ParsedRequest> {
    RequestHandler::for_opcode(op)?.handle(body)
}
