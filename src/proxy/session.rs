// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-client session: a linear state machine that drives one request at
//! a time from the client socket to a shard and back.
//!
//! ```text
//! INIT → RECV → PARSE → PREV → ROUTE → ACQUIRE → SEND → READ → RESPOND → INIT
//!                        │                                         ↑
//!                        └────── (getLastError shortcut) ──────────┘
//! ```
//!
//! Writes are followed by an auto-generated getLastError query on the
//! same upstream socket; the reply is cached in the session and served
//! to the client's own getLastError probe without touching the upstream.
//! Replies carrying a cursor id pin that cursor to the upstream host so
//! OP_GET_MORE continuations land on the same member.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::{BufReader, BufWriter},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    cluster::router::RouterManager,
    error::{ProxyError, Result},
    pool::{conn::UpstreamConn, pool::ConnPool},
    protocol::{
        codec::{self, RawMessage},
        gle,
        header::{HEADER_LEN, REPLY_PREFIX_LEN, ReplyPrefix},
        opcode::Opcode,
        request::{ParsedRequest, RequestOp, parse_request},
    },
    proxy::proxy::ProxyStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Recv,
    Parse,
    Prev,
    Route,
    Acquire,
    Send,
    Read,
    Respond,
    Err,
}

/// Single-slot cache of the last getLastError reply, overwritten by every
/// proxied write.
struct GleCache {
    header_bytes: [u8; HEADER_LEN],
    body: Bytes,
    valid: bool,
}

impl GleCache {
    fn empty() -> Self {
        Self {
            header_bytes: [0u8; HEADER_LEN],
            body: Bytes::new(),
            valid: false,
        }
    }
}

/// Where a server-side cursor lives, and the pool eviction epoch of that
/// host at pin time. A later eviction invalidates the pin.
struct CursorPin {
    host: String,
    epoch: u64,
}

struct SessionLimits {
    max_req_size: usize,
    max_res_size: usize,
    client_timeout: std::time::Duration,
}

pub struct Session {
    id: i64,
    peer: String,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    router: Arc<RouterManager>,
    pool: Arc<ConnPool>,
    limits: SessionLimits,
    state: SessionState,
    req_count: u64,
    gle_cache: GleCache,
    cursors: HashMap<i64, CursorPin>,
    stats: Arc<ProxyStats>,
}

impl Session {
    pub fn new(
        id: i64,
        stream: TcpStream,
        router: Arc<RouterManager>,
        pool: Arc<ConnPool>,
        cfg: &Config,
        stats: Arc<ProxyStats>,
    ) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (r, w) = stream.into_split();
        Self {
            id,
            peer,
            reader: BufReader::new(r),
            writer: BufWriter::new(w),
            router,
            pool,
            limits: SessionLimits {
                max_req_size: cfg.proxy.max_req_size,
                max_res_size: cfg.proxy.max_res_size,
                client_timeout: cfg.proxy.client_timeout,
            },
            state: SessionState::Init,
            req_count: 0,
            gle_cache: GleCache::empty(),
            cursors: HashMap::new(),
            stats,
        }
    }

    /// Serve requests until the client disconnects or a fatal error.
    pub async fn run(mut self) {
        info!(session = self.id, peer = %self.peer, "new client");
        self.stats.session_opened();

        loop {
            self.state = SessionState::Init;
            match self.handle_one().await {
                Ok(()) => continue,
                Err(e) if e.fatal_to_session() => {
                    self.state = SessionState::Err;
                    debug!(session = self.id, peer = %self.peer, error = %e,
                        "closing session");
                    break;
                },
                Err(e) => {
                    // No upstream byte was written; the client wire position
                    // is intact and the session keeps serving.
                    warn!(session = self.id, error = %e, "request aborted");
                    continue;
                },
            }
        }

        self.stats.session_closed(self.req_count);
        info!(session = self.id, peer = %self.peer, requests = self.req_count,
            "session closed");
    }

    async fn handle_one(&mut self) -> Result<()> {
        self.state = SessionState::Recv;
        let msg = codec::read_message(
            &mut self.reader,
            self.limits.max_req_size,
            self.limits.client_timeout,
            true,
        )
        .await?;
        self.req_count += 1;
        self.stats.request_seen();

        self.state = SessionState::Parse;
        let opcode = msg
            .header
            .opcode()
            .map_err(|e| ProxyError::UnsupportedOpcode(e.0))?;
        if !opcode.is_accepted() {
            return Err(ProxyError::UnsupportedOpcode(opcode as i32));
        }
        let req = parse_request(opcode, &msg.body)?;
        debug!(session = self.id, ?opcode, ns = %req.ns, len = msg.total_len(),
            "request");

        self.state = SessionState::Prev;
        if self.try_gle_shortcut(&msg, &req).await? {
            return Ok(());
        }

        let mut upstream = match self.acquire(&req).await {
            Ok(conn) => conn,
            Err(e) => {
                if opcode.is_write() {
                    self.gle_cache.valid = false;
                }
                return Err(e);
            },
        };

        self.state = SessionState::Send;
        if let Err(e) = self.send_upstream(&mut upstream, &msg, opcode, &req).await {
            if opcode.is_write() {
                self.gle_cache.valid = false;
            }
            self.pool.release(upstream, false);
            return Err(e);
        }

        self.state = SessionState::Read;
        let reply = match upstream.read_reply(self.limits.max_res_size).await {
            Ok(r) => r,
            Err(e) => {
                if opcode.is_write() {
                    self.gle_cache.valid = false;
                }
                self.pool.release(upstream, false);
                return Err(e);
            },
        };

        self.state = SessionState::Respond;
        self.pin_cursor(&req, &reply, &upstream.host);
        self.pool.release(upstream, true);

        match opcode {
            Opcode::Query | Opcode::GetMore => {
                codec::write_message(
                    &mut self.writer,
                    &reply.header_bytes,
                    &reply.body,
                    self.limits.client_timeout,
                )
                .await?;
            },
            _ => {
                self.gle_cache = GleCache {
                    header_bytes: reply.header_bytes,
                    body: reply.body,
                    valid: true,
                };
            },
        }

        Ok(())
    }

    /// The getLastError shortcut: a `$cmd` query carrying the
    /// getLastError key is answered from the session cache (or a
    /// synthesized success when nothing has been cached yet) and never
    /// reaches an upstream.
    async fn try_gle_shortcut(
        &mut self,
        msg: &RawMessage,
        req: &ParsedRequest,
    ) -> Result<bool> {
        let RequestOp::Query { query, .. } = &req.op else {
            return Ok(false);
        };
        if !req.ns.ends_with("$cmd") || !query.contains_key(gle::GLE_KEY) {
            return Ok(false);
        }

        if self.gle_cache.valid {
            let header_bytes = self.gle_cache.header_bytes;
            let body = self.gle_cache.body.clone();
            codec::write_message(
                &mut self.writer,
                &header_bytes,
                &body,
                self.limits.client_timeout,
            )
            .await?;
        } else {
            debug!(session = self.id, "no getLastError reply cached, synthesizing");
            let (header_bytes, body) =
                gle::synth_gle_reply(msg.header.request_id.get());
            codec::write_message(
                &mut self.writer,
                &header_bytes,
                &body,
                self.limits.client_timeout,
            )
            .await?;
        }
        Ok(true)
    }

    /// ROUTE + ACQUIRE. Cursor continuations bypass the router and go to
    /// the pinned host; everything else asks the router for a set and the
    /// pool for a member of it.
    async fn acquire(&mut self, req: &ParsedRequest) -> Result<UpstreamConn> {
        self.state = SessionState::Route;

        if let Some(cursor_id) = req.cursor_id() {
            let pin = self
                .cursors
                .get(&cursor_id)
                .ok_or(ProxyError::CursorMissing(cursor_id))?;
            if self.pool.eviction_epoch(&pin.host) != pin.epoch {
                warn!(session = self.id, cursor_id, host = %pin.host,
                    "cursor host was evicted, pin dropped");
                self.cursors.remove(&cursor_id);
                return Err(ProxyError::CursorMissing(cursor_id));
            }
            let host = pin.host.clone();
            self.state = SessionState::Acquire;
            return self.pool.get_by_host(&host).await;
        }

        let set_name = self.router.query_shard(&req.ns, req.shard_key())?;
        self.state = SessionState::Acquire;
        self.pool.get(&set_name, req.slave_ok()).await
    }

    /// SEND: forward the client message verbatim; writes get the
    /// getLastError follow-up on the same socket with no intervening read.
    async fn send_upstream(
        &self,
        upstream: &mut UpstreamConn,
        msg: &RawMessage,
        opcode: Opcode,
        req: &ParsedRequest,
    ) -> Result<()> {
        upstream.write_frame(&msg.header_bytes, &msg.body).await?;
        if opcode.is_write() {
            let follow_up =
                gle::build_get_last_error(&req.cmd_ns(), msg.header.request_id.get());
            upstream.write_raw(&follow_up).await?;
        }
        Ok(())
    }

    /// Record `cursorID → host` for any reply carrying a live cursor, and
    /// drop the pin once a continuation reports the cursor exhausted.
    fn pin_cursor(&mut self, req: &ParsedRequest, reply: &RawMessage, host: &str) {
        if reply.body.len() < REPLY_PREFIX_LEN {
            return;
        }
        let Ok(prefix) = ReplyPrefix::parse(&reply.body) else {
            return;
        };

        let reply_cursor = prefix.cursor_id.get();
        if reply_cursor != 0 {
            self.cursors.insert(
                reply_cursor,
                CursorPin {
                    host: host.to_string(),
                    epoch: self.pool.eviction_epoch(host),
                },
            );
            debug!(session = self.id, cursor_id = reply_cursor, host, "cursor pinned");
        } else if let Some(request_cursor) = req.cursor_id() {
            if self.cursors.remove(&request_cursor).is_some() {
                debug!(session = self.id, cursor_id = request_cursor,
                    "cursor exhausted, pin dropped");
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}
