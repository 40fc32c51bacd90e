// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Everything that can go wrong while driving one client request through
/// the pipeline. The variants mirror the places a request can die:
/// framing the message, parsing the body, routing, borrowing an upstream
/// socket, or talking to the upstream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("framing: {0}")]
    Framing(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(i32),

    #[error("route: {0}")]
    Route(String),

    #[error("pool: {0}")]
    Pool(String),

    #[error("upstream i/o: {0}")]
    UpstreamIo(String),

    #[error("unknown cursor id {0}")]
    CursorMissing(i64),
}

impl ProxyError {
    /// A pool failure happens before any byte reaches the upstream, so the
    /// client's wire position is still coherent and the session may serve
    /// the next request. Everything else leaves either the client or the
    /// upstream stream in an unknown position and closes the session.
    pub fn fatal_to_session(&self) -> bool {
        !matches!(self, ProxyError::Pool(_))
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
