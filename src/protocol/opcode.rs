// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Operation codes of the MongoDB legacy wire protocol.
//!
//! Every message starts with a 16-byte header whose last field is a
//! little-endian `int32` opcode. The proxy accepts the five legacy CRUD
//! opcodes, recognizes `OP_REPLY` on the reply path, and refuses
//! everything else (`OP_MSG`, `OP_KILL_CURSORS`, reserved values).

use std::convert::TryFrom;

use thiserror::Error;

/// All opcodes this proxy knows about.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Reply = 1,
    Msg = 1000,
    Update = 2001,
    Insert = 2002,
    Reserved = 2003,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl Opcode {
    #[inline]
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => Self::Reply,
            1000 => Self::Msg,
            2001 => Self::Update,
            2002 => Self::Insert,
            2003 => Self::Reserved,
            2004 => Self::Query,
            2005 => Self::GetMore,
            2006 => Self::Delete,
            2007 => Self::KillCursors,
            _ => return None,
        })
    }

    /// Opcodes the request pipeline accepts for parsing and routing.
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Self::Update | Self::Insert | Self::Query | Self::GetMore | Self::Delete
        )
    }

    /// Write operations get a getLastError follow-up on the same socket.
    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Update | Self::Insert | Self::Delete)
    }
}

/// Returned when the header carries an opcode value outside the protocol.
#[derive(Debug, Error)]
#[error("invalid opcode: {0}")]
pub struct UnknownOpcode(pub i32);

impl TryFrom<i32> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Opcode::from_i32(v).ok_or(UnknownOpcode(v))
    }
}
