// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Upstream connection pool.
//!
//! Idle connections are kept per `(set, role)` in bounded lists. Checkout
//! is atomic: the DashMap shard lock is held across the list pop, never
//! across I/O, so two concurrent `get` calls can never observe the same
//! idle connection. A checked-out connection is owned by exactly one
//! session until released.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{
    cfg::config::PoolConfig,
    cluster::topology::{ClusterManager, MemberSnapshot, Role},
    error::{ProxyError, Result},
    pool::conn::UpstreamConn,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub set: String,
    pub role: Role,
}

pub struct ConnPool {
    cluster: Arc<ClusterManager>,
    idle: DashMap<PoolKey, Vec<UpstreamConn>>,
    /// Bumped on every `evict(host)`; cursor pins remember the epoch they
    /// were created under and refuse to continue across an eviction.
    evictions: DashMap<String, u64>,
    capacity: usize,
    connect_timeout: Duration,
    io_timeout: Duration,
    rr: AtomicUsize,
}

impl ConnPool {
    pub fn new(cluster: Arc<ClusterManager>, cfg: &PoolConfig) -> Self {
        Self {
            cluster,
            idle: DashMap::new(),
            evictions: DashMap::new(),
            capacity: cfg.conn_pool_size,
            connect_timeout: cfg.connect_timeout,
            io_timeout: cfg.mongo_timeout,
            rr: AtomicUsize::new(0),
        }
    }

    /// Borrow a connection to `set_name`: the primary unless `slave_ok`,
    /// in which case healthy secondaries are preferred round-robin with
    /// the primary as fallback.
    pub async fn get(&self, set_name: &str, slave_ok: bool) -> Result<UpstreamConn> {
        let members = self
            .cluster
            .members(set_name)
            .ok_or_else(|| ProxyError::Pool(format!("unknown set {set_name:?}")))?;

        let (host, role) = self.pick_member(set_name, &members, slave_ok)?;
        let key = PoolKey {
            set: set_name.to_string(),
            role,
        };

        let healthy: Vec<&str> = members
            .iter()
            .filter(|m| m.healthy && m.role == role)
            .map(|m| m.host.as_str())
            .collect();
        if let Some(conn) = self.checkout(&key, |c| healthy.contains(&c.host.as_str())) {
            return Ok(conn);
        }

        UpstreamConn::connect(&host, set_name, role, self.connect_timeout, self.io_timeout)
            .await
    }

    /// Borrow a connection to the exact host, dialing one on a pool miss.
    /// Used only for cursor continuations.
    pub async fn get_by_host(&self, host: &str) -> Result<UpstreamConn> {
        let keys: Vec<PoolKey> = self.idle.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some(conn) = self.checkout(&key, |c| c.host == host) {
                return Ok(conn);
            }
        }

        let (set_name, role) = self
            .cluster
            .locate(host)
            .ok_or_else(|| ProxyError::Pool(format!("host {host:?} not in topology")))?;
        UpstreamConn::connect(host, &set_name, role, self.connect_timeout, self.io_timeout)
            .await
    }

    /// Return a borrowed connection. Unhealthy connections are dropped on
    /// the floor (closing the socket); healthy ones go back to their idle
    /// list unless the list is already at capacity.
    pub fn release(&self, conn: UpstreamConn, healthy: bool) {
        if !healthy {
            warn!(host = %conn.host, "dropping unhealthy upstream connection");
            return;
        }
        let key = PoolKey {
            set: conn.set_name.clone(),
            role: conn.role,
        };
        let mut list = self.idle.entry(key).or_default();
        if list.len() < self.capacity {
            list.push(conn);
        } else {
            debug!(host = %conn.host, "idle list full, closing connection");
        }
    }

    /// Close all idle connections to a host and bump its eviction epoch so
    /// sessions can invalidate cursor pins referring to it.
    pub fn evict(&self, host: &str) {
        let mut dropped = 0usize;
        for mut entry in self.idle.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|c| c.host != host);
            dropped += before - entry.value().len();
        }
        *self.evictions.entry(host.to_string()).or_insert(0) += 1;
        warn!(host, dropped, "evicted host from pool");
    }

    pub fn eviction_epoch(&self, host: &str) -> u64 {
        self.evictions.get(host).map(|e| *e).unwrap_or(0)
    }

    /// Idle list sizes per key, for the stats listener.
    pub fn idle_sizes(&self) -> Vec<(String, usize)> {
        self.idle
            .iter()
            .map(|e| {
                let key = e.key();
                (format!("{}/{:?}", key.set, key.role), e.value().len())
            })
            .collect()
    }

    fn checkout<F>(&self, key: &PoolKey, want: F) -> Option<UpstreamConn>
    where
        F: Fn(&UpstreamConn) -> bool,
    {
        let mut list = self.idle.get_mut(key)?;
        let pos = list.iter().position(want)?;
        Some(list.swap_remove(pos))
    }

    fn pick_member(
        &self,
        set_name: &str,
        members: &[MemberSnapshot],
        slave_ok: bool,
    ) -> Result<(String, Role)> {
        if slave_ok {
            let secondaries: Vec<&MemberSnapshot> = members
                .iter()
                .filter(|m| m.healthy && m.role == Role::Secondary)
                .collect();
            if !secondaries.is_empty() {
                let idx = self.rr.fetch_add(1, Ordering::Relaxed) % secondaries.len();
                return Ok((secondaries[idx].host.clone(), Role::Secondary));
            }
        }

        members
            .iter()
            .find(|m| m.healthy && m.role == Role::Primary)
            .map(|m| (m.host.clone(), Role::Primary))
            .ok_or_else(|| {
                ProxyError::Pool(format!("no healthy primary in set {set_name:?}"))
            })
    }
}
