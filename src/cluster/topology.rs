// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Replica-set topology.
//!
//! Membership is seeded from configuration. A background task probes TCP
//! reachability of every member on `TopoCheckInterval` and flips per-member
//! health flags; the pool consults the resulting snapshots when picking a
//! member to dial.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cfg::config::ClusterConfig;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

#[derive(Debug)]
struct Member {
    host: String,
    role: Role,
    healthy: AtomicBool,
}

#[derive(Debug)]
struct ReplicaSet {
    members: Vec<Arc<Member>>,
}

/// Point-in-time view of one member, handed to the pool.
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub host: String,
    pub role: Role,
    pub healthy: bool,
}

pub struct ClusterManager {
    sets: DashMap<String, Arc<ReplicaSet>>,
    probe_interval: Duration,
}

impl ClusterManager {
    pub fn new(cfg: &ClusterConfig) -> Self {
        let sets = DashMap::new();
        for set in &cfg.sets {
            let members = set
                .members
                .iter()
                .map(|m| {
                    Arc::new(Member {
                        host: m.host.clone(),
                        role: m.role,
                        // Optimistic until the first probe says otherwise.
                        healthy: AtomicBool::new(true),
                    })
                })
                .collect();
            sets.insert(set.name.clone(), Arc::new(ReplicaSet { members }));
        }
        Self {
            sets,
            probe_interval: cfg.topo_check_interval,
        }
    }

    /// Current membership of a set, or `None` for an unknown set name.
    pub fn members(&self, set_name: &str) -> Option<Vec<MemberSnapshot>> {
        let set = self.sets.get(set_name)?;
        Some(
            set.members
                .iter()
                .map(|m| MemberSnapshot {
                    host: m.host.clone(),
                    role: m.role,
                    healthy: m.healthy.load(Ordering::Relaxed),
                })
                .collect(),
        )
    }

    /// Reverse lookup: which `(set, role)` owns this host, if any.
    pub fn locate(&self, host: &str) -> Option<(String, Role)> {
        for entry in self.sets.iter() {
            if let Some(m) = entry.value().members.iter().find(|m| m.host == host) {
                return Some((entry.key().clone(), m.role));
            }
        }
        None
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    /// Spawn the health probe loop; it runs until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(mgr.probe_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {},
                }
                mgr.probe_all().await;
            }
        });
    }

    async fn probe_all(&self) {
        let members: Vec<Arc<Member>> = self
            .sets
            .iter()
            .flat_map(|e| e.value().members.iter().cloned().collect::<Vec<_>>())
            .collect();

        for member in members {
            let reachable =
                matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(&member.host)).await, Ok(Ok(_)));
            let was = member.healthy.swap(reachable, Ordering::Relaxed);
            if was != reachable {
                if reachable {
                    debug!(host = %member.host, "member back to healthy");
                } else {
                    warn!(host = %member.host, "member unreachable, marking unhealthy");
                }
            }
        }
    }
}
