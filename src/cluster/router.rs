// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Namespace → replica-set routing.
//!
//! Rules come from configuration: a single-set rule routes directly, a
//! multi-set rule hashes the canonical BSON bytes of the shard-key value
//! across its set list. Lookups are cached per `(ns, key)` and aged out
//! on `RouterCheckInterval` by a background task.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::{Bson, Document, doc};
use crc::{CRC_32_ISO_HDLC, Crc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    cfg::config::{RouteRule, RouterConfig},
    error::{ProxyError, Result},
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

struct CacheEntry {
    set: String,
    at: Instant,
}

pub struct RouterManager {
    rules: DashMap<String, RouteRule>,
    default_set: Option<String>,
    cache: DashMap<(String, Vec<u8>), CacheEntry>,
    check_interval: Duration,
}

impl RouterManager {
    pub fn new(cfg: &RouterConfig) -> Self {
        let rules = DashMap::new();
        for rule in &cfg.routes {
            rules.insert(rule.ns.clone(), rule.clone());
        }
        Self {
            rules,
            default_set: cfg.default_set.clone(),
            cache: DashMap::new(),
            check_interval: cfg.router_check_interval,
        }
    }

    /// Resolve the replica set owning `(ns, shard key document)`.
    ///
    /// A request whose document lacks the rule's shard-key field cannot be
    /// placed by hash and falls back to the rule's first set; a namespace
    /// without a rule falls back to `DefaultSet` when configured.
    pub fn query_shard(&self, ns: &str, shard_key: Option<&Document>) -> Result<String> {
        let Some(rule) = self.rules.get(ns) else {
            return self
                .default_set
                .clone()
                .ok_or_else(|| ProxyError::Route(format!("no route for namespace {ns:?}")));
        };

        if rule.sets.len() == 1 {
            return Ok(rule.sets[0].clone());
        }

        let Some(value) = shard_key.and_then(|doc| doc.get(&rule.shard_key)) else {
            trace!(ns, shard_key = %rule.shard_key, "no shard key in document, using first set");
            return Ok(rule.sets[0].clone());
        };

        let key_bytes = canonical_key_bytes(value)?;
        let cache_key = (ns.to_string(), key_bytes.clone());
        if let Some(entry) = self.cache.get(&cache_key) {
            if entry.at.elapsed() < self.check_interval {
                return Ok(entry.set.clone());
            }
        }

        let idx = CRC32.checksum(&key_bytes) as usize % rule.sets.len();
        let set = rule.sets[idx].clone();
        debug!(ns, set = %set, "routed by shard key hash");
        self.cache.insert(
            cache_key,
            CacheEntry {
                set: set.clone(),
                at: Instant::now(),
            },
        );
        Ok(set)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Spawn the cache aging loop; it runs until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(mgr.check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {},
                }
                let ttl = mgr.check_interval;
                mgr.cache.retain(|_, e| e.at.elapsed() < ttl);
            }
        });
    }
}

/// Stable bytes for hashing one shard-key value: the value wrapped into a
/// single-field document, marshalled to BSON.
fn canonical_key_bytes(value: &Bson) -> Result<Vec<u8>> {
    bson::to_vec(&doc! { "k": value.clone() })
        .map_err(|e| ProxyError::Route(format!("unhashable shard key value: {e}")))
}
