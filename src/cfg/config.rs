// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashSet, fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cluster::topology::Role;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Listener addresses and client-facing limits.
    pub proxy: ServerConfig,
    /// Upstream connection pooling.
    pub pool: PoolConfig,
    /// Namespace → replica-set routing rules.
    pub router: RouterConfig,
    /// Replica-set topology seed.
    pub cluster: ClusterConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(rename = "ProxyAddress", default = "default_proxy_address")]
    /// Client listener bind address.
    pub proxy_address: String,

    #[serde(rename = "ManageAddress", default = "default_manage_address")]
    /// Management listener bind address.
    pub manage_address: String,

    #[serde(rename = "StatAddress", default = "default_stat_address")]
    /// Stats listener bind address.
    pub stat_address: String,

    #[serde(rename = "MaxReqSize", default = "default_max_msg_size")]
    /// Client messages larger than this are rejected before the body is read.
    pub max_req_size: usize,

    #[serde(rename = "MaxResSize", default = "default_max_msg_size")]
    /// Upstream messages larger than this are rejected before the body is read.
    pub max_res_size: usize,

    #[serde(
        rename = "ClientTimeout",
        with = "serde_secs",
        default = "default_io_timeout"
    )]
    /// Client-side read/write deadline.
    pub client_timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PoolConfig {
    #[serde(rename = "ConnPoolSize", default = "default_pool_size")]
    /// Maximum idle upstream connections per (set, role).
    pub conn_pool_size: usize,

    #[serde(
        rename = "ConnectTimeout",
        with = "serde_secs",
        default = "default_io_timeout"
    )]
    /// Deadline for dialing an upstream member.
    pub connect_timeout: Duration,

    #[serde(
        rename = "MongoTimeout",
        with = "serde_secs",
        default = "default_io_timeout"
    )]
    /// Upstream read/write deadline.
    pub mongo_timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RouterConfig {
    #[serde(
        rename = "RouterCheckInterval",
        with = "serde_secs",
        default = "default_router_check_interval"
    )]
    /// Age limit for cached route lookups.
    pub router_check_interval: Duration,

    #[serde(rename = "DefaultSet", default)]
    /// Fallback set for namespaces without a rule.
    pub default_set: Option<String>,

    #[serde(rename = "Routes", default)]
    pub routes: Vec<RouteRule>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RouteRule {
    #[serde(rename = "Ns")]
    /// Fully-qualified `"<db>.<collection>"` the rule applies to.
    pub ns: String,

    #[serde(rename = "ShardKey")]
    /// Top-level document field whose value is hashed across `Sets`.
    pub shard_key: String,

    #[serde(rename = "Sets")]
    pub sets: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClusterConfig {
    #[serde(
        rename = "TopoCheckInterval",
        with = "serde_secs",
        default = "default_topo_check_interval"
    )]
    /// Member health probe interval.
    pub topo_check_interval: Duration,

    #[serde(rename = "Sets")]
    pub sets: Vec<ReplicaSetConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReplicaSetConfig {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Members")]
    pub members: Vec<MemberConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MemberConfig {
    #[serde(rename = "Host")]
    /// `"host:port"` of one replica-set member.
    pub host: String,

    #[serde(rename = "Role")]
    pub role: Role,
}

fn default_proxy_address() -> String {
    "0.0.0.0:4000".to_string()
}

fn default_manage_address() -> String {
    "0.0.0.0:4001".to_string()
}

fn default_stat_address() -> String {
    "0.0.0.0:4002".to_string()
}

fn default_max_msg_size() -> usize {
    16 * 1024 * 1024
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_pool_size() -> usize {
    30
}

fn default_router_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_topo_check_interval() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {:?}", path.as_ref()))?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.pool.conn_pool_size >= 1, "ConnPoolSize must be >= 1");
        ensure!(
            self.proxy.max_req_size > 16,
            "MaxReqSize must exceed the header length"
        );
        ensure!(
            self.proxy.max_res_size > 16,
            "MaxResSize must exceed the header length"
        );
        ensure!(
            !self.cluster.sets.is_empty(),
            "at least one replica set required"
        );

        let mut set_names = HashSet::new();
        for set in &self.cluster.sets {
            ensure!(!set.name.is_empty(), "replica set name must not be empty");
            ensure!(
                set_names.insert(set.name.as_str()),
                "duplicate replica set {:?}",
                set.name
            );
            ensure!(
                !set.members.is_empty(),
                "replica set {:?} has no members",
                set.name
            );
            let primaries = set
                .members
                .iter()
                .filter(|m| m.role == Role::Primary)
                .count();
            ensure!(
                primaries == 1,
                "replica set {:?} must have exactly one primary, found {}",
                set.name,
                primaries
            );
            for m in &set.members {
                ensure!(
                    m.host
                        .rsplit_once(':')
                        .is_some_and(|(h, p)| !h.is_empty() && p.parse::<u16>().is_ok()),
                    "bad member host {:?} in set {:?}",
                    m.host,
                    set.name
                );
            }
        }

        for rule in &self.router.routes {
            ensure!(
                rule.ns
                    .split_once('.')
                    .is_some_and(|(db, coll)| !db.is_empty() && !coll.is_empty()),
                "bad route namespace {:?}",
                rule.ns
            );
            ensure!(
                !rule.shard_key.is_empty(),
                "route {:?} has an empty shard key",
                rule.ns
            );
            ensure!(!rule.sets.is_empty(), "route {:?} lists no sets", rule.ns);
            for s in &rule.sets {
                ensure!(
                    set_names.contains(s.as_str()),
                    "route {:?} references unknown set {:?}",
                    rule.ns,
                    s
                );
            }
        }
        if let Some(default) = &self.router.default_set {
            ensure!(
                set_names.contains(default.as_str()),
                "DefaultSet {:?} is not a configured replica set",
                default
            );
        }

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
pub(crate) mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
