// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Proxy wiring: global managers, the client accept loop, and process
//! level bookkeeping. One lightweight task is spawned per accepted
//! client; upstream sockets never get a task of their own.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crc::{CRC_32_ISO_HDLC, Crc};
use md5::{Digest, Md5};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::Config,
    cluster::{router::RouterManager, topology::ClusterManager},
    pool::pool::ConnPool,
    proxy::{admin, session::Session},
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Process-wide counters surfaced by the stats listener.
pub struct ProxyStats {
    started_at: DateTime<Utc>,
    sessions_total: AtomicI64,
    sessions_active: AtomicI64,
    requests_total: AtomicI64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            sessions_total: AtomicI64::new(0),
            sessions_active: AtomicI64::new(0),
            requests_total: AtomicI64::new(0),
        }
    }

    pub fn session_opened(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self, _requests: u64) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_seen(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    pub fn sessions_total(&self) -> i64 {
        self.sessions_total.load(Ordering::Relaxed)
    }

    pub fn sessions_active(&self) -> i64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    pub fn requests_total(&self) -> i64 {
        self.requests_total.load(Ordering::Relaxed)
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Proxy {
    pub cfg: Config,
    /// Stable per-host instance id, `crc32(md5(hostname)) % 1024`.
    pub id: i64,
    client_seq: AtomicI64,
    pub router: Arc<RouterManager>,
    pub cluster: Arc<ClusterManager>,
    pub pool: Arc<ConnPool>,
    pub stats: Arc<ProxyStats>,
    cancel: CancellationToken,
}

impl Proxy {
    pub fn new(cfg: Config) -> Arc<Self> {
        let cluster = Arc::new(ClusterManager::new(&cfg.cluster));
        let router = Arc::new(RouterManager::new(&cfg.router));
        let pool = Arc::new(ConnPool::new(Arc::clone(&cluster), &cfg.pool));

        Arc::new(Self {
            id: instance_id(),
            cfg,
            client_seq: AtomicI64::new(0),
            router,
            cluster,
            pool,
            stats: Arc::new(ProxyStats::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the router cache aging and topology probe loops.
    pub fn start_managers(&self) {
        self.cluster.start(self.cancel.child_token());
        self.router.start(self.cancel.child_token());
    }

    /// Bind all three listeners from the configuration and serve until the
    /// cancel token fires.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.start_managers();

        let client_listener = TcpListener::bind(&self.cfg.proxy.proxy_address)
            .await
            .with_context(|| format!("listen {}", self.cfg.proxy.proxy_address))?;
        let manage_listener = TcpListener::bind(&self.cfg.proxy.manage_address)
            .await
            .with_context(|| format!("listen {}", self.cfg.proxy.manage_address))?;
        let stat_listener = TcpListener::bind(&self.cfg.proxy.stat_address)
            .await
            .with_context(|| format!("listen {}", self.cfg.proxy.stat_address))?;

        info!(id = self.id, addr = %self.cfg.proxy.proxy_address, "proxy listening");

        let this = Arc::clone(self);
        tokio::spawn(async move { admin::serve_manage(this, manage_listener).await });
        let this = Arc::clone(self);
        tokio::spawn(async move { admin::serve_stats(this, stat_listener).await });

        self.serve_clients(client_listener).await;
        Ok(())
    }

    /// Accept clients on `listener` until cancelled. Public so tests can
    /// bind their own ephemeral listener.
    pub async fn serve_clients(self: &Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = listener.accept() => res,
            };
            let (stream, _) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!(error = %e, "set_nodelay failed");
            }

            let id = self.client_seq.fetch_add(1, Ordering::Relaxed);
            let session = Session::new(
                id,
                stream,
                Arc::clone(&self.router),
                Arc::clone(&self.pool),
                &self.cfg,
                Arc::clone(&self.stats),
            );
            tokio::spawn(session.run());
        }
        info!("client listener closed");
    }
}

/// Stable instance id derived from the hostname.
fn instance_id() -> i64 {
    let hostname = gethostname::gethostname();
    let digest = Md5::digest(hostname.as_encoded_bytes());
    (CRC32.checksum(&digest) % 1024) as i64
}
