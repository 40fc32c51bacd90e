// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Management and stats listeners.
//!
//! The management port speaks a one-command-per-line text protocol:
//! `evict <host:port>` closes idle upstream connections to the host and
//! bumps its eviction epoch, so sessions refuse any cursor pin created
//! before the eviction the next time it is used; `shutdown` stops the
//! proxy. The stats port writes one JSON document per connection and
//! closes.

use std::sync::Arc;

use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{info, warn};

use crate::proxy::proxy::Proxy;

pub async fn serve_manage(proxy: Arc<Proxy>, listener: TcpListener) {
    let cancel = proxy.cancel_token();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => {
                info!(%peer, "manage client");
                let proxy = Arc::clone(&proxy);
                tokio::spawn(async move {
                    if let Err(e) = handle_manage(proxy, stream).await {
                        warn!(error = %e, "manage connection failed");
                    }
                });
            },
            Err(e) => warn!(error = %e, "manage accept failed"),
        }
    }
}

async fn handle_manage(proxy: Arc<Proxy>, stream: TcpStream) -> std::io::Result<()> {
    let (r, mut w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("evict"), Some(host)) => {
                proxy.pool.evict(host);
                w.write_all(b"OK\n").await?;
            },
            (Some("shutdown"), None) => {
                w.write_all(b"OK\n").await?;
                proxy.cancel_token().cancel();
                break;
            },
            (None, _) => continue,
            _ => {
                w.write_all(b"ERR unknown command\n").await?;
            },
        }
    }
    Ok(())
}

pub async fn serve_stats(proxy: Arc<Proxy>, listener: TcpListener) {
    let cancel = proxy.cancel_token();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((mut stream, _)) => {
                let doc = stats_doc(&proxy);
                tokio::spawn(async move {
                    let payload = doc.to_string();
                    let _ = stream.write_all(payload.as_bytes()).await;
                    let _ = stream.write_all(b"\n").await;
                    let _ = stream.shutdown().await;
                });
            },
            Err(e) => warn!(error = %e, "stats accept failed"),
        }
    }
}

fn stats_doc(proxy: &Proxy) -> serde_json::Value {
    let pool_idle: serde_json::Map<String, serde_json::Value> = proxy
        .pool
        .idle_sizes()
        .into_iter()
        .map(|(k, v)| (k, json!(v)))
        .collect();

    json!({
        "id": proxy.id,
        "uptime_secs": proxy.stats.uptime_secs(),
        "sessions": {
            "total": proxy.stats.sessions_total(),
            "active": proxy.stats.sessions_active(),
        },
        "requests_total": proxy.stats.requests_total(),
        "pool_idle": pool_idle,
        "router_cache": proxy.router.cache_len(),
        "replica_sets": proxy.cluster.set_count(),
    })
}
