// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use mongo_proxy_rs::{
    cfg::{cli::config_path_from_args, config::Config, logger::init_logger},
    proxy::proxy::Proxy,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args()?;
    let _logger_guard = init_logger(&config_path)?;

    let cfg = Config::load_from_file(&config_path)
        .with_context(|| format!("failed to load config {config_path:?}"))?;

    let proxy = Proxy::new(cfg);
    info!(id = proxy.id, "starting mongo proxy");

    let cancel = proxy.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    proxy.run().await
}
