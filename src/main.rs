// src/main.rs

use anyhow::{bail, Result};
use futures_util::StreamExt;
use http_transfers::logging::init_logging;
use http_transfers::prelude::*;
use std::path::{Path, PathBuf};

const USAGE: &str = "usage: http-transfers <download|upload> <url> <path>";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(2);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [direction, url, path] = args.as_slice() else {
        bail!(USAGE);
    };
    let direction = match direction.as_str() {
        "download" => TransferDirection::Download,
        "upload" => TransferDirection::Upload,
        other => bail!("unknown direction {other:?}\n{USAGE}"),
    };

    let config = match std::env::var_os("HTTP_TRANSFERS_CONFIG") {
        Some(config_path) => TransferConfig::load(Path::new(&config_path))?,
        None => TransferConfig::default(),
    };
    let manager = TransferManager::open(config).await?;

    let request = TransferRequest::new("cli", url.as_str(), direction, PathBuf::from(path));
    let mut updates = manager.watch_transfer(&request.identifier).await;
    manager.queue(request).await?;

    let interrupt = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel_all().await;
        }
    });

    while let Some(update) = updates.next().await {
        let update = match update {
            Ok(update) => update,
            Err(cause) => bail!("transfer failed: {cause}"),
        };
        let progress = &update.progress;
        if progress.is_deterministic() {
            println!(
                "[{}] {:.0}% {}/{} bytes, {} B/s, {}s left",
                update.state,
                progress.percent_complete() * 100.0,
                progress.bytes_transferred,
                progress.bytes_to_transfer.unwrap_or_default(),
                progress.bytes_per_second,
                progress.estimated_time_remaining().as_secs(),
            );
        } else {
            println!(
                "[{}] {} bytes, {} B/s",
                update.state, progress.bytes_transferred, progress.bytes_per_second
            );
        }
        if update.state == TransferState::Canceled {
            bail!("transfer canceled");
        }
    }
    Ok(())
}
