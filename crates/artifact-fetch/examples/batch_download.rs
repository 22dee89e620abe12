//! Fetch a set of artifacts into a directory
//!
//! Run this example with:
//! ```
//! cargo run --example batch_download -- <target_dir> <url>...
//! ```
//!
//! Set `ARTIFACT_FETCH_PROBE_BASE_URL` to measure the connection first. Any
//! other `ARTIFACT_FETCH_*` variable overrides the download configuration.

use anyhow::{Context, bail};
use artifact_fetch::{
    ArtifactDescriptor, ConnectionSpeedProber, DownloadConfig, DownloadContext, DownloadCoordinator, ProbeConfig,
    TracingProgressSink,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let Some(target_dir) = args.next().map(PathBuf::from) else {
        bail!("usage: batch_download <target_dir> <url>...");
    };
    let urls: Vec<String> = args.collect();
    if urls.is_empty() {
        bail!("no artifact URLs given");
    }

    let config = DownloadConfig::from_env().context("loading download configuration")?;

    // Ctrl-C cancels the batch; files fetched so far are cleaned up.
    let token = CancellationToken::new();
    let on_interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let context = DownloadContext::new()
        .with_cancellation_token(token)
        .with_total_expected_count(urls.len() as u64)
        .with_progress_sink(TracingProgressSink::new(true));

    if let Ok(base_url) = std::env::var("ARTIFACT_FETCH_PROBE_BASE_URL") {
        let prober = ConnectionSpeedProber::new(config.clone(), ProbeConfig::new(base_url))?;
        match prober.measure(&context).await {
            Some(statistics) => println!("{}", serde_json::to_string_pretty(&statistics)?),
            None => println!("Connection speed could not be measured"),
        }
    }

    let descriptors = urls
        .iter()
        .map(|url| {
            let file_name = url
                .rsplit('/')
                .find(|segment| !segment.is_empty())
                .unwrap_or("artifact.bin")
                .to_string();
            ArtifactDescriptor::new(url.clone(), file_name, url.clone())
        })
        .collect::<Result<Vec<_>, _>>()?;

    let coordinator = DownloadCoordinator::new(config)?;
    let result = coordinator.download_all(descriptors, &target_dir, &context).await?;

    for outcome in &result.outcomes {
        let note = if outcome.was_already_present { " (already present)" } else { "" };
        println!("{} -> {}{}", outcome.descriptor.download_url(), outcome.local_file.display(), note);
    }
    println!(
        "{} artifacts, {} bytes in {:?} ({} retries)",
        result.outcomes.len(),
        result.total_bytes,
        result.elapsed,
        result.metrics.retries
    );

    Ok(())
}
