use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use itertools::Itertools;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use batchvec::batch::{BatchEmbedder, BatchStatus};
use batchvec::config::BatchvecConfig;
use batchvec::dataset;
use batchvec::embedder::{EmbeddingProcessor, EmbeddingSource};
use batchvec::endpoint::RemoteBackend;
use batchvec::error::EmbedError;

/// Batch-embed a JSONL dataset against a remote embedding endpoint.
#[derive(Debug, Parser)]
#[command(name = "batchvec", version)]
struct Cli {
    /// TOML config with [endpoint] and [batch] sections.
    #[arg(short, long)]
    config: PathBuf,
    /// Input dataset: one JSON object per line with a `content` field.
    #[arg(short, long)]
    input: PathBuf,
    /// Output dataset, same records with `embedding` attached.
    #[arg(short, long)]
    output: PathBuf,
    /// Where to write records that failed, for resubmission.
    #[arg(long)]
    failed_output: Option<PathBuf>,
    /// Override the configured concurrency limit.
    #[arg(long)]
    max_in_flight: Option<usize>,
    /// Override the configured row cap.
    #[arg(long)]
    limit: Option<usize>,
    /// Override the configured truncate flag (`--truncate true|false`).
    #[arg(long)]
    truncate: Option<bool>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        // Some records failed; they were reported and written for resubmission.
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("batchvec failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool, EmbedError> {
    let mut cfg = BatchvecConfig::load(&cli.config)?;
    if let Some(k) = cli.max_in_flight {
        cfg.batch.max_in_flight = k;
    }
    if let Some(limit) = cli.limit {
        cfg.batch.row_limit = Some(limit);
    }
    if let Some(truncate) = cli.truncate {
        cfg.endpoint.truncate = truncate;
    }

    let records = dataset::load_jsonl(&cli.input, cfg.batch.row_limit)?;
    tracing::info!(
        total = records.len(),
        max_in_flight = cfg.batch.max_in_flight,
        truncate = cfg.endpoint.truncate,
        "starting embedding run"
    );

    let backend = RemoteBackend::new(&cfg.endpoint)?;
    let processor = Arc::new(EmbeddingProcessor::new(EmbeddingSource::Remote(backend)));
    let embedder = BatchEmbedder::new(processor, cfg.batch.max_in_flight);

    // Ctrl-C stops admitting new requests; already-attached embeddings are kept.
    let cancel = embedder.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling batch");
            cancel.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = broadcast::channel::<BatchStatus>(64);
    let reporter = tokio::spawn(async move {
        loop {
            match progress_rx.recv().await {
                Ok(status) => tracing::info!(
                    processed = status.processed,
                    total = status.total,
                    progress_pct = (status.calc_progress() * 100.0).round() as u32,
                    "embedding progress"
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let outcome = embedder.run(records, Some(progress_tx)).await;
    let _ = reporter.await;

    tracing::info!(
        succeeded = outcome.succeeded(),
        failed = outcome.failed(),
        "embedding run finished"
    );
    if !outcome.is_complete() {
        tracing::warn!(
            indices = %outcome.failures.iter().map(|f| f.index).join(", "),
            "failed records"
        );
        for failure in &outcome.failures {
            tracing::warn!(index = failure.index, error = %failure.error, "record failed");
        }
    }

    dataset::write_jsonl(&cli.output, &outcome.records)?;
    if let Some(path) = &cli.failed_output {
        if !outcome.is_complete() {
            dataset::write_jsonl(path, &outcome.failed_records())?;
            tracing::info!(path = %path.display(), "wrote failed records for resubmission");
        }
    }
    Ok(outcome.is_complete())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "batchvec", "--config", "c.toml", "--input", "in.jsonl", "--output", "out.jsonl",
        ]
    }

    #[test]
    fn truncate_override_can_switch_both_ways() {
        let cli = Cli::try_parse_from(base_args()).unwrap();
        assert_eq!(cli.truncate, None);

        let mut on = base_args();
        on.extend(["--truncate", "true"]);
        let cli = Cli::try_parse_from(on).unwrap();
        assert_eq!(cli.truncate, Some(true));

        let mut off = base_args();
        off.extend(["--truncate", "false"]);
        let cli = Cli::try_parse_from(off).unwrap();
        assert_eq!(cli.truncate, Some(false));
    }
}
