//! The orchestrator: owns the staging directory and drives the two phases.
//!
//! Phase A stages the seven auxiliary streams into a fresh KV store under a
//! temporary directory; Phase B streams the venue files, enriches each row
//! against the store, and batch-writes the result. The staging directory is
//! destroyed on every exit path, success or failure, because the handle owns
//! it for the whole run.

use anyhow::{Context, Result};
use cnpj_core::config::ROW_CHANNEL_CAPACITY;
use cnpj_core::{Company, EtlError, RunSpec, Source, SourceKind, SourceRow};
use cnpj_io::{CsvSource, Lookups, OutputMode, PostgresSink};
use indicatif::{MultiProgress, ProgressBar};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::decode::decode_venue;
use crate::enrich::Enricher;
use crate::stage;

/// Workers pulling venue rows through enrichment.
const ENRICH_WORKERS: usize = 8;

/// Name of the sidecar the downloader writes next to the CSVs.
const UPDATED_AT_SIDECAR: &str = "updated_at.txt";

/// Run the full two-phase transformation.
pub async fn run(spec: &RunSpec, cancel: CancellationToken) -> Result<()> {
    let staging_dir =
        TempDir::with_prefix("cnpj-stage-").context("create staging directory")?;
    info!(path = %staging_dir.path().display(), "staging directory created");

    let lookups = Arc::new(Lookups::load(&spec.data_dir)?);
    let progress = MultiProgress::new();

    // Phase A
    {
        let db = Arc::new(stage::open_stage(staging_dir.path())?);
        stage::run_staging(spec, db.clone(), lookups.clone(), cancel.clone(), &progress).await?;
        db.flush().context("final stage flush")?;
    }
    if cancel.is_cancelled() {
        anyhow::bail!("run cancelled");
    }

    // Phase B reads the store through a read-only handle
    let db = Arc::new(stage::open_stage_read_only(staging_dir.path())?);

    let mode = if spec.structured { OutputMode::Structured } else { OutputMode::Json };
    let sink = Arc::new(PostgresSink::connect(&spec.database_url, mode).await?);

    if spec.clean_up {
        sink.create_schema().await?;
    } else {
        sink.ensure_schema().await?;
    }
    sink.pre_load().await;

    run_persist(spec, db, lookups, sink.clone(), cancel.clone(), &progress).await?;

    sink.post_load().await;
    sink.create_indexes().await?;

    let stamp = read_updated_at(spec)?;
    sink.stamp_updated_at(&stamp).await?;
    info!(stamp = %stamp.trim(), "run complete, data-set marker stamped");
    Ok(())
}

/// Phase B: venue reader, enrichment pool, batcher, and batch writers, all
/// under one task group. First error cancels everything.
async fn run_persist(
    spec: &RunSpec,
    db: Arc<rocksdb::DB>,
    lookups: Arc<Lookups>,
    sink: Arc<PostgresSink>,
    cancel: CancellationToken,
    progress: &MultiProgress,
) -> Result<()> {
    let source = CsvSource::new(SourceKind::Venue, &spec.data_dir);
    let bar = progress.add(ProgressBar::new(source.estimated_rows()?));
    bar.set_message("persisting");

    let enricher = Arc::new(Enricher::new(db, spec.privacy));

    let (row_tx, row_rx) = mpsc::channel::<SourceRow>(ROW_CHANNEL_CAPACITY);
    let (company_tx, company_rx) = mpsc::channel::<Company>(ROW_CHANNEL_CAPACITY);
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<Company>>(spec.db_writers());

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    {
        let cancel = cancel.clone();
        tasks.spawn(async move { source.run(row_tx, cancel).await });
    }

    let skipped = Arc::new(AtomicU64::new(0));
    let row_rx = Arc::new(Mutex::new(row_rx));
    for _ in 0..ENRICH_WORKERS {
        let rx = row_rx.clone();
        let tx = company_tx.clone();
        let enricher = enricher.clone();
        let lookups = lookups.clone();
        let skipped = skipped.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { enrich_worker(rx, tx, enricher, lookups, skipped, cancel).await });
    }
    drop(company_tx);

    {
        let batch_size = spec.batch_size.max(1);
        let cancel = cancel.clone();
        tasks.spawn(async move { batcher(company_rx, batch_tx, batch_size, cancel).await });
    }

    let batch_rx = Arc::new(Mutex::new(batch_rx));
    for _ in 0..spec.db_writers() {
        let rx = batch_rx.clone();
        let sink = sink.clone();
        let bar = bar.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { batch_writer(rx, sink, bar, cancel).await });
    }

    let mut first_err: Option<anyhow::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(anyhow::Error::from).and_then(|r| r);
        if let Err(e) = result {
            if first_err.is_none() {
                first_err = Some(e);
                cancel.cancel();
            }
        }
    }
    bar.finish_and_clear();

    match first_err {
        Some(e) => Err(e),
        None if cancel.is_cancelled() => Err(anyhow::anyhow!("run cancelled")),
        None => {
            info!(rows_skipped = skipped.load(Ordering::Relaxed), "phase B complete");
            Ok(())
        }
    }
}

/// Decode a venue row and enrich it. Decode failures are row-level:
/// counted and skipped; enrichment failures fail the run.
async fn enrich_worker(
    rows: Arc<Mutex<mpsc::Receiver<SourceRow>>>,
    companies: mpsc::Sender<Company>,
    enricher: Arc<Enricher>,
    lookups: Arc<Lookups>,
    skipped: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let row = { rows.lock().await.recv().await };
        let Some(row) = row else { return Ok(()) };
        let seed = match decode_venue(&row.record, &lookups) {
            Ok(seed) => seed,
            Err(e) => {
                skipped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "venue row skipped");
                continue;
            }
        };
        let company = enricher.enrich(seed).await?;
        if companies.send(company).await.is_err() {
            return closed_or_cancelled(&cancel, "company channel");
        }
    }
}

/// Accumulate companies into fixed-size batches.
async fn batcher(
    mut companies: mpsc::Receiver<Company>,
    batches: mpsc::Sender<Vec<Company>>,
    batch_size: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let mut batch: Vec<Company> = Vec::with_capacity(batch_size);
    loop {
        let company = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            company = companies.recv() => company,
        };
        let Some(company) = company else { break };
        batch.push(company);
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if batches.send(full).await.is_err() {
                return closed_or_cancelled(&cancel, "batch channel");
            }
        }
    }
    if !batch.is_empty() && batches.send(batch).await.is_err() {
        return closed_or_cancelled(&cancel, "batch channel");
    }
    Ok(())
}

/// A send failure during cancellation is a clean exit; without it, the
/// receiver died early and companies would be lost silently.
fn closed_or_cancelled(cancel: &CancellationToken, channel: &'static str) -> Result<()> {
    if cancel.is_cancelled() {
        Ok(())
    } else {
        Err(EtlError::ChannelClosed(channel).into())
    }
}

/// Drain batches into the sink, one transaction per batch.
async fn batch_writer(
    rx: Arc<Mutex<mpsc::Receiver<Vec<Company>>>>,
    sink: Arc<PostgresSink>,
    bar: ProgressBar,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let batch = { rx.lock().await.recv().await };
        let Some(batch) = batch else { return Ok(()) };
        let len = batch.len() as u64;
        sink.write_batch(&batch).await?;
        bar.inc(len);
    }
}

fn read_updated_at(spec: &RunSpec) -> Result<String> {
    let path = spec.data_dir.join(UPDATED_AT_SIDECAR);
    std::fs::read_to_string(&path).map_err(|_| EtlError::MissingUpdatedAt { path }.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batcher_respects_size_and_flushes_the_tail() {
        let (company_tx, company_rx) = mpsc::channel(10);
        let (batch_tx, mut batch_rx) = mpsc::channel(10);
        for _ in 0..5 {
            company_tx.send(Company::default()).await.unwrap();
        }
        drop(company_tx);

        batcher(company_rx, batch_tx, 2, CancellationToken::new()).await.unwrap();
        assert_eq!(batch_rx.recv().await.unwrap().len(), 2);
        assert_eq!(batch_rx.recv().await.unwrap().len(), 2);
        assert_eq!(batch_rx.recv().await.unwrap().len(), 1);
        assert!(batch_rx.recv().await.is_none());
    }

    #[test]
    fn missing_sidecar_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = RunSpec::new(dir.path(), "postgres://localhost/cnpj");
        let err = read_updated_at(&spec).unwrap_err();
        assert!(err.to_string().contains("updated-at sidecar"));

        std::fs::write(dir.path().join(UPDATED_AT_SIDECAR), "2026-07-19\n").unwrap();
        assert_eq!(read_updated_at(&spec).unwrap(), "2026-07-19\n");
    }
}
