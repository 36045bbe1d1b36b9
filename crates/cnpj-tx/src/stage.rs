//! Phase A: relational staging into the embedded KV store.
//!
//! One reader per staged source kind feeds a shared bounded row channel. A
//! chunker task decodes rows and groups the resulting entries into fixed-size
//! chunks; a small pool of writer workers commits each chunk in one write
//! batch. A background tick compacts the store's value log while the load
//! runs. The first writer error cancels the shared token, which drains the
//! readers and the chunker, and the orchestrator skips Phase B.

use anyhow::{Context, Result};
use cnpj_core::config::{KV_CHUNK_SIZE, ROW_CHANNEL_CAPACITY};
use cnpj_core::{EtlError, RunSpec, RowRx, Source, SourceKind};
use cnpj_io::{CsvSource, Lookups};
use indicatif::{MultiProgress, ProgressBar};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::decode::{decode_staged, StageEntry};

/// Interval of the background value-log maintenance tick.
const GC_TICK: Duration = Duration::from_secs(60);

type ChunkRx = Arc<Mutex<mpsc::Receiver<Vec<StageEntry>>>>;

/// Tuning of the stage store: one active 16 MiB memtable, an aggressive
/// level-0 slowdown, and 64 MiB blob files holding the large values out of
/// the LSM tree.
pub fn stage_db_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_write_buffer_size(16 << 20);
    opts.set_max_write_buffer_number(2);
    opts.set_level_zero_slowdown_writes_trigger(2);
    opts.set_enable_blob_files(true);
    opts.set_blob_file_size(64 << 20);
    opts.set_enable_blob_gc(true);
    opts
}

/// Open the stage store for the Phase A load.
pub fn open_stage(path: &Path) -> Result<DB> {
    DB::open(&stage_db_options(), path)
        .with_context(|| format!("open stage store at {}", path.display()))
}

/// Re-open the stage store read-only for Phase B.
pub fn open_stage_read_only(path: &Path) -> Result<DB> {
    DB::open_for_read_only(&stage_db_options(), path, false)
        .with_context(|| format!("re-open stage store at {}", path.display()))
}

/// Collect every value whose key starts with `prefix`, in key order.
pub fn prefix_values(db: &DB, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut values = Vec::new();
    for item in db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
        let (key, value) = item.context("stage store scan")?;
        if !key.starts_with(prefix) {
            break;
        }
        values.push(value.into_vec());
    }
    Ok(values)
}

/// Run Phase A: drain all seven staged source kinds into `db`.
pub async fn run_staging(
    spec: &RunSpec,
    db: Arc<DB>,
    lookups: Arc<Lookups>,
    cancel: CancellationToken,
    progress: &MultiProgress,
) -> Result<()> {
    let mut estimated = 0u64;
    let sources: Vec<CsvSource> = SourceKind::STAGED
        .into_iter()
        .map(|kind| CsvSource::new(kind, &spec.data_dir))
        .collect();
    for source in &sources {
        estimated += source.estimated_rows()?;
    }
    let bar = progress.add(ProgressBar::new(estimated));
    bar.set_message("staging");

    let (row_tx, row_rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
    let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<StageEntry>>(spec.kv_writers() * 2);
    let chunk_rx: ChunkRx = Arc::new(Mutex::new(chunk_rx));

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for source in sources {
        let tx = row_tx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { source.run(tx, cancel).await });
    }
    drop(row_tx);

    let skipped = Arc::new(AtomicU64::new(0));
    {
        let cancel = cancel.clone();
        let lookups = lookups.clone();
        let skipped = skipped.clone();
        tasks.spawn(async move { chunker(row_rx, chunk_tx, lookups, skipped, cancel).await });
    }

    for _ in 0..spec.kv_writers() {
        let db = db.clone();
        let rx = chunk_rx.clone();
        let cancel = cancel.clone();
        let bar = bar.clone();
        tasks.spawn(async move { chunk_writer(db, rx, cancel, bar).await });
    }

    let gc_cancel = CancellationToken::new();
    let gc_handle = tokio::spawn(value_log_gc(db.clone(), gc_cancel.clone()));

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
    gc_cancel.cancel();
    let _ = gc_handle.await;
    bar.finish_and_clear();

    match first_err {
        Some(e) => Err(e),
        None => {
            info!(rows_skipped = skipped.load(Ordering::Relaxed), "phase A complete");
            Ok(())
        }
    }
}

/// Group decoded entries into fixed-size chunks. Decode failures are
/// row-level: counted, logged, and skipped.
async fn chunker(
    mut rows: RowRx,
    chunks: mpsc::Sender<Vec<StageEntry>>,
    lookups: Arc<Lookups>,
    skipped: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut chunk: Vec<StageEntry> = Vec::with_capacity(KV_CHUNK_SIZE);
    loop {
        let row = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            row = rows.recv() => row,
        };
        let Some(row) = row else { break };
        match decode_staged(&row, &lookups) {
            Ok(entry) => {
                chunk.push(entry);
                if chunk.len() >= KV_CHUNK_SIZE {
                    let full = std::mem::replace(&mut chunk, Vec::with_capacity(KV_CHUNK_SIZE));
                    if chunks.send(full).await.is_err() {
                        return closed_or_cancelled(&cancel, "stage chunk channel");
                    }
                }
            }
            Err(e) => {
                skipped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = row.kind.label(), error = %e, "row skipped");
            }
        }
    }
    if !chunk.is_empty() && chunks.send(chunk).await.is_err() {
        return closed_or_cancelled(&cancel, "stage chunk channel");
    }
    Ok(())
}

/// A send failure during cancellation is a clean exit; without it, the
/// receiver died early and rows would be lost silently.
fn closed_or_cancelled(cancel: &CancellationToken, channel: &'static str) -> Result<()> {
    if cancel.is_cancelled() {
        Ok(())
    } else {
        Err(EtlError::ChannelClosed(channel).into())
    }
}

/// Commit chunks, one write batch per chunk. Progress advances by chunk
/// length.
async fn chunk_writer(
    db: Arc<DB>,
    rx: ChunkRx,
    cancel: CancellationToken,
    bar: ProgressBar,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let chunk = { rx.lock().await.recv().await };
        let Some(chunk) = chunk else { return Ok(()) };
        let len = chunk.len() as u64;
        let mut batch = WriteBatch::default();
        for entry in chunk {
            batch.put(entry.key, entry.value);
        }
        db.write(batch).context("stage chunk commit")?;
        bar.inc(len);
    }
}

/// Periodic value-log maintenance while the load runs. Rejections are
/// expected under load and only logged.
async fn value_log_gc(db: Arc<DB>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(GC_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // the first tick is immediate, skip it
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                if let Err(e) = db.flush() {
                    warn!(error = %e, "stage flush rejected");
                }
                db.compact_range::<&[u8], &[u8]>(None, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnpj_core::SourceRow;

    fn entry(key: &str, value: &str) -> StageEntry {
        StageEntry { key: key.as_bytes().to_vec(), value: value.as_bytes().to_vec() }
    }

    #[test]
    fn prefix_scan_stops_at_the_prefix_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_stage(dir.path()).unwrap();
        for e in [
            entry("partner:11111111:aa", "a"),
            entry("partner:11111111:bb", "b"),
            entry("partner:11111112:cc", "c"),
            entry("simple:11111111:dd", "d"),
        ] {
            db.put(e.key, e.value).unwrap();
        }
        let values = prefix_values(&db, b"partner:11111111:").unwrap();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(prefix_values(&db, b"partner:99999999:").unwrap().is_empty());
    }

    #[test]
    fn read_only_reopen_sees_committed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = open_stage(dir.path()).unwrap();
            let mut batch = WriteBatch::default();
            batch.put(b"base:12345678", b"{}");
            db.write(batch).unwrap();
            db.flush().unwrap();
        }
        let db = open_stage_read_only(dir.path()).unwrap();
        assert_eq!(db.get(b"base:12345678").unwrap(), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn chunker_flushes_partial_chunks_on_close() {
        let lookups = Arc::new(Lookups::default());
        let (row_tx, row_rx) = mpsc::channel(10);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(10);

        let record =
            csv::StringRecord::from(vec!["12345678", "ACME", "2062", "49", "1000,00", "05", ""]);
        row_tx.send(SourceRow { kind: SourceKind::Base, record }).await.unwrap();
        // malformed row: skipped, never aborts the chunker
        let bad = csv::StringRecord::from(vec!["12", "BROKEN"]);
        row_tx.send(SourceRow { kind: SourceKind::Base, record: bad }).await.unwrap();
        drop(row_tx);

        let skipped = Arc::new(AtomicU64::new(0));
        chunker(row_rx, chunk_tx, lookups, skipped.clone(), CancellationToken::new())
            .await
            .unwrap();
        let chunk = chunk_rx.recv().await.unwrap();
        assert_eq!(chunk.len(), 1);
        assert_eq!(chunk[0].key, b"base:12345678");
        assert_eq!(skipped.load(Ordering::Relaxed), 1);
        assert!(chunk_rx.recv().await.is_none());
    }

    fn write_latin1(dir: &Path, name: &str, rows: &[String]) {
        use encoding_rs::WINDOWS_1252;
        let joined = rows.join("\n");
        let (bytes, _, _) = WINDOWS_1252.encode(&joined);
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    fn write_lookup_files(dir: &Path) {
        for (name, content) in [
            ("Cnaes.csv", "\"6201501\";\"Desenvolvimento de programas\"\n"),
            ("Municipios.csv", "\"7107\";\"SÃO PAULO\"\n"),
            ("Naturezas.csv", "\"2062\";\"Sociedade Empresária Limitada\"\n"),
            ("Qualificacoes.csv", "\"49\";\"Sócio-Administrador\"\n"),
            ("Paises.csv", "\"105\";\"BRASIL\"\n"),
            ("Motivos.csv", "\"0\";\"SEM MOTIVO\"\n"),
        ] {
            write_latin1(dir, name, &[content.to_string()]);
        }
    }

    /// Full Phase A over a small drop: readers, chunker, writer pool, then a
    /// read-only reopen sees every staged record.
    #[tokio::test]
    async fn staging_a_small_drop_end_to_end() {
        let data_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        write_lookup_files(data_dir.path());
        write_latin1(
            data_dir.path(),
            "Empresas0.csv",
            &["\"12345678\";\"ACME LTDA\";\"2062\";\"49\";\"100000,00\";\"05\";\"\"".to_string()],
        );
        write_latin1(
            data_dir.path(),
            "Socios0.csv",
            &[
                "\"12345678\";\"2\";\"ALICE\";\"***111111**\";\"49\";\"20150701\";\"\";\"\";\"\";\"\";\"4\"".to_string(),
                "\"12345678\";\"2\";\"BOB\";\"***222222**\";\"49\";\"20150701\";\"\";\"\";\"\";\"\";\"5\"".to_string(),
            ],
        );
        write_latin1(
            data_dir.path(),
            "Simples.csv",
            &["\"12345678\";\"S\";\"20180101\";\"\";\"N\";\"\";\"\"".to_string()],
        );
        for (name, rows) in [
            ("Lucro Real.csv", vec!["\"2020\";\"12345678000199\";\"\";\"LUCRO REAL\";\"1\"".to_string()]),
            ("Lucro Presumido.csv", vec!["\"2021\";\"12345678000199\";\"\";\"LUCRO PRESUMIDO\";\"1\"".to_string()]),
            ("Lucro Arbitrado.csv", vec!["\"ANO\";\"CNPJ\";\"SCP\";\"FORMA\";\"QTD\"".to_string()]),
            ("Imunes e Isentas.csv", vec!["\"2020\";\"12345678000199\";\"\";\"IMUNE\";\"1\"".to_string()]),
        ] {
            write_latin1(data_dir.path(), name, &rows);
        }

        let spec = RunSpec::new(data_dir.path(), "postgres://localhost/cnpj");
        let lookups = Arc::new(Lookups::load(&spec.data_dir).unwrap());
        {
            let db = Arc::new(open_stage(store_dir.path()).unwrap());
            let progress = MultiProgress::new();
            run_staging(&spec, db.clone(), lookups, CancellationToken::new(), &progress)
                .await
                .unwrap();
            db.flush().unwrap();
        }

        let db = open_stage_read_only(store_dir.path()).unwrap();
        assert!(db.get(b"base:12345678").unwrap().is_some());
        assert_eq!(prefix_values(&db, b"partner:12345678:").unwrap().len(), 2);
        assert_eq!(prefix_values(&db, b"simple:12345678:").unwrap().len(), 1);
        // three regime rows survived, the stray header line did not
        assert_eq!(prefix_values(&db, b"regime:12345678000199:").unwrap().len(), 3);
    }
}
