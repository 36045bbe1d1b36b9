use anyhow::{Context, Result};
use async_trait::async_trait;
use cnpj_core::{EtlError, RowTx, Source, SourceKind, SourceRow};
use encoding_rs::WINDOWS_1252;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Streaming reader over every file of one source kind.
///
/// Files are semicolon-delimited, double-quote quoted, Latin-1 encoded and
/// headerless. Rows of one file arrive in file order; nothing is promised
/// across files or across readers.
pub struct CsvSource {
    kind: SourceKind,
    dir: PathBuf,
}

impl CsvSource {
    pub fn new(kind: SourceKind, dir: impl Into<PathBuf>) -> Self {
        Self { kind, dir: dir.into() }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Every file of this kind under the data directory, sorted by name.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("read data directory {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_file() && self.kind.matches(&name) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        if paths.is_empty() {
            return Err(EtlError::NoSourceFiles {
                kind: self.kind.label(),
                dir: self.dir.clone(),
            }
            .into());
        }
        Ok(paths)
    }

    /// Total-row estimate from summed file sizes and the kind's average row
    /// size. Feeds the progress bar only.
    pub fn estimated_rows(&self) -> Result<u64> {
        let mut total = 0u64;
        for path in self.files()? {
            total += std::fs::metadata(&path)
                .with_context(|| format!("stat {}", path.display()))?
                .len();
        }
        Ok(total / self.kind.avg_row_bytes())
    }
}

fn open_reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    Ok(csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(file))
}

/// Transcode one raw record from Latin-1. Decoding never fails; undecodable
/// bytes become replacement characters.
fn decode_latin1(record: &csv::ByteRecord) -> csv::StringRecord {
    let mut out = csv::StringRecord::new();
    for field in record.iter() {
        let (text, _, _) = WINDOWS_1252.decode(field);
        out.push_field(&text);
    }
    out
}

#[async_trait]
impl Source for CsvSource {
    fn name(&self) -> &str {
        self.kind.label()
    }

    async fn run(&self, tx: RowTx, cancel: CancellationToken) -> Result<()> {
        for path in self.files()? {
            if cancel.is_cancelled() {
                break;
            }
            info!(kind = self.kind.label(), file = %path.display(), "reading source file");

            let mut reader = open_reader(&path)?;
            let mut record = csv::ByteRecord::new();
            loop {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match reader.read_byte_record(&mut record) {
                    Ok(true) => {
                        let row = SourceRow { kind: self.kind, record: decode_latin1(&record) };
                        if tx.send(row).await.is_err() {
                            // a closed row channel during cancellation is a
                            // clean exit; otherwise the consumer died early
                            if cancel.is_cancelled() {
                                return Ok(());
                            }
                            return Err(EtlError::ChannelClosed("row channel").into());
                        }
                    }
                    Ok(false) => break,
                    Err(e) => {
                        warn!(error = ?e, file = %path.display(), "csv read error, row skipped");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn write_latin1(dir: &Path, name: &str, rows: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let joined = rows.join("\n");
        let (bytes, _, _) = WINDOWS_1252.encode(&joined);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn streams_rows_in_file_order_with_latin1_decoding() {
        let dir = tempfile::tempdir().unwrap();
        write_latin1(
            dir.path(),
            "K3241.Empresas0.csv",
            &[
                "\"12345678\";\"PADARIA SÃO JOÃO LTDA\";\"2062\";\"49\";\"1000,00\";\"05\";\"\"",
                "\"87654321\";\"AÇOUGUE DO ZÉ\";\"2135\";\"50\";\"0\";\"01\";\"\"",
            ],
        );

        let source = CsvSource::new(SourceKind::Base, dir.path());
        let (tx, mut rx) = mpsc::channel(10);
        source.run(tx, CancellationToken::new()).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, SourceKind::Base);
        assert_eq!(&first.record[1], "PADARIA SÃO JOÃO LTDA");
        let second = rx.recv().await.unwrap();
        assert_eq!(&second.record[1], "AÇOUGUE DO ZÉ");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn missing_files_are_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvSource::new(SourceKind::Venue, dir.path());
        let (tx, _rx) = mpsc::channel(1);
        let err = source.run(tx, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no venue files"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream_between_rows() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<String> =
            (0..100).map(|i| format!("\"{i:08}\";\"COMPANY {i}\";\"\";\"\";\"\";\"\";\"\"")).collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        write_latin1(dir.path(), "Empresas1.csv", &refs);

        let source = CsvSource::new(SourceKind::Base, dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(200);
        source.run(tx, cancel).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn row_estimate_scales_with_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let row = "\"12345678\";\"NAME\";\"2062\";\"49\";\"1000,00\";\"05\";\"\"";
        let rows: Vec<&str> = std::iter::repeat(row).take(50).collect();
        write_latin1(dir.path(), "Empresas0.csv", &rows);

        let source = CsvSource::new(SourceKind::Base, dir.path());
        let estimate = source.estimated_rows().unwrap();
        assert!(estimate > 0);
    }
}
