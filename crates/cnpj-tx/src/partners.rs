//! Partners-only ingestion: re-import partner rows into an existing venue
//! table.
//!
//! Skips Phase A entirely. Partner rows are grouped by base ID into batches;
//! each batch resolves its grouping keys to venue surrogate keys in two batch
//! queries (left-prefix for 8-digit keys, exact for 14-digit ones) and the
//! partner rows land with duplicates skipped, so the path is safe to re-run.

use anyhow::Result;
use cnpj_core::config::ROW_CHANNEL_CAPACITY;
use cnpj_core::{Partner, RunSpec, Source, SourceKind};
use cnpj_io::{CsvSource, Lookups, OutputMode, PartnerRow, PostgresSink};
use indicatif::ProgressBar;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::decode::decode_partner;

/// Partner rows accumulated before a resolve-and-insert round trip.
const PARTNER_BATCH_SIZE: usize = 5000;

/// Run the partners-only import against an already-populated venue table.
pub async fn import_partners(spec: &RunSpec, cancel: CancellationToken) -> Result<()> {
    let lookups = Arc::new(Lookups::load(&spec.data_dir)?);
    let sink = PostgresSink::connect(&spec.database_url, OutputMode::Structured).await?;
    sink.ensure_base_index().await?;

    let source = CsvSource::new(SourceKind::Partner, &spec.data_dir);
    let bar = ProgressBar::new(source.estimated_rows()?);

    let (row_tx, mut row_rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
    let reader = {
        let cancel = cancel.clone();
        tokio::spawn(async move { source.run(row_tx, cancel).await })
    };

    let mut groups: HashMap<String, Vec<Partner>> = HashMap::new();
    let mut pending = 0usize;
    let mut total = 0u64;
    while let Some(row) = row_rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        match decode_partner(&row.record, &lookups) {
            Ok((base_id, partner)) => {
                groups.entry(base_id).or_default().push(partner);
                pending += 1;
                bar.inc(1);
                if pending >= PARTNER_BATCH_SIZE {
                    total += flush_batch(&sink, &mut groups).await?;
                    pending = 0;
                }
            }
            Err(e) => warn!(error = %e, "partner row skipped"),
        }
    }
    if pending > 0 {
        total += flush_batch(&sink, &mut groups).await?;
    }
    bar.finish_and_clear();
    reader.await??;

    if cancel.is_cancelled() {
        anyhow::bail!("run cancelled");
    }
    info!(inserted = total, "partners import complete");
    Ok(())
}

/// Resolve one batch of grouped partners and insert them. A grouping key
/// with no matching venue is logged and dropped; the venue table simply does
/// not know that base.
async fn flush_batch(sink: &PostgresSink, groups: &mut HashMap<String, Vec<Partner>>) -> Result<u64> {
    let keys: Vec<String> = groups.keys().cloned().collect();
    let resolved = sink.resolve_business_ids(&keys).await?;

    let (rows, unmatched) = expand_groups(&resolved, groups);
    for key in unmatched {
        warn!(key = %key, "no venue for partner group, rows dropped");
    }

    let inserted = sink.insert_partner_rows(&rows).await?;
    groups.clear();
    Ok(inserted)
}

/// Fan grouped partners out over the venues their key resolved to. A base
/// key attaches its partners to every venue of that base; a 14-digit key to
/// exactly one. Returns the rows plus the keys no venue matched.
fn expand_groups<'a>(
    resolved: &[(i64, String)],
    groups: &'a HashMap<String, Vec<Partner>>,
) -> (Vec<PartnerRow>, Vec<&'a str>) {
    let mut rows: Vec<PartnerRow> = Vec::new();
    let mut matched: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for (business_id, national_id) in resolved {
        let base = &national_id[..8.min(national_id.len())];
        for key in [base, national_id.as_str()] {
            if let Some((key, partners)) = groups.get_key_value(key) {
                matched.insert(key.as_str());
                rows.extend(partners.iter().map(|partner| PartnerRow {
                    business_id: *business_id,
                    national_id: national_id.clone(),
                    partner: partner.clone(),
                }));
            }
        }
    }
    let unmatched = groups
        .keys()
        .map(String::as_str)
        .filter(|key| !matched.contains(key))
        .collect();
    (rows, unmatched)
}
