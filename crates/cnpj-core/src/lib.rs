//! # CNPJ Core - Shared Types for the Registry ETL
//!
//! This crate provides the foundational types, traits, and abstractions for the
//! CNPJ registry transformation pipeline. It defines the messaging aliases used
//! between pipeline tasks, the source-kind taxonomy of the Federal Revenue CSV
//! drops, the output data model, run configuration, and the error taxonomy.
//!
//! ## Key Components
//!
//! - **Source Kinds**: the eight recognized CSV stream kinds and their filename
//!   conventions
//! - **Data Model**: [`model::Company`] and its child records, the shape of every
//!   record the pipeline emits
//! - **Configuration**: [`config::RunSpec`] with every per-run knob and default
//! - **Error Handling**: [`error::EtlError`] covering the row / batch / phase
//!   error taxonomy
//!
//! ## Example Usage
//!
//! ```rust
//! use cnpj_core::{SourceKind, SourceRow};
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (tx, mut rx) = mpsc::channel::<SourceRow>(1000);
//! // Reader tasks clone `tx`; the chunker drains `rx` until every sender drops.
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod error;
pub mod model;

pub use config::RunSpec;
pub use error::EtlError;
pub use model::{Company, Partner, RegimeEntry, SimpleTaxStatus, SourceDate, TaxRegimes};

/// One raw CSV row tagged with the stream kind it was read from.
///
/// Rows transfer ownership to the receiver when sent across a channel; the
/// reader keeps nothing once a row is emitted.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub kind: SourceKind,
    pub record: csv::StringRecord,
}

/// Type alias for the sender side of a row channel between pipeline tasks
pub type RowTx = mpsc::Sender<SourceRow>;

/// Type alias for the receiver side of a row channel between pipeline tasks
pub type RowRx = mpsc::Receiver<SourceRow>;

/// Trait for row-producing pipeline sources
///
/// A source drains every file it owns and emits rows downstream. Rows from one
/// file arrive in file order; no ordering is promised across sources or across
/// files of the same kind.
#[async_trait]
pub trait Source: Send + Sync {
    /// Returns the display name of this source, used for logging and progress.
    fn name(&self) -> &str;

    /// Drain all files of this source into `tx`.
    ///
    /// Returns on EOF or when `cancel` fires; cancellation is honored at
    /// per-row granularity. A malformed row is logged and skipped, never
    /// aborting the stream.
    async fn run(&self, tx: RowTx, cancel: CancellationToken) -> Result<()>;
}

/// The eight recognized CSV stream kinds of a registry drop.
///
/// Every kind maps to a filename substring of the published archives. The four
/// tax-regime kinds share one column layout and differ only in which annual
/// series they feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Company base data, one row per 8-digit base ID (`Empresas`)
    Base,
    /// Venues / establishments, one row per 14-digit CNPJ (`Estabelecimentos`)
    Venue,
    /// Partners, zero or more rows per base ID (`Socios`)
    Partner,
    /// Simple-regime and MEI options (`Simples`)
    Simple,
    /// Real-profit tax regime annual series (`Lucro Real`)
    RealProfit,
    /// Presumed-profit tax regime annual series (`Lucro Presumido`)
    PresumedProfit,
    /// Arbitrated-profit tax regime annual series (`Lucro Arbitrado`)
    ArbitratedProfit,
    /// Immune or exempt entities annual series (`Imunes e Isentas`)
    ExemptImmune,
}

impl SourceKind {
    /// The seven kinds staged into the KV store during Phase A.
    pub const STAGED: [SourceKind; 7] = [
        SourceKind::Base,
        SourceKind::Partner,
        SourceKind::Simple,
        SourceKind::RealProfit,
        SourceKind::PresumedProfit,
        SourceKind::ArbitratedProfit,
        SourceKind::ExemptImmune,
    ];

    /// Whether a file under the data directory belongs to this kind.
    ///
    /// Matching is by filename substring. `Lucro` alone means real profit:
    /// the presumed and arbitrated drops also carry the word, so those tokens
    /// are checked for absence.
    pub fn matches(&self, file_name: &str) -> bool {
        match self {
            SourceKind::Base => file_name.contains("Empresas"),
            SourceKind::Venue => file_name.contains("Estabelecimentos"),
            SourceKind::Partner => file_name.contains("Socios"),
            SourceKind::Simple => file_name.contains("Simples"),
            SourceKind::RealProfit => {
                file_name.contains("Lucro")
                    && !file_name.contains("Presumido")
                    && !file_name.contains("Arbitrado")
            }
            SourceKind::PresumedProfit => file_name.contains("Presumido"),
            SourceKind::ArbitratedProfit => file_name.contains("Arbitrado"),
            SourceKind::ExemptImmune => file_name.contains("Imune"),
        }
    }

    /// Average encoded row size in bytes, used to turn file sizes into a
    /// total-row estimate for progress bars. Good enough for a bar, not for
    /// correctness.
    pub fn avg_row_bytes(&self) -> u64 {
        match self {
            SourceKind::Base => 100,
            SourceKind::Venue => 240,
            SourceKind::Partner => 130,
            SourceKind::Simple => 60,
            SourceKind::RealProfit
            | SourceKind::PresumedProfit
            | SourceKind::ArbitratedProfit
            | SourceKind::ExemptImmune => 40,
        }
    }

    /// Accumulative kinds keep every row for an ID in the stage store and
    /// therefore carry a per-row hash suffix in their stage key.
    pub fn is_accumulative(&self) -> bool {
        !matches!(self, SourceKind::Base | SourceKind::Venue)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Base => "base",
            SourceKind::Venue => "venue",
            SourceKind::Partner => "partner",
            SourceKind::Simple => "simple",
            SourceKind::RealProfit => "real-profit",
            SourceKind::PresumedProfit => "presumed-profit",
            SourceKind::ArbitratedProfit => "arbitrated-profit",
            SourceKind::ExemptImmune => "exempt-immune",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matching_disambiguates_profit_drops() {
        assert!(SourceKind::RealProfit.matches("Lucro Real.csv"));
        assert!(!SourceKind::RealProfit.matches("Lucro Presumido.csv"));
        assert!(!SourceKind::RealProfit.matches("Lucro Arbitrado.csv"));
        assert!(SourceKind::PresumedProfit.matches("Lucro Presumido.csv"));
        assert!(SourceKind::ArbitratedProfit.matches("Lucro Arbitrado.csv"));
        assert!(SourceKind::ExemptImmune.matches("Imunes e Isentas.csv"));
    }

    #[test]
    fn kind_matching_recognizes_registry_archives() {
        assert!(SourceKind::Base.matches("K3241.K03200Y0.D40713.Empresas0.csv"));
        assert!(SourceKind::Venue.matches("K3241.K03200Y0.D40713.Estabelecimentos3.csv"));
        assert!(SourceKind::Partner.matches("K3241.K03200Y0.D40713.Socios9.csv"));
        assert!(SourceKind::Simple.matches("F.K03200$W.SIMPLES.CSV.D40713.Simples.csv"));
        assert!(!SourceKind::Base.matches("Estabelecimentos1.csv"));
    }

    #[test]
    fn staged_kinds_exclude_venues() {
        assert!(!SourceKind::STAGED.contains(&SourceKind::Venue));
        assert!(SourceKind::STAGED.iter().all(|k| k.is_accumulative() || *k == SourceKind::Base));
    }
}
