//! # CNPJ I/O - Sources, Lookups, and the Relational Sink
//!
//! This crate provides the edges of the registry pipeline: streaming readers
//! over the Federal Revenue CSV drops, the in-memory lookup tables consulted
//! during decoding, and the Postgres sink the enriched companies land in.
//!
//! ## Features
//!
//! ### Data Sources
//! - **CSV**: kind-matched file enumeration, Latin-1 semicolon-delimited
//!   streaming, per-row cancellation, size-based row estimates for progress
//!
//! ### Lookup Tables
//! - Six file-backed code-to-description maps plus the registry's fixed
//!   in-code mappings; loaded once, shared read-only
//!
//! ### Data Sinks
//! - **Postgres**: JSON (`COPY`) and structured (upsert) emission modes,
//!   batch transactions, bulk-load table hints, secondary indexes, and the
//!   partners-only batch helpers

/// CSV file source over one registry stream kind
pub mod source_csv;

/// Code-to-description lookup tables
pub mod lookups;

/// Postgres sink with JSON and structured emission modes
pub mod sink_postgres;

pub use lookups::Lookups;
pub use sink_postgres::{OutputMode, PartnerRow, PostgresSink};
pub use source_csv::CsvSource;
