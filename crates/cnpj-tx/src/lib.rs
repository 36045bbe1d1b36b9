//! # CNPJ Transform - Staging, Enrichment, and Orchestration
//!
//! This crate is the middle of the registry pipeline: everything between the
//! CSV readers and the relational sink.
//!
//! ## Phases
//!
//! - **Phase A** ([`stage`]): decode the seven auxiliary streams and stage
//!   them into an embedded ordered KV store, keyed so that one base ID pulls
//!   back everything needed to enrich a venue
//! - **Phase B** ([`pipeline`]): stream the venue files, join each row
//!   against the stage store, and batch-write the enriched companies
//!
//! ## Components
//!
//! - [`decode`]: per-kind row decoders and the stage-key schema
//! - [`stage`]: the KV stager (chunker, writer pool, value-log maintenance)
//! - [`enrich`]: the concurrent four-way join against the stage store
//! - [`pipeline`]: the orchestrator owning the staging directory and the
//!   two-phase lifecycle
//! - [`partners`]: the partners-only re-import path

/// Per-kind row decoders and the stage-key schema
pub mod decode;

/// Phase B enrichment against the stage store
pub mod enrich;

/// Partners-only ingestion path
pub mod partners;

/// Orchestrator for the two-phase run
pub mod pipeline;

/// Phase A staging into the embedded KV store
pub mod stage;

pub use enrich::Enricher;
pub use pipeline::run;
