//! # CNPJ CLI - Registry Transformation Runner
//!
//! Command-line entry point for the CNPJ registry ETL. It builds a run
//! specification from flags and the environment, drives the two-phase
//! transformation (or the partners-only import), and handles graceful
//! shutdown on CTRL-C.
//!
//! ## Usage
//!
//! ```bash
//! # Full two-phase load into the JSON table
//! cnpj-cli transform --data-dir /data/cnpj --database-url postgres://localhost/cnpj
//!
//! # Structured tables, clean slate, no PII stripping
//! cnpj-cli transform -d /data/cnpj --structured --clean-up --no-privacy
//!
//! # Re-import partners into an existing venue table
//! cnpj-cli partners -d /data/cnpj
//!
//! # Enable debug logging
//! RUST_LOG=debug cnpj-cli transform -d /data/cnpj
//! ```

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use cnpj_core::RunSpec;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cnpj-cli")]
#[command(about = "Batch ETL for the Brazilian CNPJ public registry")]
#[command(long_about = "
cnpj-cli transforms the Federal Revenue CSV drop into a queryable database.
Phase A stages the auxiliary streams into a temporary key-value store;
Phase B joins the venue streams against it and batch-writes enriched
company records. Re-runs are safe: every write is an upsert on a natural key.
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full two-phase transformation
    Transform(TransformArgs),
    /// Re-import partner rows into an existing venue table
    Partners(CommonArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory holding the downloaded CSV files
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Connection string of the output database
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
}

#[derive(Args, Debug)]
struct TransformArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Concurrent batch-write workers against the database
    #[arg(long, default_value_t = 4)]
    max_parallel_db_queries: usize,

    /// Hint for the key-value writer pool size
    #[arg(long, default_value_t = 256)]
    max_parallel_kv_writes: usize,

    /// Companies per write transaction
    #[arg(long, default_value_t = 512)]
    batch_size: usize,

    /// Drop and recreate the output schema before loading
    #[arg(long)]
    clean_up: bool,

    /// Keep personally identifying fields in the output
    #[arg(long)]
    no_privacy: bool,

    /// Write structured venue/partner tables instead of the JSON column
    #[arg(long)]
    structured: bool,
}

impl TransformArgs {
    fn into_spec(self) -> RunSpec {
        RunSpec {
            data_dir: self.common.data_dir,
            database_url: self.common.database_url,
            max_parallel_db_queries: self.max_parallel_db_queries,
            max_parallel_kv_writes: self.max_parallel_kv_writes,
            batch_size: self.batch_size,
            clean_up: self.clean_up,
            privacy: !self.no_privacy,
            structured: self.structured,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let run = {
        let cancel = cancel.clone();
        async move {
            match cli.command {
                Command::Transform(args) => {
                    let spec = args.into_spec();
                    cnpj_tx::pipeline::run(&spec, cancel).await
                }
                Command::Partners(common) => {
                    let spec = RunSpec::new(common.data_dir, common.database_url);
                    cnpj_tx::partners::import_partners(&spec, cancel).await
                }
            }
        }
    };
    tokio::pin!(run);

    tokio::select! {
        _ = signal::ctrl_c() => {
            eprintln!("\nReceived Ctrl-C, shutting down...");
            cancel.cancel();
            // let in-flight transactions settle and the staging dir clean up
            run.await
        }
        result = &mut run => result,
    }
}
