//! Relational sink for enriched companies.
//!
//! Two emission modes behind one `write_batch` operation:
//!
//! - **JSON**: one row per company with the full record as a JSONB document,
//!   loaded through `COPY` (fastest path, no upsert).
//! - **Structured**: scalar fields into the `business` table, partners into
//!   `socios_cnpj`, both upserted so that re-runs converge on the same rows.
//!
//! Every batch is exactly one transaction. Upserts are keyed on natural keys
//! (`national_id`, and `(national_id, partner_name)` for partners), which is
//! what makes interrupted runs safe to repeat.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use cnpj_core::{model::strip_non_digits, Company, Partner};
use sqlx::postgres::{PgPoolCopyExt, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

const POOL_MAX_CONNECTIONS: u32 = 128;
const POOL_MIN_CONNECTIONS: u32 = 1;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Longest partner tax ID the child table accepts; longer ones are skipped.
const MAX_PARTNER_TAX_ID_LEN: usize = 11;

/// How a batch of companies is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Json,
    Structured,
}

/// One partner row resolved against a venue surrogate key, used by the
/// partners-only import path.
#[derive(Debug, Clone)]
pub struct PartnerRow {
    pub business_id: i64,
    pub national_id: String,
    pub partner: Partner,
}

/// The relational target of Phase B.
pub struct PostgresSink {
    pool: PgPool,
    mode: OutputMode,
}

const CREATE_BUSINESS: &str = "CREATE TABLE IF NOT EXISTS business (
    id BIGSERIAL PRIMARY KEY,
    national_id TEXT NOT NULL UNIQUE,
    registered_name TEXT,
    trade_name TEXT,
    status_name TEXT,
    primary_cnae BIGINT,
    primary_cnae_description TEXT,
    secondary_cnaes_csv TEXT,
    capital NUMERIC,
    legal_nature_code INT,
    responsible_qualification TEXT,
    size_code INT,
    head_or_branch TEXT,
    status_date DATE,
    status_reason_code INT,
    activity_start_date DATE,
    email TEXT,
    postal_code TEXT,
    street_number TEXT,
    street TEXT,
    neighborhood TEXT,
    municipality TEXT,
    state TEXT,
    street_type_code TEXT,
    complement TEXT,
    phones_csv TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const CREATE_PARTNERS: &str = "CREATE TABLE IF NOT EXISTS socios_cnpj (
    id BIGSERIAL PRIMARY KEY,
    business_id BIGINT NOT NULL REFERENCES business (id),
    national_id TEXT NOT NULL,
    partner_name TEXT NOT NULL,
    partner_tax_id TEXT,
    entry_date DATE,
    qualification TEXT,
    UNIQUE (national_id, partner_name)
)";

const CREATE_JSON: &str = "CREATE TABLE IF NOT EXISTS cnpj (
    cursor BIGSERIAL,
    national_id TEXT NOT NULL,
    json JSONB NOT NULL
)";

const CREATE_META: &str = "CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

const BUSINESS_COLUMNS: &str = "national_id, registered_name, trade_name, status_name, \
    primary_cnae, primary_cnae_description, secondary_cnaes_csv, capital, \
    legal_nature_code, responsible_qualification, size_code, head_or_branch, \
    status_date, status_reason_code, activity_start_date, email, postal_code, \
    street_number, street, neighborhood, municipality, state, street_type_code, \
    complement, phones_csv";

const BUSINESS_UPDATE: &str = "registered_name = EXCLUDED.registered_name, \
    trade_name = EXCLUDED.trade_name, \
    status_name = EXCLUDED.status_name, \
    primary_cnae = EXCLUDED.primary_cnae, \
    primary_cnae_description = EXCLUDED.primary_cnae_description, \
    secondary_cnaes_csv = EXCLUDED.secondary_cnaes_csv, \
    capital = EXCLUDED.capital, \
    legal_nature_code = EXCLUDED.legal_nature_code, \
    responsible_qualification = EXCLUDED.responsible_qualification, \
    size_code = EXCLUDED.size_code, \
    head_or_branch = EXCLUDED.head_or_branch, \
    status_date = EXCLUDED.status_date, \
    status_reason_code = EXCLUDED.status_reason_code, \
    activity_start_date = EXCLUDED.activity_start_date, \
    email = EXCLUDED.email, \
    postal_code = EXCLUDED.postal_code, \
    street_number = EXCLUDED.street_number, \
    street = EXCLUDED.street, \
    neighborhood = EXCLUDED.neighborhood, \
    municipality = EXCLUDED.municipality, \
    state = EXCLUDED.state, \
    street_type_code = EXCLUDED.street_type_code, \
    complement = EXCLUDED.complement, \
    phones_csv = EXCLUDED.phones_csv, \
    updated_at = now()";

impl PostgresSink {
    /// Open a bounded pool against the target database.
    pub async fn connect(database_url: &str, mode: OutputMode) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .min_connections(POOL_MIN_CONNECTIONS)
            .idle_timeout(POOL_IDLE_TIMEOUT)
            .max_lifetime(POOL_MAX_LIFETIME)
            .connect(database_url)
            .await
            .context("connect to the output database")?;
        Ok(Self { pool, mode })
    }

    /// Drop and recreate the output schema (clean-up mode).
    pub async fn create_schema(&self) -> Result<()> {
        for stmt in [
            "DROP TABLE IF EXISTS socios_cnpj",
            "DROP TABLE IF EXISTS business",
            "DROP TABLE IF EXISTS cnpj",
            "DROP TABLE IF EXISTS meta",
        ] {
            sqlx::query(stmt).execute(&self.pool).await.with_context(|| stmt.to_string())?;
        }
        self.ensure_schema().await
    }

    /// Create the output tables if they do not exist (resumable mode).
    pub async fn ensure_schema(&self) -> Result<()> {
        let tables: &[&str] = match self.mode {
            OutputMode::Json => &[CREATE_JSON, CREATE_META],
            OutputMode::Structured => &[CREATE_BUSINESS, CREATE_PARTNERS, CREATE_META],
        };
        for stmt in tables {
            sqlx::query(stmt).execute(&self.pool).await.with_context(|| stmt.to_string())?;
        }
        Ok(())
    }

    /// Persist one batch in a single transaction. Returns the number of
    /// companies written; invalid rows are skipped with a warning.
    pub async fn write_batch(&self, batch: &[Company]) -> Result<usize> {
        let valid = filter_valid(batch);
        if valid.is_empty() {
            return Ok(0);
        }
        match self.mode {
            OutputMode::Json => self.write_json(&valid).await,
            OutputMode::Structured => self.write_structured(&valid).await,
        }
    }

    async fn write_json(&self, companies: &[&Company]) -> Result<usize> {
        let buf = copy_buffer(companies)?;
        let mut copy = self
            .pool
            .copy_in_raw("COPY cnpj (national_id, json) FROM STDIN WITH (FORMAT csv)")
            .await?;
        copy.send(buf.as_bytes()).await?;
        copy.finish().await?;
        Ok(companies.len())
    }

    async fn write_structured(&self, companies: &[&Company]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        apply_tx_hints(&mut tx).await;

        // 1. multi-row venue upsert, returning surrogate keys
        let mut qb = business_upsert(companies);
        let returned = qb.build().fetch_all(&mut *tx).await?;
        let mut ids: HashMap<String, i64> = HashMap::with_capacity(companies.len());
        for row in &returned {
            ids.insert(row.get("national_id"), row.get("id"));
        }

        // 2. resolve ids the upsert did not return
        let missing: Vec<String> = companies
            .iter()
            .filter(|c| !ids.contains_key(&c.cnpj))
            .map(|c| c.cnpj.clone())
            .collect();
        if !missing.is_empty() {
            let rows =
                sqlx::query("SELECT id, national_id FROM business WHERE national_id = ANY($1)")
                    .bind(&missing)
                    .fetch_all(&mut *tx)
                    .await?;
            for row in &rows {
                ids.insert(row.get("national_id"), row.get("id"));
            }
        }

        // 3. multi-row partner insert against the surrogate keys
        let mut partner_rows: Vec<(i64, &str, &Partner)> = Vec::new();
        for company in companies {
            let Some(&business_id) = ids.get(&company.cnpj) else {
                warn!(national_id = %company.cnpj, "venue id not resolved, partners skipped");
                continue;
            };
            for partner in &company.partners {
                if !partner_is_valid(partner) {
                    warn!(
                        national_id = %company.cnpj,
                        partner = %partner.name,
                        "partner tax id longer than {MAX_PARTNER_TAX_ID_LEN} digits, skipped"
                    );
                    continue;
                }
                partner_rows.push((business_id, company.cnpj.as_str(), partner));
            }
        }
        if !partner_rows.is_empty() {
            let mut qb = partners_insert(&partner_rows);
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(companies.len())
    }

    /// Mark bulk-load optimizations before Phase B. Every failure here is
    /// advisory: logged and ignored.
    pub async fn pre_load(&self) {
        let stmts: &[&str] = match self.mode {
            OutputMode::Json => &[
                "ALTER TABLE cnpj SET UNLOGGED",
                "ALTER TABLE cnpj SET (autovacuum_enabled = false)",
                "VACUUM (ANALYZE) cnpj",
            ],
            // children first, parents after
            OutputMode::Structured => &[
                "ALTER TABLE socios_cnpj SET UNLOGGED",
                "ALTER TABLE business SET UNLOGGED",
                "ALTER TABLE business SET (autovacuum_enabled = false)",
                "ALTER TABLE socios_cnpj SET (autovacuum_enabled = false)",
                "VACUUM (ANALYZE) business",
                "VACUUM (ANALYZE) socios_cnpj",
            ],
        };
        self.run_advisory(stmts).await;
    }

    /// Undo the bulk-load optimizations after Phase B, parents before
    /// children. Advisory as well.
    pub async fn post_load(&self) {
        let stmts: &[&str] = match self.mode {
            OutputMode::Json => &[
                "ALTER TABLE cnpj SET LOGGED",
                "ALTER TABLE cnpj SET (autovacuum_enabled = true)",
                "VACUUM (ANALYZE) cnpj",
            ],
            OutputMode::Structured => &[
                "ALTER TABLE business SET LOGGED",
                "ALTER TABLE socios_cnpj SET LOGGED",
                "ALTER TABLE business SET (autovacuum_enabled = true)",
                "ALTER TABLE socios_cnpj SET (autovacuum_enabled = true)",
                "VACUUM (ANALYZE) business",
                "VACUUM (ANALYZE) socios_cnpj",
            ],
        };
        self.run_advisory(stmts).await;
    }

    async fn run_advisory(&self, stmts: &[&str]) {
        for stmt in stmts {
            if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
                warn!(statement = stmt, error = %e, "bulk-load hint not applied");
            }
        }
    }

    /// Build the secondary indexes over the output table.
    pub async fn create_indexes(&self) -> Result<()> {
        let stmts: &[&str] = match self.mode {
            OutputMode::Json => &[
                "CREATE INDEX IF NOT EXISTS idx_cnpj_national_id ON cnpj (national_id)",
                "CREATE INDEX IF NOT EXISTS idx_cnpj_base ON cnpj (LEFT(national_id, 8))",
                "CREATE INDEX IF NOT EXISTS idx_cnpj_trade_name ON cnpj ((json->>'trade_name'))",
                "CREATE INDEX IF NOT EXISTS idx_cnpj_primary_cnae ON cnpj ((json->>'primary_cnae'))",
            ],
            OutputMode::Structured => &[
                "CREATE INDEX IF NOT EXISTS idx_business_base ON business (LEFT(national_id, 8))",
                "CREATE INDEX IF NOT EXISTS idx_socios_business_id ON socios_cnpj (business_id)",
                "CREATE INDEX IF NOT EXISTS idx_socios_national_id ON socios_cnpj (national_id)",
            ],
        };
        for stmt in stmts {
            info!(statement = stmt, "building index");
            sqlx::query(stmt).execute(&self.pool).await.with_context(|| stmt.to_string())?;
        }
        Ok(())
    }

    /// Stamp the data-set updated-at marker, exactly once per successful run.
    pub async fn stamp_updated_at(&self, stamp: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES ('updated-at', $1) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(stamp.trim())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Functional index the partners-only path needs for base-ID resolution.
    pub async fn ensure_base_index(&self) -> Result<()> {
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_business_base ON business (LEFT(national_id, 8))")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resolve grouping keys to `(surrogate id, national id)` pairs in two
    /// batch queries: a left-prefix lookup for 8-digit base IDs and an exact
    /// match for 14-digit ones.
    pub async fn resolve_business_ids(&self, keys: &[String]) -> Result<Vec<(i64, String)>> {
        let (bases, fulls): (Vec<String>, Vec<String>) =
            keys.iter().cloned().partition(|k| k.len() == 8);

        let mut out = Vec::new();
        if !bases.is_empty() {
            let rows = sqlx::query(
                "SELECT id, national_id FROM business WHERE LEFT(national_id, 8) = ANY($1)",
            )
            .bind(&bases)
            .fetch_all(&self.pool)
            .await?;
            out.extend(rows.iter().map(|r| (r.get("id"), r.get("national_id"))));
        }
        if !fulls.is_empty() {
            let rows = sqlx::query("SELECT id, national_id FROM business WHERE national_id = ANY($1)")
                .bind(&fulls)
                .fetch_all(&self.pool)
                .await?;
            out.extend(rows.iter().map(|r| (r.get("id"), r.get("national_id"))));
        }
        Ok(out)
    }

    /// Insert resolved partner rows, skipping duplicates. Used by the
    /// partners-only import path.
    pub async fn insert_partner_rows(&self, rows: &[PartnerRow]) -> Result<u64> {
        let valid: Vec<(i64, &str, &Partner)> = rows
            .iter()
            .filter(|r| {
                if partner_is_valid(&r.partner) {
                    true
                } else {
                    warn!(
                        national_id = %r.national_id,
                        partner = %r.partner.name,
                        "partner tax id longer than {MAX_PARTNER_TAX_ID_LEN} digits, skipped"
                    );
                    false
                }
            })
            .map(|r| (r.business_id, r.national_id.as_str(), &r.partner))
            .collect();
        if valid.is_empty() {
            return Ok(0);
        }
        let mut qb = partners_insert(&valid);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// Keep only companies whose national ID is exactly 14 digits after
/// non-digit stripping.
fn filter_valid(batch: &[Company]) -> Vec<&Company> {
    batch
        .iter()
        .filter(|c| {
            let digits = strip_non_digits(&c.cnpj);
            if digits.len() == 14 && digits == c.cnpj {
                true
            } else {
                warn!(national_id = %c.cnpj, "national id is not 14 digits, row skipped");
                false
            }
        })
        .collect()
}

fn partner_is_valid(partner: &Partner) -> bool {
    partner.tax_id.chars().count() <= MAX_PARTNER_TAX_ID_LEN
}

fn business_upsert<'a>(companies: &'a [&'a Company]) -> QueryBuilder<'a, Postgres> {
    let mut qb: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO business ({BUSINESS_COLUMNS}) "));
    qb.push_values(companies.iter(), |mut b, c| {
        b.push_bind(c.cnpj.as_str())
            .push_bind(c.registered_name.as_str())
            .push_bind(c.trade_name.as_str())
            .push_bind(c.status_name.as_str())
            .push_bind(c.primary_cnae)
            .push_bind(c.primary_cnae_description.as_str())
            .push_bind(c.secondary_cnaes_csv())
            .push_bind(c.capital)
            .push_bind(c.legal_nature_code)
            .push_bind(c.responsible_qualification.as_str())
            .push_bind(c.size_code)
            .push_bind(c.head_or_branch.as_str())
            .push_bind(c.status_date.map(NaiveDate::from))
            .push_bind(c.status_reason_code)
            .push_bind(c.activity_start_date.map(NaiveDate::from))
            .push_bind(c.email.as_deref())
            .push_bind(c.postal_code.as_str())
            .push_bind(c.number.as_str())
            .push_bind(c.street.as_str())
            .push_bind(c.neighborhood.as_str())
            .push_bind(c.municipality_name.as_str())
            .push_bind(c.state.as_str())
            .push_bind(c.street_type.as_str())
            .push_bind(c.complement.as_str())
            .push_bind(c.phones_csv());
    });
    qb.push(format!(
        " ON CONFLICT (national_id) DO UPDATE SET {BUSINESS_UPDATE} RETURNING id, national_id"
    ));
    qb
}

fn partners_insert<'a>(rows: &'a [(i64, &'a str, &'a Partner)]) -> QueryBuilder<'a, Postgres> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO socios_cnpj \
         (business_id, national_id, partner_name, partner_tax_id, entry_date, qualification) ",
    );
    qb.push_values(rows.iter(), |mut b, (business_id, national_id, partner)| {
        b.push_bind(*business_id)
            .push_bind(*national_id)
            .push_bind(partner.name.as_str())
            .push_bind((!partner.tax_id.is_empty()).then_some(partner.tax_id.as_str()))
            .push_bind(partner.entry_date.map(NaiveDate::from))
            .push_bind(partner.qualification.as_str());
    });
    qb.push(" ON CONFLICT (national_id, partner_name) DO NOTHING");
    qb
}

async fn apply_tx_hints(tx: &mut Transaction<'_, Postgres>) {
    for stmt in ["SET LOCAL synchronous_commit = off", "SET LOCAL work_mem = '128MB'"] {
        if let Err(e) = sqlx::query(stmt).execute(&mut **tx).await {
            warn!(statement = stmt, error = %e, "transaction hint not applied");
        }
    }
}

/// One CSV line per company for the `COPY` path, the JSON document quoted.
fn copy_buffer(companies: &[&Company]) -> Result<String> {
    let mut buf = String::with_capacity(companies.len() * 2048);
    for company in companies {
        let json = serde_json::to_string(company)?;
        buf.push_str(&company.cnpj);
        buf.push(',');
        buf.push_str(&csv_quote(&json));
        buf.push('\n');
    }
    Ok(buf)
}

fn csv_quote(field: &str) -> String {
    let mut quoted = String::with_capacity(field.len() + 2);
    quoted.push('"');
    for c in field.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
