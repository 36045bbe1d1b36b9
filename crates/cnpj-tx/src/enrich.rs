//! Phase B enrichment: assemble a full Company from the staged KV store.
//!
//! The four enrichment reads (base, partners, simple taxes, tax regimes) run
//! concurrently; the first error fails the enrichment and, through the task
//! group, the run. A value that fails to decode is row-level: logged and
//! dropped, the company still comes out.

use anyhow::Result;
use cnpj_core::{Company, Partner, SimpleTaxStatus, TaxRegimes};
use rocksdb::DB;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::decode::{BaseRecord, RegimeKind, StagedRegime};
use crate::stage::prefix_values;

pub struct Enricher {
    db: Arc<DB>,
    privacy: bool,
}

impl Enricher {
    pub fn new(db: Arc<DB>, privacy: bool) -> Self {
        Self { db, privacy }
    }

    /// Fold the staged records for this venue into the seeded company.
    pub async fn enrich(&self, mut company: Company) -> Result<Company> {
        let base_key = format!("base:{}", company.base_cnpj);
        let partner_prefix = format!("partner:{}:", company.base_cnpj);
        let simple_prefix = format!("simple:{}:", company.base_cnpj);
        let regime_prefix = format!("regime:{}:", company.cnpj);

        let (base, partners, simple, regimes) = tokio::try_join!(
            read_base(self.db.clone(), base_key),
            read_partners(self.db.clone(), partner_prefix),
            read_simple(self.db.clone(), simple_prefix),
            read_regimes(self.db.clone(), regime_prefix),
        )?;

        if let Some(base) = base {
            company.registered_name = base.registered_name;
            company.legal_nature_code = base.legal_nature_code;
            company.legal_nature = base.legal_nature;
            company.responsible_qualification_code = base.responsible_qualification_code;
            company.responsible_qualification = base.responsible_qualification;
            company.capital = base.capital;
            company.size_code = base.size_code;
            company.size = base.size;
            company.federated_entity_responsible = base.federated_entity_responsible;
        }
        company.partners = partners;
        company.simple_taxes = simple;
        company.tax_regimes = regimes;

        if self.privacy {
            company.scrub_private_fields();
        }
        Ok(company)
    }
}

/// Point-read of the base record; a miss leaves the base fields empty.
async fn read_base(db: Arc<DB>, key: String) -> Result<Option<BaseRecord>> {
    tokio::task::spawn_blocking(move || {
        let Some(bytes) = db.get(key.as_bytes())? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(base) => Ok(Some(base)),
            Err(e) => {
                warn!(key, error = %e, "staged base record dropped");
                Ok(None)
            }
        }
    })
    .await?
}

/// Prefix scan of the partner rows, de-duplicated by partner name.
async fn read_partners(db: Arc<DB>, prefix: String) -> Result<Vec<Partner>> {
    tokio::task::spawn_blocking(move || {
        let mut partners: Vec<Partner> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for value in prefix_values(&db, prefix.as_bytes())? {
            match serde_json::from_slice::<Partner>(&value) {
                Ok(partner) => {
                    if seen.insert(partner.name.clone()) {
                        partners.push(partner);
                    }
                }
                Err(e) => warn!(prefix, error = %e, "staged partner dropped"),
            }
        }
        Ok(partners)
    })
    .await?
}

/// Prefix scan of the simple-tax rows; the latest staged entry wins.
async fn read_simple(db: Arc<DB>, prefix: String) -> Result<Option<SimpleTaxStatus>> {
    tokio::task::spawn_blocking(move || {
        let mut status = None;
        for value in prefix_values(&db, prefix.as_bytes())? {
            match serde_json::from_slice::<SimpleTaxStatus>(&value) {
                Ok(s) => status = Some(s),
                Err(e) => warn!(prefix, error = %e, "staged simple-tax record dropped"),
            }
        }
        Ok(status)
    })
    .await?
}

/// Prefix scan of the tax-regime rows, folded into the four annual series.
async fn read_regimes(db: Arc<DB>, prefix: String) -> Result<TaxRegimes> {
    tokio::task::spawn_blocking(move || {
        let mut regimes = TaxRegimes::default();
        for value in prefix_values(&db, prefix.as_bytes())? {
            match serde_json::from_slice::<StagedRegime>(&value) {
                Ok(staged) => {
                    let series = match staged.regime {
                        RegimeKind::RealProfit => &mut regimes.real_profit,
                        RegimeKind::PresumedProfit => &mut regimes.presumed_profit,
                        RegimeKind::ArbitratedProfit => &mut regimes.arbitrated_profit,
                        RegimeKind::ExemptImmune => &mut regimes.immune_exempt,
                    };
                    series.insert(staged.entry);
                }
                Err(e) => warn!(prefix, error = %e, "staged tax-regime record dropped"),
            }
        }
        Ok(regimes)
    })
    .await?
}
