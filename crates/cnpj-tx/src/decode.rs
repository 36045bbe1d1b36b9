//! Per-kind row decoders.
//!
//! Each decoder takes one parsed CSV row plus the loaded lookups and returns
//! a typed record together with its stage key. Accumulative kinds (partners,
//! simple taxes, the four tax regimes) suffix the key with an md5 of the
//! row's concatenated fields so that every row for an ID coexists in the
//! stage store; the base kind keeps one record per base ID.
//!
//! Values are `serde_json` encodings of the typed records. Field order is
//! declaration order, so the encoding is deterministic.

use anyhow::Result;
use cnpj_core::model::{
    strip_non_digits, Cnae, Company, Partner, RegimeEntry, SimpleTaxStatus, SourceDate,
};
use cnpj_core::{EtlError, SourceKind, SourceRow};
use cnpj_io::lookups::{
    age_range, company_size, head_or_branch, partner_identifier, registration_status,
};
use cnpj_io::Lookups;
use md5::{Digest, Md5};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One key/value pair bound for the stage store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Company-level attributes staged from the base stream, merged into every
/// venue of the base ID during enrichment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseRecord {
    pub registered_name: String,
    pub legal_nature_code: Option<i32>,
    pub legal_nature: String,
    pub responsible_qualification_code: Option<i32>,
    pub responsible_qualification: String,
    pub capital: Option<Decimal>,
    pub size_code: Option<i32>,
    pub size: String,
    pub federated_entity_responsible: String,
}

/// Which annual series a staged tax-regime row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeKind {
    RealProfit,
    PresumedProfit,
    ArbitratedProfit,
    ExemptImmune,
}

impl TryFrom<SourceKind> for RegimeKind {
    type Error = anyhow::Error;

    fn try_from(kind: SourceKind) -> Result<RegimeKind> {
        match kind {
            SourceKind::RealProfit => Ok(RegimeKind::RealProfit),
            SourceKind::PresumedProfit => Ok(RegimeKind::PresumedProfit),
            SourceKind::ArbitratedProfit => Ok(RegimeKind::ArbitratedProfit),
            SourceKind::ExemptImmune => Ok(RegimeKind::ExemptImmune),
            other => anyhow::bail!("{} is not a tax-regime kind", other.label()),
        }
    }
}

/// One staged tax-regime row: a single annual entry of one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRegime {
    pub regime: RegimeKind,
    pub entry: RegimeEntry,
}

/// Decode a Phase A row into its stage entry. Errors here are row-level:
/// the caller logs and skips, the run continues.
///
/// Accumulative kinds get the per-row hash suffix; the others key on the ID
/// alone, so a later row for the same ID overwrites.
pub fn decode_staged(row: &SourceRow, lookups: &Lookups) -> Result<StageEntry> {
    let (namespace, id, value) = match row.kind {
        SourceKind::Base => {
            let (base_id, record) = decode_base(&row.record, lookups)?;
            ("base", base_id, serde_json::to_vec(&record)?)
        }
        SourceKind::Partner => {
            let (base_id, partner) = decode_partner(&row.record, lookups)?;
            ("partner", base_id, serde_json::to_vec(&partner)?)
        }
        SourceKind::Simple => {
            let (base_id, status) = decode_simple(&row.record)?;
            ("simple", base_id, serde_json::to_vec(&status)?)
        }
        SourceKind::RealProfit
        | SourceKind::PresumedProfit
        | SourceKind::ArbitratedProfit
        | SourceKind::ExemptImmune => {
            let (national_id, staged) = decode_regime(&row.record, row.kind)?;
            ("regime", national_id, serde_json::to_vec(&staged)?)
        }
        SourceKind::Venue => anyhow::bail!("venue rows are not staged"),
    };
    let key = if row.kind.is_accumulative() {
        format!("{namespace}:{id}:{}", row_hash(&row.record))
    } else {
        format!("{namespace}:{id}")
    };
    Ok(StageEntry { key: key.into_bytes(), value })
}

/// Decode one base-stream row into `(base id, record)`.
pub fn decode_base(record: &csv::StringRecord, lookups: &Lookups) -> Result<(String, BaseRecord)> {
    let base_id = base_id(field(record, 0))?;
    let legal_nature_code = opt_i32(record, 2);
    let responsible_qualification_code = opt_i32(record, 3);
    let size_code = opt_i32(record, 5);
    let base = BaseRecord {
        registered_name: field(record, 1).to_string(),
        legal_nature_code,
        legal_nature: lookups.legal_nature(legal_nature_code),
        responsible_qualification_code,
        responsible_qualification: lookups.qualification(responsible_qualification_code),
        capital: parse_capital(field(record, 4)),
        size_code,
        size: company_size(size_code),
        federated_entity_responsible: field(record, 6).to_string(),
    };
    Ok((base_id, base))
}

/// Decode one partner row into `(base id, partner)`.
pub fn decode_partner(record: &csv::StringRecord, lookups: &Lookups) -> Result<(String, Partner)> {
    let base_id = base_id(field(record, 0))?;
    let identifier_code = opt_i32(record, 1);
    let qualification_code = opt_i32(record, 4);
    let country_code = opt_i32(record, 6);
    let representative_qualification_code = opt_i32(record, 9);
    let age_range_code = opt_i32(record, 10);
    let partner = Partner {
        identifier_code,
        identifier: partner_identifier(identifier_code),
        name: field(record, 2).to_string(),
        tax_id: field(record, 3).to_string(),
        qualification_code,
        qualification: lookups.qualification(qualification_code),
        entry_date: opt_date(record, 5),
        country_code,
        country_name: lookups.country(country_code),
        representative_tax_id: field(record, 7).to_string(),
        representative_name: field(record, 8).to_string(),
        representative_qualification_code,
        representative_qualification: lookups.qualification(representative_qualification_code),
        age_range_code,
        age_range: age_range(age_range_code),
    };
    Ok((base_id, partner))
}

/// Decode one simple/MEI row into `(base id, status)`.
pub fn decode_simple(record: &csv::StringRecord) -> Result<(String, SimpleTaxStatus)> {
    let base_id = base_id(field(record, 0))?;
    let status = SimpleTaxStatus {
        simple: field(record, 1).eq_ignore_ascii_case("S"),
        simple_entry_date: opt_date(record, 2),
        simple_exit_date: opt_date(record, 3),
        mei: field(record, 4).eq_ignore_ascii_case("S"),
        mei_entry_date: opt_date(record, 5),
        mei_exit_date: opt_date(record, 6),
    };
    Ok((base_id, status))
}

/// Decode one tax-regime row into `(14-digit id, staged entry)`.
///
/// The year field doubles as the malformed-row guard: a stray header line
/// fails the parse and is skipped like any other bad row.
pub fn decode_regime(record: &csv::StringRecord, kind: SourceKind) -> Result<(String, StagedRegime)> {
    let year = field(record, 0)
        .parse::<i32>()
        .map_err(|_| anyhow::anyhow!("tax-regime year {:?} is not a number", field(record, 0)))?;
    let digits = strip_non_digits(field(record, 1));
    if digits.len() != 14 {
        return Err(EtlError::InvalidNationalId { id: field(record, 1).to_string(), len: digits.len() }
            .into());
    }
    let staged = StagedRegime {
        regime: RegimeKind::try_from(kind)?,
        entry: RegimeEntry { year, scholarships: opt_i64(record, 4).unwrap_or(0) },
    };
    Ok((digits, staged))
}

/// Decode one venue row into the Company seed Phase B enriches.
pub fn decode_venue(record: &csv::StringRecord, lookups: &Lookups) -> Result<Company> {
    let base = strip_non_digits(field(record, 0));
    let order = strip_non_digits(field(record, 1));
    let check = strip_non_digits(field(record, 2));
    let cnpj = format!("{base}{order}{check}");
    if base.len() != 8 || cnpj.len() != 14 {
        return Err(EtlError::InvalidNationalId { id: cnpj.clone(), len: cnpj.len() }.into());
    }

    let head_or_branch_code = opt_i32(record, 3);
    let status_code = opt_i32(record, 5);
    let status_reason_code = opt_i32(record, 7);
    let country_code = opt_i32(record, 9);
    let primary_cnae = opt_i64(record, 11);
    let municipality_code = opt_i32(record, 20);

    let secondary_cnaes = field(record, 12)
        .split(',')
        .filter_map(|code| code.trim().parse::<i64>().ok())
        .map(|code| Cnae { code, description: lookups.cnae(Some(code)) })
        .collect();

    let email = field(record, 27);
    Ok(Company {
        cnpj,
        base_cnpj: base,
        order_cnpj: order,
        check_cnpj: check,
        head_or_branch_code,
        head_or_branch: head_or_branch(head_or_branch_code),
        trade_name: field(record, 4).to_string(),
        status_code,
        status_name: registration_status(status_code),
        status_date: opt_date(record, 6),
        status_reason_code,
        status_reason: lookups.reason(status_reason_code),
        city_abroad_name: field(record, 8).to_string(),
        country_code,
        country_name: lookups.country(country_code),
        activity_start_date: opt_date(record, 10),
        primary_cnae,
        primary_cnae_description: lookups.cnae(primary_cnae),
        secondary_cnaes,
        street_type: field(record, 13).to_string(),
        street: field(record, 14).to_string(),
        number: field(record, 15).to_string(),
        complement: field(record, 16).to_string(),
        neighborhood: field(record, 17).to_string(),
        postal_code: strip_non_digits(field(record, 18)),
        state: field(record, 19).to_string(),
        municipality_code,
        municipality_name: lookups.municipality(municipality_code),
        phone_1: join_phone(field(record, 21), field(record, 22)),
        phone_2: join_phone(field(record, 23), field(record, 24)),
        fax: join_phone(field(record, 25), field(record, 26)),
        email: (!email.is_empty()).then(|| email.to_string()),
        special_situation: field(record, 28).to_string(),
        special_situation_date: opt_date(record, 29),
        ..Company::default()
    })
}

/// md5 of the row's concatenated fields, hex-encoded.
pub fn row_hash(record: &csv::StringRecord) -> String {
    let mut hasher = Md5::new();
    for field in record.iter() {
        hasher.update(field.as_bytes());
    }
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn base_id(raw: &str) -> Result<String> {
    let digits = strip_non_digits(raw);
    if digits.len() != 8 {
        return Err(EtlError::InvalidNationalId { id: raw.to_string(), len: digits.len() }.into());
    }
    Ok(digits)
}

fn field<'a>(record: &'a csv::StringRecord, idx: usize) -> &'a str {
    record.get(idx).map(str::trim).unwrap_or("")
}

fn opt_i32(record: &csv::StringRecord, idx: usize) -> Option<i32> {
    field(record, idx).parse().ok()
}

fn opt_i64(record: &csv::StringRecord, idx: usize) -> Option<i64> {
    field(record, idx).parse().ok()
}

fn opt_date(record: &csv::StringRecord, idx: usize) -> Option<SourceDate> {
    SourceDate::from_compact(field(record, idx))
}

/// Capital values use a comma as the decimal separator; plain integers are
/// accepted as well.
fn parse_capital(raw: &str) -> Option<Decimal> {
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(&raw.replace(',', ".")).ok()
}

fn join_phone(ddd: &str, number: &str) -> String {
    let number = strip_non_digits(number);
    if number.is_empty() {
        return String::new();
    }
    format!("{}{}", strip_non_digits(ddd), number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnpj_core::model::split_national_id;

    fn record(fields: &[&str]) -> csv::StringRecord {
        csv::StringRecord::from(fields.to_vec())
    }

    fn lookups() -> Lookups {
        Lookups::with_entries(
            &[(6201501, "Desenvolvimento de programas"), (6204000, "Consultoria em TI")],
            &[(7107, "SÃO PAULO")],
            &[(2062, "Sociedade Empresária Limitada")],
            &[(49, "Sócio-Administrador"), (5, "Administrador")],
            &[(105, "BRASIL")],
            &[(1, "EXTINÇÃO POR ENCERRAMENTO")],
        )
    }

    #[test]
    fn base_rows_stage_without_hash_suffix() {
        let row = SourceRow {
            kind: SourceKind::Base,
            record: record(&["12345678", "ACME LTDA", "2062", "49", "100000,00", "05", ""]),
        };
        let entry = decode_staged(&row, &lookups()).unwrap();
        assert_eq!(entry.key, b"base:12345678");

        let base: BaseRecord = serde_json::from_slice(&entry.value).unwrap();
        assert_eq!(base.registered_name, "ACME LTDA");
        assert_eq!(base.legal_nature, "Sociedade Empresária Limitada");
        assert_eq!(base.responsible_qualification, "Sócio-Administrador");
        assert_eq!(base.capital, Some(Decimal::from_str("100000.00").unwrap()));
        assert_eq!(base.size, "DEMAIS");
    }

    #[test]
    fn accumulative_rows_carry_the_row_hash() {
        let fields =
            ["22222222", "2", "ALICE", "***123456**", "49", "20150701", "", "", "", "", "4"];
        let row = SourceRow { kind: SourceKind::Partner, record: record(&fields) };
        let entry = decode_staged(&row, &lookups()).unwrap();
        let key = String::from_utf8(entry.key.clone()).unwrap();
        let expected = format!("partner:22222222:{}", row_hash(&row.record));
        assert_eq!(key, expected);

        // identical rows collapse to the same key, distinct rows do not
        let same = decode_staged(&row, &lookups()).unwrap();
        assert_eq!(entry.key, same.key);
        let mut other_fields = fields;
        other_fields[2] = "BOB";
        let other = SourceRow { kind: SourceKind::Partner, record: record(&other_fields) };
        assert_ne!(decode_staged(&other, &lookups()).unwrap().key, entry.key);
    }

    #[test]
    fn partner_rows_decode_with_lookup_enrichment() {
        let rec = record(&[
            "22222222", "2", "ALICE", "***123456**", "49", "20150701", "105", "***654321**",
            "CAROL", "5", "4",
        ]);
        let (base_id, partner) = decode_partner(&rec, &lookups()).unwrap();
        assert_eq!(base_id, "22222222");
        assert_eq!(partner.identifier, "PESSOA FÍSICA");
        assert_eq!(partner.qualification, "Sócio-Administrador");
        assert_eq!(partner.country_name, "BRASIL");
        assert_eq!(partner.representative_qualification, "Administrador");
        assert_eq!(partner.age_range, "31 a 40 anos");
        assert_eq!(
            partner.entry_date,
            SourceDate::from_compact("20150701")
        );
    }

    #[test]
    fn simple_rows_decode_flags_and_dates() {
        let rec = record(&["12345678", "S", "20180101", "", "N", "0", "00000000"]);
        let (base_id, status) = decode_simple(&rec).unwrap();
        assert_eq!(base_id, "12345678");
        assert!(status.simple);
        assert!(!status.mei);
        assert!(status.simple_entry_date.is_some());
        assert!(status.simple_exit_date.is_none());
        assert!(status.mei_entry_date.is_none());
        assert!(status.mei_exit_date.is_none());
    }

    #[test]
    fn regime_rows_key_on_the_full_national_id() {
        let rec = record(&["2020", "33333333000144", "", "LUCRO REAL", "2"]);
        let (national_id, staged) = decode_regime(&rec, SourceKind::RealProfit).unwrap();
        assert_eq!(national_id, "33333333000144");
        assert_eq!(staged.regime, RegimeKind::RealProfit);
        assert_eq!(staged.entry, RegimeEntry { year: 2020, scholarships: 2 });

        // a stray header line fails the year parse and is skipped upstream
        let header = record(&["ANO", "CNPJ", "CNPJ DA SCP", "FORMA", "QUANTIDADE"]);
        assert!(decode_regime(&header, SourceKind::RealProfit).is_err());
    }

    #[test]
    fn venue_rows_decode_into_a_company_seed() {
        let rec = record(&[
            "12345678", "0001", "99", "1", "PADARIA CENTRAL", "2", "20100115", "0", "", "",
            "20091201", "6201501", "6204000,9999999", "RUA", "DAS FLORES", "42", "SALA 1",
            "CENTRO", "01310-100", "SP", "7107", "11", "33334444", "11", "55556666", "11",
            "77778888", "contato@acme.com.br", "", "0",
        ]);
        let company = decode_venue(&rec, &lookups()).unwrap();
        assert_eq!(company.cnpj, "12345678000199");
        assert_eq!(company.base_cnpj, "12345678");
        assert_eq!(company.order_cnpj, "0001");
        assert_eq!(company.check_cnpj, "99");
        assert_eq!(split_national_id(&company.cnpj).unwrap().0, company.base_cnpj);
        assert_eq!(company.head_or_branch, "MATRIZ");
        assert_eq!(company.status_name, "ATIVA");
        assert_eq!(company.primary_cnae_description, "Desenvolvimento de programas");
        assert_eq!(company.secondary_cnaes.len(), 2);
        assert_eq!(company.secondary_cnaes[0].description, "Consultoria em TI");
        assert_eq!(company.secondary_cnaes[1].description, "");
        assert_eq!(company.secondary_cnaes_csv(), "6204000,9999999");
        assert_eq!(company.municipality_name, "SÃO PAULO");
        assert_eq!(company.postal_code, "01310100");
        assert_eq!(company.phone_1, "1133334444");
        assert_eq!(company.phone_2, "1155556666");
        assert_eq!(company.fax, "1177778888");
        assert_eq!(company.email.as_deref(), Some("contato@acme.com.br"));
        assert!(company.tax_regimes.is_empty());
    }

    #[test]
    fn malformed_national_ids_are_rejected() {
        let rec = record(&["1234567", "0001", "99", "1", "X", "2"]);
        assert!(decode_venue(&rec, &lookups()).is_err());

        let rec = record(&["12A45678", "0001", "99"]);
        assert!(decode_venue(&rec, &lookups()).is_err());
    }

    #[test]
    fn capital_accepts_comma_decimals_and_integers() {
        assert_eq!(parse_capital("100000,00"), Decimal::from_str("100000.00").ok());
        assert_eq!(parse_capital("1500"), Decimal::from_str("1500").ok());
        assert_eq!(parse_capital(""), None);
        assert_eq!(parse_capital("abc"), None);
    }
}
