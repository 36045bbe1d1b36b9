//! Output data model of the pipeline.
//!
//! The model is a forest rooted at [`Company`]: partner lists are inline
//! children, tax regimes are inline maps. Everything serializes with `serde`
//! in declaration order, which keeps the staged KV encoding deterministic.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A calendar date as the registry publishes it (`YYYYMMDD`).
///
/// Distinct named type with an explicit conversion to [`NaiveDate`]; the
/// compact form `0`, `00000000` or an empty field means "no date".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SourceDate(pub NaiveDate);

impl SourceDate {
    /// Parse the registry's compact date form. Returns `None` for the
    /// registry's null markers and for anything that is not a valid date.
    pub fn from_compact(raw: &str) -> Option<SourceDate> {
        let raw = raw.trim();
        if raw.is_empty() || raw.chars().all(|c| c == '0') {
            return None;
        }
        NaiveDate::parse_from_str(raw, "%Y%m%d").ok().map(SourceDate)
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }
}

impl From<SourceDate> for NaiveDate {
    fn from(d: SourceDate) -> NaiveDate {
        d.0
    }
}

/// A secondary economic-activity code with its looked-up description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cnae {
    pub code: i64,
    pub description: String,
}

/// A named participant in a legal entity.
///
/// Partner rows carry no primary key in the source; output de-duplication is
/// by `(company national ID, partner name)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    pub identifier_code: Option<i32>,
    pub identifier: String,
    pub name: String,
    pub tax_id: String,
    pub qualification_code: Option<i32>,
    pub qualification: String,
    pub entry_date: Option<SourceDate>,
    pub country_code: Option<i32>,
    pub country_name: String,
    pub representative_tax_id: String,
    pub representative_name: String,
    pub representative_qualification_code: Option<i32>,
    pub representative_qualification: String,
    pub age_range_code: Option<i32>,
    pub age_range: String,
}

/// Simple-regime and MEI option flags with their entry/exit dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleTaxStatus {
    pub simple: bool,
    pub simple_entry_date: Option<SourceDate>,
    pub simple_exit_date: Option<SourceDate>,
    pub mei: bool,
    pub mei_entry_date: Option<SourceDate>,
    pub mei_exit_date: Option<SourceDate>,
}

/// One annual entry of a tax-regime series.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RegimeEntry {
    pub year: i32,
    pub scholarships: i64,
}

/// The four annual tax-regime series of a venue.
///
/// Entries accumulate across source rows sharing the same 14-digit ID; two
/// rows never overwrite each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRegimes {
    pub real_profit: BTreeSet<RegimeEntry>,
    pub presumed_profit: BTreeSet<RegimeEntry>,
    pub arbitrated_profit: BTreeSet<RegimeEntry>,
    pub immune_exempt: BTreeSet<RegimeEntry>,
}

impl TaxRegimes {
    pub fn is_empty(&self) -> bool {
        self.real_profit.is_empty()
            && self.presumed_profit.is_empty()
            && self.arbitrated_profit.is_empty()
            && self.immune_exempt.is_empty()
    }
}

/// The fully enriched output record for one venue.
///
/// Uniquely identified by its 14-digit national ID; the base ID is always the
/// first 8 digits, the order digits 9-12, the check digits 13-14.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub cnpj: String,
    pub base_cnpj: String,
    pub order_cnpj: String,
    pub check_cnpj: String,

    // from the base stream
    pub registered_name: String,
    pub legal_nature_code: Option<i32>,
    pub legal_nature: String,
    pub responsible_qualification_code: Option<i32>,
    pub responsible_qualification: String,
    pub capital: Option<Decimal>,
    pub size_code: Option<i32>,
    pub size: String,
    pub federated_entity_responsible: String,

    // from the venue stream
    pub head_or_branch_code: Option<i32>,
    pub head_or_branch: String,
    pub trade_name: String,
    pub status_code: Option<i32>,
    pub status_name: String,
    pub status_date: Option<SourceDate>,
    pub status_reason_code: Option<i32>,
    pub status_reason: String,
    pub city_abroad_name: String,
    pub country_code: Option<i32>,
    pub country_name: String,
    pub activity_start_date: Option<SourceDate>,
    pub primary_cnae: Option<i64>,
    pub primary_cnae_description: String,
    pub secondary_cnaes: Vec<Cnae>,
    pub special_situation: String,
    pub special_situation_date: Option<SourceDate>,

    // address
    pub street_type: String,
    pub street: String,
    pub number: String,
    pub complement: String,
    pub neighborhood: String,
    pub postal_code: String,
    pub state: String,
    pub municipality_code: Option<i32>,
    pub municipality_name: String,

    // contacts
    pub phone_1: String,
    pub phone_2: String,
    pub fax: String,
    pub email: Option<String>,

    // enrichment
    pub partners: Vec<Partner>,
    pub simple_taxes: Option<SimpleTaxStatus>,
    pub tax_regimes: TaxRegimes,
}

impl Company {
    /// Comma-join of the secondary CNAE codes in decoding order.
    pub fn secondary_cnaes_csv(&self) -> String {
        self.secondary_cnaes
            .iter()
            .map(|c| c.code.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Comma-join of the phone numbers present (fax excluded).
    pub fn phones_csv(&self) -> String {
        [&self.phone_1, &self.phone_2]
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Zero every personally identifying field before emission: contact
    /// details and all partner tax IDs.
    pub fn scrub_private_fields(&mut self) {
        self.email = None;
        self.phone_1.clear();
        self.phone_2.clear();
        self.fax.clear();
        for partner in &mut self.partners {
            partner.tax_id.clear();
            partner.representative_tax_id.clear();
        }
    }
}

/// Drop every non-digit character from `raw`.
pub fn strip_non_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Split a 14-digit national ID into `(base, order, check)`.
///
/// Returns `None` unless the input, after non-digit stripping, is exactly 14
/// digits.
pub fn split_national_id(raw: &str) -> Option<(String, String, String)> {
    let digits = strip_non_digits(raw);
    if digits.len() != 14 {
        return None;
    }
    Some((
        digits[0..8].to_string(),
        digits[8..12].to_string(),
        digits[12..14].to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_dates_parse_and_null_markers_hold() {
        assert_eq!(
            SourceDate::from_compact("20100115"),
            NaiveDate::from_ymd_opt(2010, 1, 15).map(SourceDate)
        );
        assert_eq!(SourceDate::from_compact(""), None);
        assert_eq!(SourceDate::from_compact("0"), None);
        assert_eq!(SourceDate::from_compact("00000000"), None);
        assert_eq!(SourceDate::from_compact("20231301"), None);
    }

    #[test]
    fn national_id_split_requires_fourteen_digits() {
        assert_eq!(
            split_national_id("12345678000199"),
            Some(("12345678".into(), "0001".into(), "99".into()))
        );
        assert_eq!(
            split_national_id("12.345.678/0001-99"),
            Some(("12345678".into(), "0001".into(), "99".into()))
        );
        assert_eq!(split_national_id("1234567800019"), None);
        assert_eq!(split_national_id("123456780001999"), None);
    }

    #[test]
    fn privacy_scrub_zeroes_contacts_and_partner_ids() {
        let mut company = Company {
            email: Some("foo@bar.com".into()),
            phone_1: "1133334444".into(),
            phone_2: "1155556666".into(),
            fax: "1177778888".into(),
            partners: vec![Partner {
                name: "ALICE".into(),
                tax_id: "***123456**".into(),
                representative_tax_id: "***654321**".into(),
                ..Partner::default()
            }],
            ..Company::default()
        };
        company.scrub_private_fields();
        assert_eq!(company.email, None);
        assert!(company.phone_1.is_empty());
        assert!(company.phone_2.is_empty());
        assert!(company.fax.is_empty());
        assert!(company.partners[0].tax_id.is_empty());
        assert!(company.partners[0].representative_tax_id.is_empty());
        assert_eq!(company.partners[0].name, "ALICE");
    }

    #[test]
    fn regime_entries_accumulate_as_a_set() {
        let mut regimes = TaxRegimes::default();
        regimes.real_profit.insert(RegimeEntry { year: 2020, scholarships: 1 });
        regimes.real_profit.insert(RegimeEntry { year: 2021, scholarships: 1 });
        regimes.real_profit.insert(RegimeEntry { year: 2020, scholarships: 1 });
        assert_eq!(regimes.real_profit.len(), 2);
        assert!(!regimes.is_empty());
        assert!(regimes.presumed_profit.is_empty());
    }

    #[test]
    fn staged_encoding_round_trips_every_field_type() {
        let company = Company {
            cnpj: "12345678000199".into(),
            base_cnpj: "12345678".into(),
            order_cnpj: "0001".into(),
            check_cnpj: "99".into(),
            registered_name: "ACME LTDA".into(),
            capital: Some("100000.00".parse().unwrap()),
            status_date: SourceDate::from_compact("20100115"),
            activity_start_date: None,
            primary_cnae: Some(6201501),
            email: None,
            partners: vec![Partner {
                name: "ALICE".into(),
                entry_date: SourceDate::from_compact("20150701"),
                ..Partner::default()
            }],
            simple_taxes: Some(SimpleTaxStatus {
                simple: true,
                simple_entry_date: SourceDate::from_compact("20180101"),
                ..SimpleTaxStatus::default()
            }),
            tax_regimes: TaxRegimes {
                real_profit: [RegimeEntry { year: 2020, scholarships: 2 }].into(),
                ..TaxRegimes::default()
            },
            ..Company::default()
        };

        let encoded = serde_json::to_vec(&company).unwrap();
        let decoded: Company = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, company);

        // dates stay dates, numbers stay numbers, nulls stay nulls
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["status_date"], "2010-01-15");
        assert_eq!(value["activity_start_date"], serde_json::Value::Null);
        assert_eq!(value["primary_cnae"], 6201501);
        assert_eq!(value["email"], serde_json::Value::Null);
        assert_eq!(value["tax_regimes"]["real_profit"][0]["year"], 2020);
    }

    #[test]
    fn csv_projections_follow_decoding_order() {
        let company = Company {
            secondary_cnaes: vec![
                Cnae { code: 6201501, description: String::new() },
                Cnae { code: 6204000, description: String::new() },
            ],
            phone_1: "1133334444".into(),
            ..Company::default()
        };
        assert_eq!(company.secondary_cnaes_csv(), "6201501,6204000");
        assert_eq!(company.phones_csv(), "1133334444");
    }
}
