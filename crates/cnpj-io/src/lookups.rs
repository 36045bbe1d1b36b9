//! Code-to-description lookup tables.
//!
//! Six small mappings ship with every registry drop as their own CSV files;
//! they load eagerly at startup and are immutable afterwards, so they can be
//! shared behind an `Arc` with no synchronization. A missing code always
//! resolves to the empty string.
//!
//! The handful of mappings the registry documents but never ships as files
//! (registration status, company size, head/branch, partner identification,
//! age range) live here as fixed functions.

use anyhow::{Context, Result};
use encoding_rs::WINDOWS_1252;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// All file-backed lookup tables of one registry drop.
#[derive(Debug, Default)]
pub struct Lookups {
    cnaes: HashMap<i64, String>,
    municipalities: HashMap<i32, String>,
    legal_natures: HashMap<i32, String>,
    qualifications: HashMap<i32, String>,
    countries: HashMap<i32, String>,
    reasons: HashMap<i32, String>,
}

/// Filename tokens (upper-cased comparison) for each lookup file.
const CNAE_TOKENS: [&str; 2] = ["CNAE", "CNAES"];
const MUNICIPALITY_TOKENS: [&str; 2] = ["MUNIC", "MUNICIPIOS"];
const LEGAL_NATURE_TOKENS: [&str; 2] = ["NATJU", "NATUREZAS"];
const QUALIFICATION_TOKENS: [&str; 2] = ["QUALS", "QUALIFICACOES"];
const COUNTRY_TOKENS: [&str; 2] = ["PAIS", "PAISES"];
const REASON_TOKENS: [&str; 2] = ["MOTI", "MOTIVOS"];

impl Lookups {
    /// Load every lookup file under `dir`. Fails if any of the six files is
    /// missing; the downloader guarantees the layout.
    pub fn load(dir: &Path) -> Result<Lookups> {
        let lookups = Lookups {
            cnaes: load_table(dir, &CNAE_TOKENS)?,
            municipalities: load_table(dir, &MUNICIPALITY_TOKENS)?,
            legal_natures: load_table(dir, &LEGAL_NATURE_TOKENS)?,
            qualifications: load_table(dir, &QUALIFICATION_TOKENS)?,
            countries: load_table(dir, &COUNTRY_TOKENS)?,
            reasons: load_table(dir, &REASON_TOKENS)?,
        };
        info!(
            cnaes = lookups.cnaes.len(),
            municipalities = lookups.municipalities.len(),
            legal_natures = lookups.legal_natures.len(),
            qualifications = lookups.qualifications.len(),
            countries = lookups.countries.len(),
            reasons = lookups.reasons.len(),
            "lookup tables loaded"
        );
        Ok(lookups)
    }

    pub fn cnae(&self, code: Option<i64>) -> String {
        code.and_then(|c| self.cnaes.get(&c).cloned()).unwrap_or_default()
    }

    pub fn municipality(&self, code: Option<i32>) -> String {
        code.and_then(|c| self.municipalities.get(&c).cloned()).unwrap_or_default()
    }

    pub fn legal_nature(&self, code: Option<i32>) -> String {
        code.and_then(|c| self.legal_natures.get(&c).cloned()).unwrap_or_default()
    }

    pub fn qualification(&self, code: Option<i32>) -> String {
        code.and_then(|c| self.qualifications.get(&c).cloned()).unwrap_or_default()
    }

    pub fn country(&self, code: Option<i32>) -> String {
        code.and_then(|c| self.countries.get(&c).cloned()).unwrap_or_default()
    }

    pub fn reason(&self, code: Option<i32>) -> String {
        code.and_then(|c| self.reasons.get(&c).cloned()).unwrap_or_default()
    }

    /// Test-only builder used instead of on-disk lookup files.
    pub fn with_entries(
        cnaes: &[(i64, &str)],
        municipalities: &[(i32, &str)],
        legal_natures: &[(i32, &str)],
        qualifications: &[(i32, &str)],
        countries: &[(i32, &str)],
        reasons: &[(i32, &str)],
    ) -> Lookups {
        fn collect<K: std::hash::Hash + Eq + Copy>(pairs: &[(K, &str)]) -> HashMap<K, String> {
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
        }
        Lookups {
            cnaes: collect(cnaes),
            municipalities: collect(municipalities),
            legal_natures: collect(legal_natures),
            qualifications: collect(qualifications),
            countries: collect(countries),
            reasons: collect(reasons),
        }
    }
}

fn load_table<K>(dir: &Path, tokens: &[&str]) -> Result<HashMap<K, String>>
where
    K: std::str::FromStr + std::hash::Hash + Eq,
{
    let path = find_file(dir, tokens)?;
    let file = std::fs::File::open(&path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut table = HashMap::new();
    let mut record = csv::ByteRecord::new();
    while reader.read_byte_record(&mut record)? {
        if record.len() < 2 {
            continue;
        }
        let (code, _, _) = WINDOWS_1252.decode(&record[0]);
        let (description, _, _) = WINDOWS_1252.decode(&record[1]);
        if let Ok(code) = code.trim().parse::<K>() {
            table.insert(code, description.trim().to_string());
        }
    }
    Ok(table)
}

fn find_file(dir: &Path, tokens: &[&str]) -> Result<std::path::PathBuf> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("read data directory {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_uppercase();
        if entry.file_type()?.is_file() && tokens.iter().any(|t| name.contains(t)) {
            return Ok(entry.path());
        }
    }
    anyhow::bail!("no lookup file matching {:?} under {}", tokens, dir.display())
}

/// Registration status of a venue. Fixed by the registry documentation.
pub fn registration_status(code: Option<i32>) -> String {
    match code {
        Some(1) => "NULA",
        Some(2) => "ATIVA",
        Some(3) => "SUSPENSA",
        Some(4) => "INAPTA",
        Some(8) => "BAIXADA",
        _ => "",
    }
    .to_string()
}

/// Company size classification.
pub fn company_size(code: Option<i32>) -> String {
    match code {
        Some(0) => "NÃO INFORMADO",
        Some(1) => "MICRO EMPRESA",
        Some(3) => "EMPRESA DE PEQUENO PORTE",
        Some(5) => "DEMAIS",
        _ => "",
    }
    .to_string()
}

/// Head office or branch flag.
pub fn head_or_branch(code: Option<i32>) -> String {
    match code {
        Some(1) => "MATRIZ",
        Some(2) => "FILIAL",
        _ => "",
    }
    .to_string()
}

/// Partner identification type.
pub fn partner_identifier(code: Option<i32>) -> String {
    match code {
        Some(1) => "PESSOA JURÍDICA",
        Some(2) => "PESSOA FÍSICA",
        Some(3) => "ESTRANGEIRO",
        _ => "",
    }
    .to_string()
}

/// Partner age range.
pub fn age_range(code: Option<i32>) -> String {
    match code {
        Some(1) => "0 a 12 anos",
        Some(2) => "13 a 20 anos",
        Some(3) => "21 a 30 anos",
        Some(4) => "31 a 40 anos",
        Some(5) => "41 a 50 anos",
        Some(6) => "51 a 60 anos",
        Some(7) => "61 a 70 anos",
        Some(8) => "71 a 80 anos",
        Some(9) => "acima de 80 anos",
        Some(0) => "não se aplica",
        _ => "",
    }
    .to_string()
}
