//! Selector Resolver: logical field key -> concrete value.
//!
//! Precedence, first non-empty wins:
//! 1. explicit value inside a structured raw-response blob
//! 2. exact normalized key match over the flattened source values
//! 3. substring match of a normalized candidate (key or synonym)
//! 4. field-specific pattern extraction from the raw text

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::types::{Provenance, ResolvedValue, SourceValues};

/// Source entries that carry a structured response blob rather than data.
const STRUCTURED_BLOB_KEYS: &[&str] = &["rawresponse", "structuredresponse", "rawjson"];

/// Substring matching on very short candidates ("ad", "tc") is noise.
const MIN_SUBSTRING_CANDIDATE: usize = 4;

static PLATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(0[1-9]|[1-7][0-9]|8[01])\s*([A-ZÇĞİÖŞÜ]{1,3})\s*([0-9]{2,4})\b")
        .expect("plate pattern")
});
static NATIONAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[1-9][0-9]{10}\b").expect("national id pattern"));
static TAX_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9]{10}\b").expect("tax number pattern"));
static DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([0-3][0-9])[./-]([01][0-9])[./-]((?:19|20)[0-9]{2})\b").expect("date pattern")
});
static BIRTH_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:doğum\s*tarihi|dogum\s*tarihi|birth\s*date|date\s*of\s*birth)\s*[:\-]?\s*([0-3][0-9])[./-]([01][0-9])[./-]((?:19|20)[0-9]{2})",
    )
    .expect("birth date pattern")
});
static FULL_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^\s*(?:ad[ıi]?\s*soyad[ıi]?|ad\s*/\s*soyad|full\s*name|name|sigortal[ıi])\s*[:\-]\s*(.+?)\s*$",
    )
    .expect("full name pattern")
});
static FIRST_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:ad[ıi]?|first\s*name|given\s*name)\s*[:\-]\s*(.+?)\s*$")
        .expect("first name pattern")
});
static LAST_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:soyad[ıi]?|last\s*name|surname)\s*[:\-]\s*(.+?)\s*$")
        .expect("last name pattern")
});
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email pattern")
});
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+?90[\s\-]?)?0?[\s\-]?\(?5[0-9]{2}\)?[\s\-]?[0-9]{3}[\s\-]?[0-9]{2}[\s\-]?[0-9]{2}")
        .expect("phone pattern")
});

/// Broad shape of a logical field, used for raw-text extraction and post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    Plate,
    NationalId,
    TaxNumber,
    Phone,
    BirthDate,
    Date,
    FullName,
    FirstName,
    LastName,
    Email,
    Other,
}

impl FieldShape {
    /// Derive the shape from a normalized key.
    pub fn of(normalized_key: &str) -> Self {
        let k = normalized_key;
        if k.contains("plate") || k.contains("plaka") {
            FieldShape::Plate
        } else if k.contains("nationalid")
            || k.contains("tckn")
            || k.contains("tckimlik")
            || k.contains("kimlikno")
            || k.contains("identityno")
        {
            FieldShape::NationalId
        } else if k.contains("taxnumber") || k.contains("vergi") || k == "vkn" {
            FieldShape::TaxNumber
        } else if k.contains("phone") || k.contains("telefon") || k.contains("gsm") || k == "mobile" {
            FieldShape::Phone
        } else if k.contains("birth") || k.contains("dogum") || k == "dob" {
            FieldShape::BirthDate
        } else if k.contains("date") || k.contains("tarih") {
            FieldShape::Date
        } else if k.contains("email") || k.contains("eposta") {
            FieldShape::Email
        } else if k.contains("fullname") || k.contains("adsoyad") {
            FieldShape::FullName
        } else if k.contains("firstname") || k == "ad" || k == "adi" || k == "isim" {
            FieldShape::FirstName
        } else if k.contains("lastname") || k.contains("surname") || k.contains("soyad") {
            FieldShape::LastName
        } else {
            FieldShape::Other
        }
    }

    fn is_identifier(&self) -> bool {
        matches!(
            self,
            FieldShape::NationalId | FieldShape::TaxNumber | FieldShape::Phone
        )
    }
}

/// Resolves logical keys against extracted source data.
#[derive(Debug, Clone)]
pub struct SelectorResolver {
    synonyms: HashMap<String, Vec<String>>,
}

impl Default for SelectorResolver {
    fn default() -> Self {
        let mut resolver = Self {
            synonyms: HashMap::new(),
        };
        let defaults: &[(&str, &[&str])] = &[
            ("plate_number", &["plaka", "plate", "plakano", "arac_plaka"]),
            (
                "national_id",
                &["tckn", "tc_kimlik_no", "tc_no", "kimlik_no", "identity_number"],
            ),
            ("tax_number", &["vkn", "vergi_no", "vergi_kimlik_no"]),
            ("birth_date", &["dogum_tarihi", "birthdate", "dob"]),
            ("first_name", &["ad", "adi", "isim", "firstname"]),
            ("last_name", &["soyad", "soyadi", "surname", "lastname"]),
            ("full_name", &["ad_soyad", "adi_soyadi", "fullname", "name"]),
            ("phone", &["telefon", "cep_telefonu", "gsm", "mobile"]),
            ("email", &["e_posta", "eposta", "mail"]),
            (
                "license_serial",
                &["ruhsat_seri", "belge_seri", "tescil_belge_seri", "ruhsat_seri_no"],
            ),
            ("license_number", &["ruhsat_no", "belge_no", "tescil_no"]),
            ("chassis_number", &["sasi_no", "sase_no", "vin"]),
            ("engine_number", &["motor_no"]),
            ("model_year", &["model_yili", "yil"]),
            ("brand", &["marka", "make"]),
        ];
        for (key, synonyms) in defaults {
            resolver = resolver.with_synonyms(key, synonyms.iter().copied());
        }
        resolver
    }
}

impl SelectorResolver {
    /// Resolver with no domain synonyms registered.
    pub fn empty() -> Self {
        Self {
            synonyms: HashMap::new(),
        }
    }

    pub fn with_synonyms<'a>(
        mut self,
        key: &str,
        synonyms: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let entry = self.synonyms.entry(normalize_key(key)).or_default();
        for synonym in synonyms {
            let normalized = normalize_key(synonym);
            if !normalized.is_empty() && !entry.contains(&normalized) {
                entry.push(normalized);
            }
        }
        self
    }

    /// Normalized candidates for a key: the key itself, then its synonyms.
    fn candidates(&self, key: &str) -> Vec<String> {
        let normalized = normalize_key(key);
        let mut out = vec![normalized.clone()];
        if let Some(extra) = self.synonyms.get(&normalized) {
            out.extend(extra.iter().filter(|s| **s != normalized).cloned());
        }
        out
    }

    pub fn resolve(&self, key: &str, source: &SourceValues) -> ResolvedValue {
        let candidates = self.candidates(key);
        let shape = FieldShape::of(&candidates[0]);

        let (blob, rest) = split_structured_blob(&source.values);

        let found = blob
            .as_ref()
            .and_then(|entries| exact_match(entries, &candidates))
            .map(|v| (v, Provenance::StructuredBlob))
            .or_else(|| exact_match(&rest, &candidates).map(|v| (v, Provenance::ExactKey)))
            .or_else(|| substring_match(&rest, &candidates).map(|v| (v, Provenance::SubstringKey)))
            .or_else(|| {
                source
                    .raw_text
                    .as_deref()
                    .and_then(|text| extract_from_text(shape, text))
                    .map(|v| (v, Provenance::RawTextPattern))
            });

        match found {
            Some((raw, provenance)) => {
                let value = post_process(shape, &raw);
                if value.is_empty() {
                    debug!(key, "value emptied by post-processing");
                    return ResolvedValue::unresolved(key);
                }
                debug!(key, provenance = ?provenance, "resolved field value");
                ResolvedValue {
                    key: key.to_string(),
                    value,
                    provenance,
                }
            }
            None => {
                debug!(key, "no source value for field");
                ResolvedValue::unresolved(key)
            }
        }
    }
}

/// Diacritic-fold, case-fold and drop everything that is not ASCII alphanumeric.
pub fn normalize_key(input: &str) -> String {
    input
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_diacritic)
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

fn fold_diacritic(c: char) -> char {
    match c {
        'ç' | 'ć' | 'č' => 'c',
        'ğ' => 'g',
        'ı' | 'î' | 'í' | 'ì' | 'ï' => 'i',
        'ö' | 'ô' | 'ó' | 'ò' | 'õ' => 'o',
        'ş' | 'ś' | 'š' => 's',
        'ü' | 'û' | 'ú' | 'ù' => 'u',
        'â' | 'á' | 'à' | 'ä' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'ñ' => 'n',
        'ž' | 'ź' | 'ż' => 'z',
        other => other,
    }
}

/// Walk nested objects/arrays to scalar leaves. Each leaf is keyed by the
/// normalized form of its innermost object key.
pub fn flatten(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(value, "", &mut out);
    out
}

fn flatten_into(value: &Value, key: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(v, &normalize_key(k), out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_into(item, key, out);
            }
        }
        Value::Null => {}
        scalar => {
            if key.is_empty() {
                return;
            }
            let text = match scalar {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            if !text.is_empty() {
                out.push((key.to_string(), text));
            }
        }
    }
}

/// Separate the structured blob (if any) from the ordinary source entries.
fn split_structured_blob(values: &Value) -> (Option<Vec<(String, String)>>, Vec<(String, String)>) {
    let Value::Object(map) = values else {
        return (None, flatten(values));
    };

    let mut blob = None;
    let mut rest = serde_json::Map::new();
    for (k, v) in map {
        if STRUCTURED_BLOB_KEYS.contains(&normalize_key(k).as_str()) {
            if let Some(parsed) = parse_blob(v) {
                blob = Some(flatten(&parsed));
            }
        } else {
            rest.insert(k.clone(), v.clone());
        }
    }
    (blob, flatten(&Value::Object(rest)))
}

fn parse_blob(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) => Some(value.clone()),
        Value::String(text) => {
            let cleaned = text
                .trim()
                .trim_start_matches("```json")
                .trim_start_matches("```")
                .trim_end_matches("```")
                .trim();
            serde_json::from_str::<Value>(cleaned)
                .ok()
                .filter(Value::is_object)
        }
        _ => None,
    }
}

fn exact_match(entries: &[(String, String)], candidates: &[String]) -> Option<String> {
    candidates.iter().find_map(|candidate| {
        entries
            .iter()
            .find(|(k, v)| k == candidate && !v.trim().is_empty())
            .map(|(_, v)| v.clone())
    })
}

fn substring_match(entries: &[(String, String)], candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .filter(|c| c.len() >= MIN_SUBSTRING_CANDIDATE)
        .find_map(|candidate| {
            entries
                .iter()
                .find(|(k, v)| k.contains(candidate.as_str()) && !v.trim().is_empty())
                .map(|(_, v)| v.clone())
        })
}

/// Field-specific heuristics over the raw document text.
pub fn extract_from_text(shape: FieldShape, text: &str) -> Option<String> {
    match shape {
        FieldShape::Plate => {
            let upper = text.to_uppercase();
            PLATE_RE
                .captures(&upper)
                .map(|c| format!("{} {} {}", &c[1], &c[2], &c[3]))
        }
        FieldShape::NationalId => NATIONAL_ID_RE.find(text).map(|m| m.as_str().to_string()),
        FieldShape::TaxNumber => TAX_NUMBER_RE.find(text).map(|m| m.as_str().to_string()),
        FieldShape::Phone => PHONE_RE.find(text).map(|m| m.as_str().to_string()),
        FieldShape::BirthDate => BIRTH_DATE_RE
            .captures(text)
            .or_else(|| DATE_RE.captures(text))
            .map(|c| iso_from_captures(&c)),
        FieldShape::Date => DATE_RE.captures(text).map(|c| iso_from_captures(&c)),
        FieldShape::FullName => FULL_NAME_RE.captures(text).map(|c| c[1].to_string()),
        FieldShape::FirstName => FIRST_NAME_RE.captures(text).map(|c| c[1].to_string()),
        FieldShape::LastName => LAST_NAME_RE.captures(text).map(|c| c[1].to_string()),
        FieldShape::Email => EMAIL_RE.find(text).map(|m| m.as_str().to_string()),
        FieldShape::Other => None,
    }
}

fn iso_from_captures(c: &regex::Captures<'_>) -> String {
    let len = c.len();
    format!("{}-{}-{}", &c[len - 1], &c[len - 2], &c[len - 3])
}

/// Plates: whitespace collapsed, upper-cased. Identifiers: digits only.
pub fn post_process(shape: FieldShape, raw: &str) -> String {
    if shape == FieldShape::Plate {
        return raw
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase();
    }
    if shape.is_identifier() {
        return raw.chars().filter(char::is_ascii_digit).collect();
    }
    raw.trim().to_string()
}
