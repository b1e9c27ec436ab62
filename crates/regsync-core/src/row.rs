//! Column detection and typed row extraction for registry pages.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::keys::{canonicalize, establishment_key};
use crate::{AttrUpdate, IdentifierMetadata};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowParseError {
    #[error("row is not a JSON object")]
    NotAnObject,
    #[error("row has no registry identifier")]
    MissingRegistryId,
    #[error("registry identifier {0:?} has no digits")]
    UnusableRegistryId(String),
}

/// Logical columns resolved once from the resource header list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedColumns {
    pub registry_id: Option<String>,
    pub secondary_id: Option<String>,
    pub establishment_id: Option<String>,
    pub company_name: Option<String>,
    pub acronym: Option<String>,
    pub establishment_name: Option<String>,
    pub zip: Option<String>,
    pub city: Option<String>,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub building: Option<String>,
    pub geo_address: Option<String>,
    pub kilometer_point: Option<String>,
    pub district: Option<String>,
    pub classification_establishment: Option<String>,
    pub classification_company: Option<String>,
    pub legal_form: Option<String>,
    pub headcount_class: Option<String>,
    pub company_closed: Option<String>,
    pub establishment_closed: Option<String>,
    pub incorporation_date: Option<String>,
}

impl DetectedColumns {
    /// Each logical column takes the first header containing one of its candidates,
    /// candidates tried in priority order.
    pub fn detect(headers: &[String]) -> Self {
        let headers: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        let col = |candidates: &[&str]| pick(&headers, candidates, &[]);

        let establishment_id = col(&["numtah eta", "numtaheta", "num_tah_eta", "numtah_etab", "tahiti_etab"]);
        let registry_id = pick(&headers, &["numtah", "tahiti"], &[establishment_id.as_deref()]);

        Self {
            registry_id,
            secondary_id: col(&["numeta"]),
            establishment_id,
            company_name: col(&["nom_ent"]),
            acronym: col(&["sigle_ent", "sigle"]),
            establishment_name: col(&["nom_etab"]),
            zip: col(&["code_postal_ent", "cp", "code postal"]),
            city: col(&["com_etab_libelle", "commune_etab", "ville_etab"]),
            street_number: col(&["num_adr", "numero", "numéro"]),
            street_name: col(&["rue", "adresse", "adresse 1", "adr1"]),
            building: col(&["immeuble"]),
            geo_address: col(&["adrgeo"]),
            kilometer_point: col(&["pk"]),
            district: col(&["quartier"]),
            classification_establishment: col(&["naf2008_etab", "naf_etab", "naf etab"]),
            classification_company: col(&["naf2008_ent", "naf_ent", "naf ent"]),
            legal_form: col(&["code_fjur", "forme juridique"]),
            headcount_class: col(&["classe_effectifs", "classe d'effectifs", "classe effectif", "effectif"]),
            company_closed: col(&["rad_ent", "radiation_ent"]),
            establishment_closed: col(&["rad_etab", "radiation_etab"]),
            incorporation_date: col(&["insc_ent"]),
        }
    }

    pub fn has_registry_id(&self) -> bool {
        self.registry_id.is_some()
    }

    /// Column a server-side classification filter applies to.
    pub fn classification_column(&self) -> Option<&str> {
        self.classification_establishment
            .as_deref()
            .or(self.classification_company.as_deref())
    }
}

fn pick(headers: &[String], candidates: &[&str], claimed: &[Option<&str>]) -> Option<String> {
    candidates.iter().find_map(|candidate| {
        headers
            .iter()
            .find(|h| h.contains(candidate) && !claimed.contains(&Some(h.as_str())))
            .cloned()
    })
}

/// Page-scoped key/value view of one data row, keyed by lower-cased column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    values: BTreeMap<String, String>,
}

impl RawRow {
    pub fn from_json(value: &JsonValue) -> Result<Self, RowParseError> {
        let object = value.as_object().ok_or(RowParseError::NotAnObject)?;
        let values = object
            .iter()
            .filter_map(|(key, value)| {
                let text = match value {
                    JsonValue::String(s) => s.clone(),
                    JsonValue::Number(n) => n.to_string(),
                    JsonValue::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((key.trim().to_lowercase(), text))
            })
            .collect();
        Ok(Self { values })
    }

    pub fn from_pairs<K: AsRef<str>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.as_ref().trim().to_lowercase(), v.into()))
                .collect(),
        }
    }

    /// Trimmed, non-empty value of a detected column. Absent for undetected columns.
    pub fn get(&self, column: &Option<String>) -> Option<&str> {
        let column = column.as_deref()?;
        self.values
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn text(&self, column: &Option<String>) -> String {
        self.get(column).unwrap_or_default().to_string()
    }
}

/// Typed, canonicalized view of one registry row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRow {
    pub parent_key: String,
    pub secondary_key: String,
    pub establishment_key: Option<String>,
    pub company_name: String,
    pub establishment_name: Option<String>,
    pub street: String,
    pub street2: String,
    pub zip: String,
    pub city: String,
    pub classification: String,
    pub legal_form: String,
    pub headcount_class: String,
    pub incorporation_date: Option<NaiveDate>,
    pub active: bool,
}

impl RegistryRow {
    pub fn extract(raw: &RawRow, columns: &DetectedColumns) -> Result<Self, RowParseError> {
        let raw_parent = raw
            .get(&columns.registry_id)
            .ok_or(RowParseError::MissingRegistryId)?;
        let parent_key = canonicalize(raw_parent);
        if parent_key.is_empty() {
            return Err(RowParseError::UnusableRegistryId(raw_parent.to_string()));
        }

        let secondary_raw = raw.get(&columns.secondary_id).unwrap_or_default();
        let establishment_key =
            establishment_key(&parent_key, secondary_raw, raw.get(&columns.establishment_id));

        let closed = if establishment_key.is_some() {
            raw.get(&columns.establishment_closed).is_some()
        } else {
            raw.get(&columns.company_closed).is_some()
        };

        let name = raw.text(&columns.company_name);
        let acronym = raw.text(&columns.acronym);
        let company_name = match (name.is_empty(), acronym.is_empty()) {
            (false, false) => format!("{name} ({acronym})"),
            (false, true) => name,
            _ => format!("Company {parent_key}"),
        };

        let street = join_non_empty(
            &[raw.text(&columns.street_number), raw.text(&columns.street_name)],
            " ",
        );
        let street2 = join_non_empty(
            &[
                raw.text(&columns.building),
                raw.text(&columns.geo_address),
                raw.text(&columns.kilometer_point),
                raw.text(&columns.district),
            ],
            " - ",
        );

        Ok(Self {
            secondary_key: canonicalize(secondary_raw),
            establishment_key,
            company_name,
            establishment_name: raw.get(&columns.establishment_name).map(str::to_string),
            street,
            street2,
            zip: raw.get(&columns.zip).and_then(extract_zip).unwrap_or_default(),
            city: raw.text(&columns.city),
            classification: raw
                .get(&columns.classification_establishment)
                .or(raw.get(&columns.classification_company))
                .unwrap_or_default()
                .to_string(),
            legal_form: raw.text(&columns.legal_form),
            headcount_class: raw.text(&columns.headcount_class),
            incorporation_date: raw.get(&columns.incorporation_date).and_then(parse_date),
            active: !closed,
            parent_key,
        })
    }

    /// Desired activity: re-activate on open rows, deactivate closed rows only when the
    /// import is restricted to active entities.
    pub fn desired_active(&self, import_only_active: bool) -> Option<bool> {
        if self.active {
            Some(true)
        } else if import_only_active {
            Some(false)
        } else {
            None
        }
    }

    pub fn company_update(&self, import_only_active: bool) -> AttrUpdate {
        AttrUpdate {
            name: self.company_name.clone(),
            incorporation_date: self.incorporation_date,
            ..self.shared_update(import_only_active)
        }
    }

    pub fn establishment_update(&self, import_only_active: bool) -> AttrUpdate {
        let name = match &self.establishment_name {
            Some(name) => name.clone(),
            None => {
                let label = if self.secondary_key.is_empty() {
                    self.establishment_key.as_deref().unwrap_or(&self.parent_key)
                } else {
                    &self.secondary_key
                };
                format!("Establishment {label} - {}", self.company_name)
            }
        };
        AttrUpdate {
            name,
            ..self.shared_update(import_only_active)
        }
    }

    /// Collapses this folded establishment row and the parent-only row `base` into one
    /// description of the parent. Non-empty values of `self` win field by field; the result
    /// is open only while both rows are.
    pub fn merged_over(&self, base: &RegistryRow) -> RegistryRow {
        let pick = |own: &String, other: &String| {
            if own.is_empty() {
                other.clone()
            } else {
                own.clone()
            }
        };
        let company_name = if self.company_name == format!("Company {}", self.parent_key) {
            base.company_name.clone()
        } else {
            self.company_name.clone()
        };
        RegistryRow {
            parent_key: self.parent_key.clone(),
            secondary_key: pick(&self.secondary_key, &base.secondary_key),
            establishment_key: self.establishment_key.clone().or_else(|| base.establishment_key.clone()),
            company_name,
            establishment_name: self.establishment_name.clone().or_else(|| base.establishment_name.clone()),
            street: pick(&self.street, &base.street),
            street2: pick(&self.street2, &base.street2),
            zip: pick(&self.zip, &base.zip),
            city: pick(&self.city, &base.city),
            classification: pick(&self.classification, &base.classification),
            legal_form: pick(&self.legal_form, &base.legal_form),
            headcount_class: pick(&self.headcount_class, &base.headcount_class),
            incorporation_date: self.incorporation_date.or(base.incorporation_date),
            active: self.active && base.active,
        }
    }

    pub fn identifier_metadata(&self) -> IdentifierMetadata {
        IdentifierMetadata {
            issued_on: self.incorporation_date,
            valid_from: self.incorporation_date,
        }
    }

    fn shared_update(&self, import_only_active: bool) -> AttrUpdate {
        AttrUpdate {
            name: String::new(),
            street: self.street.clone(),
            street2: self.street2.clone(),
            zip: self.zip.clone(),
            city: self.city.clone(),
            classification: self.classification.clone(),
            legal_form: self.legal_form.clone(),
            headcount_class: self.headcount_class.clone(),
            incorporation_date: None,
            country_code: String::new(),
            company_type_id: None,
            active: self.desired_active(import_only_active),
        }
    }
}

fn join_non_empty(parts: &[String], sep: &str) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(sep)
}

/// First standalone five-digit group.
pub fn extract_zip(value: &str) -> Option<String> {
    let chars: Vec<char> = value.chars().collect();
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut start = 0;
    while start < chars.len() {
        if !chars[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let end = chars[start..]
            .iter()
            .position(|c| !c.is_ascii_digit())
            .map_or(chars.len(), |offset| start + offset);
        let bounded_left = start == 0 || !is_word(chars[start - 1]);
        let bounded_right = end == chars.len() || !is_word(chars[end]);
        if end - start == 5 && bounded_left && bounded_right {
            return Some(chars[start..end].iter().collect());
        }
        start = end;
    }
    None
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let head: String = value.trim().chars().take(10).collect();
    ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&head, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers() -> Vec<String> {
        [
            "__id", "NUMTAH", "NUMETA", "NUMTAH_ETAB", "NOM_ENT", "SIGLE_ENT", "NOM_ETAB",
            "CODE_POSTAL_ENT", "COM_ETAB_LIBELLE", "NUM_ADR", "RUE", "IMMEUBLE", "QUARTIER",
            "NAF2008_ETAB", "NAF2008_ENT", "CODE_FJUR", "CLASSE_EFFECTIFS", "RAD_ENT", "RAD_ETAB",
            "INSC_ENT",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn detects_registry_columns_without_shadowing() {
        let cols = DetectedColumns::detect(&headers());
        assert_eq!(cols.registry_id.as_deref(), Some("numtah"));
        assert_eq!(cols.establishment_id.as_deref(), Some("numtah_etab"));
        assert_eq!(cols.secondary_id.as_deref(), Some("numeta"));
        assert_eq!(cols.classification_column(), Some("naf2008_etab"));
        assert_eq!(cols.geo_address, None);
    }

    #[test]
    fn registry_id_skips_claimed_establishment_header() {
        let headers = vec!["numtah_etab".to_string(), "numtah".to_string()];
        let cols = DetectedColumns::detect(&headers);
        assert_eq!(cols.registry_id.as_deref(), Some("numtah"));
    }

    #[test]
    fn raw_row_missing_column_is_absent() {
        let row = RawRow::from_json(&json!({"NUMTAH": 55.0, "NOM_ENT": "  "})).unwrap();
        assert_eq!(row.get(&Some("numtah".into())), Some("55.0"));
        assert_eq!(row.get(&Some("nom_ent".into())), None);
        assert_eq!(row.get(&Some("absent".into())), None);
        assert_eq!(row.get(&None), None);
    }

    #[test]
    fn non_object_row_is_parse_error() {
        assert_eq!(RawRow::from_json(&json!([1, 2])), Err(RowParseError::NotAnObject));
    }

    #[test]
    fn extracts_typed_row() {
        let cols = DetectedColumns::detect(&headers());
        let raw = RawRow::from_json(&json!({
            "NUMTAH": "123456.0",
            "NUMETA": "2",
            "NOM_ENT": "Fare Ute",
            "SIGLE_ENT": "FU",
            "CODE_POSTAL_ENT": "BP 123 98714 Papeete",
            "COM_ETAB_LIBELLE": "Papeete",
            "NUM_ADR": "12",
            "RUE": "rue des Remparts",
            "IMMEUBLE": "Imm. Vaima",
            "QUARTIER": "Centre",
            "NAF2008_ETAB": "5610A",
            "INSC_ENT": "04/05/2001 00:00",
        }))
        .unwrap();
        let row = RegistryRow::extract(&raw, &cols).unwrap();
        assert_eq!(row.parent_key, "123456");
        assert_eq!(row.establishment_key.as_deref(), Some("123456-2"));
        assert_eq!(row.company_name, "Fare Ute (FU)");
        assert_eq!(row.street, "12 rue des Remparts");
        assert_eq!(row.street2, "Imm. Vaima - Centre");
        assert_eq!(row.zip, "98714");
        assert_eq!(row.incorporation_date, NaiveDate::from_ymd_opt(2001, 5, 4));
        assert!(row.active);
        assert_eq!(row.establishment_update(true).name, "Establishment 2 - Fare Ute (FU)");
        assert_eq!(row.establishment_update(true).incorporation_date, None);
    }

    #[test]
    fn closure_column_depends_on_row_kind() {
        let cols = DetectedColumns::detect(&headers());
        let company_row = RawRow::from_pairs([("numtah", "77"), ("rad_etab", "01/01/2020")]);
        let row = RegistryRow::extract(&company_row, &cols).unwrap();
        assert!(row.active);

        let est_row = RawRow::from_pairs([("numtah", "77"), ("numeta", "1"), ("rad_etab", "01/01/2020")]);
        let row = RegistryRow::extract(&est_row, &cols).unwrap();
        assert!(!row.active);
        assert_eq!(row.desired_active(true), Some(false));
        assert_eq!(row.desired_active(false), None);
    }

    #[test]
    fn missing_or_unusable_registry_id_fails() {
        let cols = DetectedColumns::detect(&headers());
        let raw = RawRow::from_pairs([("nom_ent", "X")]);
        assert_eq!(RegistryRow::extract(&raw, &cols), Err(RowParseError::MissingRegistryId));
        let raw = RawRow::from_pairs([("numtah", "n/a")]);
        assert!(matches!(
            RegistryRow::extract(&raw, &cols),
            Err(RowParseError::UnusableRegistryId(_))
        ));
    }

    #[test]
    fn float_artifacts_and_combined_key_resolve_to_same_parent() {
        let cols = DetectedColumns::detect(&headers());
        let a = RawRow::from_pairs([("numtah", "55.0"), ("numeta", "0.0"), ("numtah_etab", "")]);
        let b = RawRow::from_pairs([("numtah", "55.0"), ("numeta", "0.0"), ("numtah_etab", "55-0")]);
        let a = RegistryRow::extract(&a, &cols).unwrap();
        let b = RegistryRow::extract(&b, &cols).unwrap();
        assert_eq!(a.parent_key, "55");
        assert_eq!(a.parent_key, b.parent_key);
        assert_eq!(a.establishment_key, b.establishment_key);
    }

    #[test]
    fn folded_row_wins_over_parent_only_row() {
        let cols = DetectedColumns::detect(&headers());
        let base = RawRow::from_pairs([
            ("numtah", "700"),
            ("nom_ent", "Fare Ute"),
            ("naf2008_etab", "4711F"),
            ("code_fjur", "SARL"),
        ]);
        let folded = RawRow::from_pairs([("numtah", "700"), ("numeta", "0"), ("naf2008_etab", "5610A")]);
        let base = RegistryRow::extract(&base, &cols).unwrap();
        let folded = RegistryRow::extract(&folded, &cols).unwrap();

        let merged = folded.merged_over(&base);
        assert_eq!(merged.establishment_key.as_deref(), Some("700-0"));
        assert_eq!(merged.classification, "5610A");
        assert_eq!(merged.company_name, "Fare Ute");
        assert_eq!(merged.legal_form, "SARL");
        assert!(merged.active);
    }

    #[test]
    fn zip_requires_standalone_group() {
        assert_eq!(extract_zip("98714").as_deref(), Some("98714"));
        assert_eq!(extract_zip("A98714 987140 98713").as_deref(), Some("98713"));
        assert_eq!(extract_zip("BP 12"), None);
    }

    #[test]
    fn parses_supported_date_formats() {
        let d = NaiveDate::from_ymd_opt(2019, 3, 7);
        assert_eq!(parse_date("07/03/2019"), d);
        assert_eq!(parse_date("2019-03-07T00:00:00"), d);
        assert_eq!(parse_date("07-03-2019"), d);
        assert_eq!(parse_date("March 7"), None);
    }
}
