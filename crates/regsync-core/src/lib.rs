//! Core domain model for the business registry mirror.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod keys;
pub mod row;

pub use keys::{canonicalize, company_type_code, establishment_key};
pub use row::{DetectedColumns, RawRow, RegistryRow, RowParseError};

pub const CRATE_NAME: &str = "regsync-core";

/// Country stamped on every mirrored partner unless configured otherwise.
pub const DEFAULT_COUNTRY_CODE: &str = "PF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Done,
    Skipped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Done => "done",
            RunStatus::Skipped => "skipped",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "done" => Ok(RunStatus::Done),
            "skipped" => Ok(RunStatus::Skipped),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other:?}")),
        }
    }
}

/// Per-run tallies. `skipped` covers both filtered-out rows and unchanged entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub duplicates: usize,
}

impl RunCounters {
    pub fn summary(&self) -> String {
        format!(
            "created:{}, updated:{}, skipped:{}, errors:{}, duplicates:{}",
            self.created, self.updated, self.skipped, self.errors, self.duplicates
        )
    }
}

/// Audit record for one synchronization attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub resource_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub message: Option<String>,
    pub counters: RunCounters,
    pub checksum: Option<String>,
    pub job_ref: Option<String>,
}

impl SyncRun {
    pub fn pending(resource_id: impl Into<String>, job_ref: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id: resource_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Pending,
            message: None,
            counters: RunCounters::default(),
            checksum: None,
            job_ref,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    Establishment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::Establishment => "establishment",
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company" => Ok(EntityKind::Company),
            "establishment" => Ok(EntityKind::Establishment),
            other => Err(format!("unknown entity kind {other:?}")),
        }
    }
}

/// Descriptive attributes mirrored from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityAttrs {
    pub name: String,
    pub street: String,
    pub street2: String,
    pub zip: String,
    pub city: String,
    pub classification: String,
    pub legal_form: String,
    pub headcount_class: String,
    pub incorporation_date: Option<NaiveDate>,
    pub active: bool,
    /// ISO 3166-1 alpha-2 code.
    pub country_code: String,
    pub company_type_id: Option<Uuid>,
}

impl EntityAttrs {
    pub fn apply(&mut self, patch: &EntityPatch) {
        for change in &patch.changes {
            match change {
                AttrChange::Name(v) => self.name = v.clone(),
                AttrChange::Street(v) => self.street = v.clone(),
                AttrChange::Street2(v) => self.street2 = v.clone(),
                AttrChange::Zip(v) => self.zip = v.clone(),
                AttrChange::City(v) => self.city = v.clone(),
                AttrChange::Classification(v) => self.classification = v.clone(),
                AttrChange::LegalForm(v) => self.legal_form = v.clone(),
                AttrChange::HeadcountClass(v) => self.headcount_class = v.clone(),
                AttrChange::IncorporationDate(v) => self.incorporation_date = Some(*v),
                AttrChange::Active(v) => self.active = *v,
                AttrChange::CountryCode(v) => self.country_code = v.clone(),
                AttrChange::CompanyType(v) => self.company_type_id = Some(*v),
            }
        }
    }
}

/// A mirrored partner record: a company or one of its establishments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub kind: EntityKind,
    pub parent_id: Option<Uuid>,
    pub attrs: EntityAttrs,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub kind: EntityKind,
    pub parent_id: Option<Uuid>,
    pub attrs: EntityAttrs,
    pub synced_at: DateTime<Utc>,
}

/// Attribute values derived from one registry row.
///
/// `incorporation_date`, `active` and `company_type_id` set to `None` mean "no opinion": the
/// diff leaves the stored value alone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttrUpdate {
    pub name: String,
    pub street: String,
    pub street2: String,
    pub zip: String,
    pub city: String,
    pub classification: String,
    pub legal_form: String,
    pub headcount_class: String,
    pub incorporation_date: Option<NaiveDate>,
    pub active: Option<bool>,
    pub country_code: String,
    pub company_type_id: Option<Uuid>,
}

impl AttrUpdate {
    /// Full attribute set for a record created from this row.
    pub fn to_new_attrs(&self) -> EntityAttrs {
        EntityAttrs {
            name: self.name.clone(),
            street: self.street.clone(),
            street2: self.street2.clone(),
            zip: self.zip.clone(),
            city: self.city.clone(),
            classification: self.classification.clone(),
            legal_form: self.legal_form.clone(),
            headcount_class: self.headcount_class.clone(),
            incorporation_date: self.incorporation_date,
            active: self.active.unwrap_or(true),
            country_code: self.country_code.clone(),
            company_type_id: self.company_type_id,
        }
    }

    /// Field-level difference between the live record and this update.
    pub fn diff(&self, current: &EntityAttrs) -> EntityPatch {
        let mut changes = Vec::new();
        let mut text = |cur: &String, new: &String, ctor: fn(String) -> AttrChange| {
            if cur != new {
                changes.push(ctor(new.clone()));
            }
        };
        text(&current.name, &self.name, AttrChange::Name);
        text(&current.street, &self.street, AttrChange::Street);
        text(&current.street2, &self.street2, AttrChange::Street2);
        text(&current.zip, &self.zip, AttrChange::Zip);
        text(&current.city, &self.city, AttrChange::City);
        text(&current.classification, &self.classification, AttrChange::Classification);
        text(&current.legal_form, &self.legal_form, AttrChange::LegalForm);
        text(&current.headcount_class, &self.headcount_class, AttrChange::HeadcountClass);
        text(&current.country_code, &self.country_code, AttrChange::CountryCode);
        if let Some(date) = self.incorporation_date {
            if current.incorporation_date != Some(date) {
                changes.push(AttrChange::IncorporationDate(date));
            }
        }
        if let Some(active) = self.active {
            if current.active != active {
                changes.push(AttrChange::Active(active));
            }
        }
        if let Some(company_type) = self.company_type_id {
            if current.company_type_id != Some(company_type) {
                changes.push(AttrChange::CompanyType(company_type));
            }
        }
        EntityPatch { changes }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrChange {
    Name(String),
    Street(String),
    Street2(String),
    Zip(String),
    City(String),
    Classification(String),
    LegalForm(String),
    HeadcountClass(String),
    IncorporationDate(NaiveDate),
    Active(bool),
    CountryCode(String),
    CompanyType(Uuid),
}

impl AttrChange {
    pub fn field(&self) -> &'static str {
        match self {
            AttrChange::Name(_) => "name",
            AttrChange::Street(_) => "street",
            AttrChange::Street2(_) => "street2",
            AttrChange::Zip(_) => "zip",
            AttrChange::City(_) => "city",
            AttrChange::Classification(_) => "classification",
            AttrChange::LegalForm(_) => "legal_form",
            AttrChange::HeadcountClass(_) => "headcount_class",
            AttrChange::IncorporationDate(_) => "incorporation_date",
            AttrChange::Active(_) => "active",
            AttrChange::CountryCode(_) => "country_code",
            AttrChange::CompanyType(_) => "company_type_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntityPatch {
    pub changes: Vec<AttrChange>,
}

impl EntityPatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn fields(&self) -> Vec<&'static str> {
        self.changes.iter().map(AttrChange::field).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierCategory {
    /// Primary registry number of a company.
    Registry,
    /// Composite `<registry>-<secondary>` establishment key.
    Establishment,
}

impl IdentifierCategory {
    pub fn code(&self) -> &'static str {
        match self {
            IdentifierCategory::Registry => "registry",
            IdentifierCategory::Establishment => "establishment",
        }
    }
}

impl FromStr for IdentifierCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registry" => Ok(IdentifierCategory::Registry),
            "establishment" => Ok(IdentifierCategory::Establishment),
            other => Err(format!("unknown identifier category {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentifierMetadata {
    pub issued_on: Option<NaiveDate>,
    pub valid_from: Option<NaiveDate>,
}

/// A `(category, value)` pair bound to exactly one entity. Unique per category + value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierRecord {
    pub id: Uuid,
    pub category: IdentifierCategory,
    pub value: String,
    pub entity_id: Uuid,
    pub metadata: IdentifierMetadata,
}

impl IdentifierRecord {
    /// Fill metadata fields that are still empty; never overwrite.
    pub fn backfill(&mut self, metadata: &IdentifierMetadata) -> bool {
        let mut changed = false;
        if self.metadata.issued_on.is_none() && metadata.issued_on.is_some() {
            self.metadata.issued_on = metadata.issued_on;
            changed = true;
        }
        if self.metadata.valid_from.is_none() && metadata.valid_from.is_some() {
            self.metadata.valid_from = metadata.valid_from;
            changed = true;
        }
        changed
    }
}

/// Tag families attached to mirrored partners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CategoryGroup {
    /// Activity classification code.
    Activity,
    /// Headcount class label.
    Headcount,
}

impl CategoryGroup {
    /// Name of the parent tag the labels hang under.
    pub fn name(&self) -> &'static str {
        match self {
            CategoryGroup::Activity => "APE",
            CategoryGroup::Headcount => "Effectif",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierOutcome {
    Created,
    Rebound { previous: Uuid },
    Backfilled,
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(name: &str) -> AttrUpdate {
        AttrUpdate {
            name: name.to_string(),
            city: "Papeete".to_string(),
            classification: "5610A".to_string(),
            active: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn diff_is_empty_for_identical_attrs() {
        let up = update("Fare Ute");
        let attrs = up.to_new_attrs();
        assert!(up.diff(&attrs).is_empty());
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let attrs = update("Fare Ute").to_new_attrs();
        let mut up = update("Fare Ute SARL");
        up.zip = "98714".into();
        let patch = up.diff(&attrs);
        assert_eq!(patch.fields(), vec!["name", "zip"]);
    }

    #[test]
    fn absent_date_and_activity_leave_stored_values() {
        let mut attrs = update("A").to_new_attrs();
        attrs.incorporation_date = NaiveDate::from_ymd_opt(2001, 5, 4);
        attrs.active = false;
        let mut up = update("A");
        up.active = None;
        assert!(up.diff(&attrs).is_empty());
    }

    #[test]
    fn deactivation_shows_up_in_diff_and_applies() {
        let mut attrs = update("A").to_new_attrs();
        let mut up = update("A");
        up.active = Some(false);
        let patch = up.diff(&attrs);
        assert_eq!(patch.changes, vec![AttrChange::Active(false)]);
        attrs.apply(&patch);
        assert!(!attrs.active);
        assert!(up.diff(&attrs).is_empty());
    }

    #[test]
    fn country_and_company_type_are_diffed() {
        let attrs = update("A").to_new_attrs();
        let company_type = Uuid::new_v4();
        let mut up = update("A");
        up.country_code = "PF".into();
        up.company_type_id = Some(company_type);
        assert_eq!(patch_fields(&up, &attrs), vec!["country_code", "company_type_id"]);

        let mut attrs = attrs;
        attrs.apply(&up.diff(&attrs));
        assert_eq!(attrs.country_code, "PF");
        assert_eq!(attrs.company_type_id, Some(company_type));

        up.company_type_id = None;
        assert!(up.diff(&attrs).is_empty());
    }

    fn patch_fields(up: &AttrUpdate, attrs: &EntityAttrs) -> Vec<&'static str> {
        up.diff(attrs).fields()
    }

    #[test]
    fn backfill_never_overwrites() {
        let d1 = NaiveDate::from_ymd_opt(2010, 1, 1);
        let d2 = NaiveDate::from_ymd_opt(2020, 1, 1);
        let mut rec = IdentifierRecord {
            id: Uuid::new_v4(),
            category: IdentifierCategory::Registry,
            value: "123".into(),
            entity_id: Uuid::new_v4(),
            metadata: IdentifierMetadata { issued_on: d1, valid_from: None },
        };
        assert!(rec.backfill(&IdentifierMetadata { issued_on: d2, valid_from: d2 }));
        assert_eq!(rec.metadata.issued_on, d1);
        assert_eq!(rec.metadata.valid_from, d2);
        assert!(!rec.backfill(&IdentifierMetadata { issued_on: d2, valid_from: d2 }));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [RunStatus::Pending, RunStatus::Done, RunStatus::Skipped, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }
}
