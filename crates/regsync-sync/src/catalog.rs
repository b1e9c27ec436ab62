//! Reference rows shared by many partners: legal-form types and category tags.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use regsync_core::{company_type_code, CategoryGroup, RegistryRow};
use regsync_storage::{EntityStore, StoreError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::filter::normalize_code;

/// Tags one row contributes: its activity code and its headcount class.
pub fn row_tags(row: &RegistryRow) -> Vec<(CategoryGroup, String)> {
    let mut tags = Vec::new();
    let activity = normalize_code(&row.classification);
    if !activity.is_empty() {
        tags.push((CategoryGroup::Activity, activity));
    }
    let headcount = row.headcount_class.trim();
    if !headcount.is_empty() {
        tags.push((CategoryGroup::Headcount, headcount.to_string()));
    }
    tags
}

/// Ids of every reference row the accepted rows need, resolved before the first upsert.
#[derive(Debug, Default)]
pub struct ReferenceCatalog {
    company_types: HashMap<String, Uuid>,
    categories: HashMap<(CategoryGroup, String), Uuid>,
}

impl ReferenceCatalog {
    /// Creates missing reference rows. A rejected reference is logged and left out; only a
    /// fatal store error is returned.
    pub async fn ensure(store: &dyn EntityStore, rows: &[RegistryRow]) -> Result<Self, StoreError> {
        let mut wanted_types: BTreeMap<String, String> = BTreeMap::new();
        let mut wanted_tags: BTreeSet<(CategoryGroup, String)> = BTreeSet::new();
        for row in rows {
            if let Some(code) = company_type_code(&row.legal_form) {
                wanted_types
                    .entry(code)
                    .or_insert_with(|| row.legal_form.trim().to_string());
            }
            wanted_tags.extend(row_tags(row));
        }

        let mut catalog = Self::default();
        for (code, name) in wanted_types {
            match store.ensure_company_type(&code, &name).await {
                Ok(id) => {
                    catalog.company_types.insert(code, id);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(code, error = %err, "company type not available"),
            }
        }
        for (group, label) in wanted_tags {
            match store.ensure_category(group, &label).await {
                Ok(id) => {
                    catalog.categories.insert((group, label), id);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(group = group.name(), label, error = %err, "category not available"),
            }
        }

        info!(
            company_types = catalog.company_types.len(),
            categories = catalog.categories.len(),
            "reference data ready"
        );
        Ok(catalog)
    }

    pub fn company_type(&self, legal_form: &str) -> Option<Uuid> {
        company_type_code(legal_form).and_then(|code| self.company_types.get(&code).copied())
    }

    pub fn categories_for(&self, row: &RegistryRow) -> Vec<Uuid> {
        row_tags(row)
            .into_iter()
            .filter_map(|tag| self.categories.get(&tag).copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_storage::MemoryStore;

    fn row(parent: &str, naf: &str, legal_form: &str, headcount: &str) -> RegistryRow {
        RegistryRow {
            parent_key: parent.to_string(),
            secondary_key: String::new(),
            establishment_key: None,
            company_name: format!("Company {parent}"),
            establishment_name: None,
            street: String::new(),
            street2: String::new(),
            zip: String::new(),
            city: String::new(),
            classification: naf.to_string(),
            legal_form: legal_form.to_string(),
            headcount_class: headcount.to_string(),
            incorporation_date: None,
            active: true,
        }
    }

    #[test]
    fn tags_skip_empty_codes() {
        assert_eq!(
            row_tags(&row("1", "47.11f", "", " 10 a 19 ")),
            vec![
                (CategoryGroup::Activity, "4711F".to_string()),
                (CategoryGroup::Headcount, "10 a 19".to_string()),
            ]
        );
        assert!(row_tags(&row("1", " ", "", "")).is_empty());
    }

    #[tokio::test]
    async fn shared_references_are_created_once() {
        let store = MemoryStore::new();
        let rows = vec![
            row("1", "4711F", "SARL", "0"),
            row("2", "4711F", " sarl", "0"),
            row("3", "5610A", "", ""),
        ];
        let catalog = ReferenceCatalog::ensure(&store, &rows).await.unwrap();

        let sarl = catalog.company_type("SARL").unwrap();
        assert_eq!(catalog.company_type("Sarl"), Some(sarl));
        assert_eq!(catalog.company_type(""), None);
        assert_eq!(store.company_type("sarl").await, Some((sarl, "SARL".to_string())));
        assert_eq!(catalog.categories_for(&rows[0]), catalog.categories_for(&rows[1]));
        assert_eq!(catalog.categories_for(&rows[2]).len(), 1);
        // one company type, two activity codes, one headcount label
        assert_eq!(store.stats().await.writes, 4);

        store.reset_stats().await;
        ReferenceCatalog::ensure(&store, &rows).await.unwrap();
        assert_eq!(store.stats().await.writes, 0);
    }
}
