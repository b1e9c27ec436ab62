//! Maps accepted rows onto parent/child entities.
//!
//! The fold decision is taken from one aggregate pass over the whole accepted row set, so it
//! does not depend on page order. Existing entities are bulk-prefetched through the identifier
//! store before the first write.

use std::collections::{BTreeSet, HashMap};

use regsync_core::{Entity, EntityKind, IdentifierCategory, RegistryRow};
use regsync_storage::{EntityStore, StoreError};
use tracing::info;

/// Where one row's attributes land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowTarget {
    /// No establishment key: the row describes the parent alone.
    ParentOnly,
    /// The parent's single establishment, merged into the parent.
    Folded { establishment_key: String },
    /// One of several establishments, kept as a child entity.
    Child { establishment_key: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldPlan {
    establishments: HashMap<String, BTreeSet<String>>,
}

impl FoldPlan {
    pub fn build<'a>(rows: impl IntoIterator<Item = &'a RegistryRow>) -> Self {
        let mut establishments: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in rows {
            let keys = establishments.entry(row.parent_key.clone()).or_default();
            if let Some(key) = &row.establishment_key {
                keys.insert(key.clone());
            }
        }
        Self { establishments }
    }

    /// Distinct establishment keys seen for `parent_key` in this run.
    pub fn establishment_count(&self, parent_key: &str) -> usize {
        self.establishments.get(parent_key).map_or(0, BTreeSet::len)
    }

    pub fn is_folded(&self, parent_key: &str) -> bool {
        self.establishment_count(parent_key) == 1
    }

    /// Collapses each parent's parent-only row and folded row into one row, kept at the
    /// position of the first of them, so the parent is diffed once. Child rows pass through.
    pub fn coalesce(&self, rows: Vec<RegistryRow>) -> Vec<RegistryRow> {
        let mut merged: Vec<RegistryRow> = Vec::with_capacity(rows.len());
        let mut slots: HashMap<String, usize> = HashMap::new();
        for row in rows {
            if matches!(self.target(&row), RowTarget::Child { .. }) {
                merged.push(row);
                continue;
            }
            match slots.get(&row.parent_key) {
                Some(&slot) => {
                    let combined = if row.establishment_key.is_some() {
                        row.merged_over(&merged[slot])
                    } else {
                        merged[slot].merged_over(&row)
                    };
                    merged[slot] = combined;
                }
                None => {
                    slots.insert(row.parent_key.clone(), merged.len());
                    merged.push(row);
                }
            }
        }
        merged
    }

    pub fn target(&self, row: &RegistryRow) -> RowTarget {
        match &row.establishment_key {
            None => RowTarget::ParentOnly,
            Some(key) if self.is_folded(&row.parent_key) => RowTarget::Folded {
                establishment_key: key.clone(),
            },
            Some(key) => RowTarget::Child {
                establishment_key: key.clone(),
            },
        }
    }
}

/// Cache entries one row may touch, captured before it is applied.
#[derive(Debug)]
pub struct RowCheckpoint {
    parent_key: String,
    parent: Option<Entity>,
    establishment_key: Option<String>,
    child: Option<Entity>,
}

/// Run-scoped cache of parents by registry key and children by establishment key.
#[derive(Debug, Default)]
pub struct EntityResolver {
    parents: HashMap<String, Entity>,
    children: HashMap<String, Entity>,
}

impl EntityResolver {
    pub async fn prefetch(store: &dyn EntityStore, rows: &[RegistryRow]) -> Result<Self, StoreError> {
        let parent_keys: BTreeSet<String> = rows.iter().map(|r| r.parent_key.clone()).collect();
        let establishment_keys: BTreeSet<String> =
            rows.iter().filter_map(|r| r.establishment_key.clone()).collect();

        let parents = store
            .find_entities_by_identifiers(
                IdentifierCategory::Registry,
                &parent_keys.into_iter().collect::<Vec<_>>(),
            )
            .await?;
        // An establishment identifier held by a company comes from an earlier fold.
        let children: HashMap<String, Entity> = store
            .find_entities_by_identifiers(
                IdentifierCategory::Establishment,
                &establishment_keys.into_iter().collect::<Vec<_>>(),
            )
            .await?
            .into_iter()
            .filter(|(_, entity)| entity.kind == EntityKind::Establishment)
            .collect();

        info!(parents = parents.len(), children = children.len(), "existing entities prefetched");
        Ok(Self { parents, children })
    }

    pub fn parent_mut(&mut self, parent_key: &str) -> Option<&mut Entity> {
        self.parents.get_mut(parent_key)
    }

    pub fn remember_parent(&mut self, parent_key: &str, entity: Entity) {
        self.parents.insert(parent_key.to_string(), entity);
    }

    pub fn child_mut(&mut self, establishment_key: &str) -> Option<&mut Entity> {
        self.children.get_mut(establishment_key)
    }

    pub fn remember_child(&mut self, establishment_key: &str, entity: Entity) {
        self.children.insert(establishment_key.to_string(), entity);
    }

    pub fn checkpoint(&self, row: &RegistryRow) -> RowCheckpoint {
        RowCheckpoint {
            parent_key: row.parent_key.clone(),
            parent: self.parents.get(&row.parent_key).cloned(),
            child: row
                .establishment_key
                .as_ref()
                .and_then(|key| self.children.get(key).cloned()),
            establishment_key: row.establishment_key.clone(),
        }
    }

    /// Puts back the entries captured by [`EntityResolver::checkpoint`] after the row's
    /// writes were undone.
    pub fn restore(&mut self, checkpoint: RowCheckpoint) {
        match checkpoint.parent {
            Some(entity) => self.parents.insert(checkpoint.parent_key, entity),
            None => self.parents.remove(&checkpoint.parent_key),
        };
        if let Some(key) = checkpoint.establishment_key {
            match checkpoint.child {
                Some(entity) => self.children.insert(key, entity),
                None => self.children.remove(&key),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use regsync_core::EntityAttrs;
    use uuid::Uuid;

    fn row(parent: &str, establishment: Option<&str>) -> RegistryRow {
        RegistryRow {
            parent_key: parent.to_string(),
            secondary_key: String::new(),
            establishment_key: establishment.map(str::to_string),
            company_name: format!("Company {parent}"),
            establishment_name: None,
            street: String::new(),
            street2: String::new(),
            zip: String::new(),
            city: String::new(),
            classification: String::new(),
            legal_form: String::new(),
            headcount_class: String::new(),
            incorporation_date: None,
            active: true,
        }
    }

    #[test]
    fn single_establishment_folds() {
        let rows = vec![row("1", Some("1-0")), row("2", Some("2-0")), row("2", Some("2-1")), row("3", None)];
        let plan = FoldPlan::build(&rows);

        assert!(plan.is_folded("1"));
        assert!(!plan.is_folded("2"));
        assert!(!plan.is_folded("3"));
        assert_eq!(plan.target(&rows[0]), RowTarget::Folded { establishment_key: "1-0".into() });
        assert_eq!(plan.target(&rows[1]), RowTarget::Child { establishment_key: "2-0".into() });
        assert_eq!(plan.target(&rows[3]), RowTarget::ParentOnly);
    }

    #[test]
    fn count_is_distinct_not_per_row() {
        let rows = vec![row("9", Some("9-0")), row("9", Some("9-0")), row("9", None)];
        let plan = FoldPlan::build(&rows);
        assert_eq!(plan.establishment_count("9"), 1);
        assert!(plan.is_folded("9"));
    }

    #[test]
    fn parent_rows_coalesce_and_children_pass_through() {
        let mut folded = row("7", Some("7-0"));
        folded.classification = "5610A".into();
        let mut parent_only = row("7", None);
        parent_only.classification = "4711F".into();
        parent_only.city = "Papeete".into();
        let rows = vec![
            parent_only,
            row("8", Some("8-0")),
            row("8", Some("8-1")),
            folded,
            row("9", None),
        ];
        let plan = FoldPlan::build(&rows);
        let merged = plan.coalesce(rows);

        assert_eq!(merged.len(), 4);
        assert_eq!(merged[0].parent_key, "7");
        assert_eq!(plan.target(&merged[0]), RowTarget::Folded { establishment_key: "7-0".into() });
        assert_eq!(merged[0].classification, "5610A");
        assert_eq!(merged[0].city, "Papeete");
        assert_eq!(plan.target(&merged[1]), RowTarget::Child { establishment_key: "8-0".into() });
        assert_eq!(plan.target(&merged[3]), RowTarget::ParentOnly);
    }

    #[test]
    fn restore_forgets_entries_added_by_a_failed_row() {
        let entity = |name: &str| Entity {
            id: Uuid::new_v4(),
            kind: EntityKind::Company,
            parent_id: None,
            attrs: EntityAttrs {
                name: name.into(),
                ..Default::default()
            },
            last_synced_at: None,
        };
        let mut resolver = EntityResolver::default();
        resolver.remember_parent("1", entity("before"));

        let r = row("1", Some("1-0"));
        let checkpoint = resolver.checkpoint(&r);
        if let Some(parent) = resolver.parent_mut("1") {
            parent.attrs.name = "during".into();
        }
        resolver.remember_child("1-0", entity("child"));
        resolver.restore(checkpoint);

        assert_eq!(resolver.parent_mut("1").map(|e| e.attrs.name.clone()).as_deref(), Some("before"));
        assert!(resolver.child_mut("1-0").is_none());
    }

    fn rescan_count(rows: &[RegistryRow], parent: &str) -> usize {
        rows.iter()
            .filter(|r| r.parent_key == parent)
            .filter_map(|r| r.establishment_key.as_deref())
            .collect::<BTreeSet<_>>()
            .len()
    }

    fn arb_rows() -> impl Strategy<Value = Vec<RegistryRow>> {
        prop::collection::vec((0u8..6, prop::option::of(0u8..4)), 0..40).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(p, e)| {
                    let parent = p.to_string();
                    let est = e.map(|e| format!("{parent}-{e}"));
                    row(&parent, est.as_deref())
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn fold_plan_ignores_row_order(
            (rows, shuffled) in arb_rows().prop_flat_map(|rows| (Just(rows.clone()), Just(rows).prop_shuffle()))
        ) {
            let plan = FoldPlan::build(&rows);
            let replan = FoldPlan::build(&shuffled);
            prop_assert_eq!(&plan, &replan);
            for r in &shuffled {
                prop_assert_eq!(plan.target(r), replan.target(r));
            }
        }

        #[test]
        fn aggregate_pass_matches_per_parent_rescan(rows in arb_rows()) {
            let plan = FoldPlan::build(&rows);
            for r in &rows {
                prop_assert_eq!(plan.establishment_count(&r.parent_key), rescan_count(&rows, &r.parent_key));
            }
        }
    }
}
