//! Create-or-diff application of resolved rows, with periodic batch commits.
//!
//! Each row runs inside a store row mark. A row-level failure undoes the row's writes and
//! the caches it touched, so nothing half-written survives into the next run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regsync_core::{
    AttrUpdate, Entity, EntityKind, IdentifierCategory, IdentifierMetadata, IdentifierOutcome, NewEntity,
    RegistryRow, RunCounters,
};
use regsync_storage::{EntityStore, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ReferenceCatalog;
use crate::resolver::{EntityResolver, RowTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Written {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct UpsertOptions {
    pub import_only_active: bool,
    pub batch_size: usize,
    pub country_code: String,
    pub synced_at: DateTime<Utc>,
}

pub struct UpsertEngine<'a> {
    store: &'a dyn EntityStore,
    catalog: &'a ReferenceCatalog,
    counters: &'a mut RunCounters,
    options: UpsertOptions,
    ensured: HashMap<(IdentifierCategory, String), Uuid>,
    row_ensured: Vec<(IdentifierCategory, String)>,
    since_commit: usize,
    processed: usize,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(
        store: &'a dyn EntityStore,
        catalog: &'a ReferenceCatalog,
        counters: &'a mut RunCounters,
        mut options: UpsertOptions,
    ) -> Self {
        options.batch_size = options.batch_size.max(1);
        Self {
            store,
            catalog,
            counters,
            options,
            ensured: HashMap::new(),
            row_ensured: Vec::new(),
            since_commit: 0,
            processed: 0,
        }
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Applies one row. Row-level store failures are undone, counted and swallowed; only a
    /// fatal store error is returned.
    pub async fn apply(
        &mut self,
        row: &RegistryRow,
        target: &RowTarget,
        resolver: &mut EntityResolver,
    ) -> Result<(), StoreError> {
        let checkpoint = resolver.checkpoint(row);
        let before = *self.counters;
        self.row_ensured.clear();

        self.store.begin_row().await?;
        let outcome = match self.apply_row(row, target, resolver).await {
            Ok(()) => self.store.release_row().await,
            Err(err) => Err(err),
        };
        self.processed += 1;
        self.since_commit += 1;

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                self.store.rollback_row().await?;
                resolver.restore(checkpoint);
                *self.counters = before;
                for key in self.row_ensured.drain(..) {
                    self.ensured.remove(&key);
                }
                self.counters.errors += 1;
                warn!(parent_key = %row.parent_key, establishment_key = ?row.establishment_key, error = %err, "row upsert failed");
            }
        }

        if self.since_commit >= self.options.batch_size {
            self.commit().await?;
        }
        Ok(())
    }

    /// Commits whatever the current batch holds.
    pub async fn finish(&mut self) -> Result<(), StoreError> {
        self.commit().await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.store.commit().await?;
        info!(processed = self.processed, batch = self.since_commit, "batch committed");
        self.since_commit = 0;
        Ok(())
    }

    async fn apply_row(
        &mut self,
        row: &RegistryRow,
        target: &RowTarget,
        resolver: &mut EntityResolver,
    ) -> Result<(), StoreError> {
        let metadata = row.identifier_metadata();
        match target {
            RowTarget::ParentOnly => {
                let parent = self.upsert_parent(row, resolver).await?;
                self.ensure_identifier(IdentifierCategory::Registry, &row.parent_key, parent, metadata)
                    .await?;
                self.tag(parent, row).await
            }
            RowTarget::Folded { establishment_key } => {
                let parent = self.upsert_parent(row, resolver).await?;
                self.ensure_identifier(IdentifierCategory::Registry, &row.parent_key, parent, metadata)
                    .await?;
                self.ensure_identifier(IdentifierCategory::Establishment, establishment_key, parent, metadata)
                    .await?;
                self.tag(parent, row).await
            }
            RowTarget::Child { establishment_key } => {
                let parent = self.existing_or_new_parent(row, resolver).await?;
                let update = self.with_references(row.establishment_update(self.options.import_only_active), row);
                let (child, written) = match resolver.child_mut(establishment_key) {
                    Some(entity) => {
                        let changed = self
                            .store
                            .diff_and_write(entity, &update, self.options.synced_at)
                            .await?;
                        (entity.id, if changed { Written::Updated } else { Written::Unchanged })
                    }
                    None => {
                        let entity = self
                            .create(EntityKind::Establishment, Some(parent), &update)
                            .await?;
                        let id = entity.id;
                        resolver.remember_child(establishment_key, entity);
                        (id, Written::Created)
                    }
                };
                self.count(written);
                self.ensure_identifier(IdentifierCategory::Establishment, establishment_key, child, metadata)
                    .await?;
                self.tag(parent, row).await?;
                self.tag(child, row).await
            }
        }
    }

    async fn upsert_parent(&mut self, row: &RegistryRow, resolver: &mut EntityResolver) -> Result<Uuid, StoreError> {
        let update = self.with_references(row.company_update(self.options.import_only_active), row);
        let (id, written) = match resolver.parent_mut(&row.parent_key) {
            Some(entity) => {
                let changed = self
                    .store
                    .diff_and_write(entity, &update, self.options.synced_at)
                    .await?;
                (entity.id, if changed { Written::Updated } else { Written::Unchanged })
            }
            None => {
                let entity = self.create(EntityKind::Company, None, &update).await?;
                let id = entity.id;
                resolver.remember_parent(&row.parent_key, entity);
                (id, Written::Created)
            }
        };
        self.count(written);
        Ok(id)
    }

    /// Parent of a child row: left untouched when it exists, created from the row otherwise.
    async fn existing_or_new_parent(
        &mut self,
        row: &RegistryRow,
        resolver: &mut EntityResolver,
    ) -> Result<Uuid, StoreError> {
        if let Some(entity) = resolver.parent_mut(&row.parent_key) {
            return Ok(entity.id);
        }
        let update = self.with_references(row.company_update(self.options.import_only_active), row);
        let entity = self.create(EntityKind::Company, None, &update).await?;
        let id = entity.id;
        resolver.remember_parent(&row.parent_key, entity);
        self.counters.created += 1;
        self.ensure_identifier(
            IdentifierCategory::Registry,
            &row.parent_key,
            id,
            row.identifier_metadata(),
        )
        .await?;
        Ok(id)
    }

    fn with_references(&self, mut update: AttrUpdate, row: &RegistryRow) -> AttrUpdate {
        update.country_code = self.options.country_code.clone();
        update.company_type_id = self.catalog.company_type(&row.legal_form);
        update
    }

    async fn create(
        &self,
        kind: EntityKind,
        parent_id: Option<Uuid>,
        update: &AttrUpdate,
    ) -> Result<Entity, StoreError> {
        let entity = self
            .store
            .create_entity(NewEntity {
                kind,
                parent_id,
                attrs: update.to_new_attrs(),
                synced_at: self.options.synced_at,
            })
            .await?;
        debug!(entity_id = %entity.id, kind = kind.as_str(), name = %entity.attrs.name, "entity created");
        Ok(entity)
    }

    async fn ensure_identifier(
        &mut self,
        category: IdentifierCategory,
        value: &str,
        entity_id: Uuid,
        metadata: IdentifierMetadata,
    ) -> Result<(), StoreError> {
        let key = (category, value.to_string());
        if self.ensured.get(&key) == Some(&entity_id) {
            return Ok(());
        }
        let outcome = self
            .store
            .create_or_rebind_identifier(category, value, entity_id, metadata)
            .await?;
        if let IdentifierOutcome::Rebound { previous } = outcome {
            info!(category = category.code(), value, %previous, to = %entity_id, "identifier moved");
        }
        self.ensured.insert(key.clone(), entity_id);
        self.row_ensured.push(key);
        Ok(())
    }

    /// Links the row's activity and headcount tags. Existing links are left as they are.
    async fn tag(&self, entity_id: Uuid, row: &RegistryRow) -> Result<(), StoreError> {
        for category in self.catalog.categories_for(row) {
            self.store.link_category(entity_id, category).await?;
        }
        Ok(())
    }

    fn count(&mut self, written: Written) {
        match written {
            Written::Created => self.counters.created += 1,
            Written::Updated => self.counters.updated += 1,
            Written::Unchanged => self.counters.skipped += 1,
        }
    }
}
