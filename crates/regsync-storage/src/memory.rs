//! In-process store with batch snapshots. Backs dry runs and the engine tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regsync_core::{
    CategoryGroup, Entity, EntityPatch, IdentifierCategory, IdentifierMetadata, IdentifierOutcome,
    IdentifierRecord, NewEntity, SyncRun,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{ConfigProvider, EntityStore, RunStore, StoreError};

#[derive(Debug, Clone, Default)]
struct Snapshot {
    entities: HashMap<Uuid, Entity>,
    identifiers: HashMap<(IdentifierCategory, String), IdentifierRecord>,
    company_types: HashMap<String, (Uuid, String)>,
    categories: HashMap<(CategoryGroup, String), Uuid>,
    links: HashSet<(Uuid, Uuid)>,
}

/// Call counters for assertions on side effects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub lookups: Vec<(IdentifierCategory, String)>,
    pub writes: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Default)]
struct Inner {
    live: Snapshot,
    committed: Snapshot,
    row_mark: Option<Snapshot>,
    params: HashMap<String, String>,
    runs: Vec<SyncRun>,
    stats: MemoryStats,
    creates: usize,
    fail_creates_after: Option<usize>,
    rejected_values: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `create_entity` after the first `n` reports the store as unavailable.
    pub async fn fail_creates_after(&self, n: usize) {
        self.inner.lock().await.fail_creates_after = Some(n);
    }

    /// Identifier writes for `value` are rejected as row-level failures.
    pub async fn reject_identifier(&self, value: impl Into<String>) {
        self.inner.lock().await.rejected_values.insert(value.into());
    }

    pub async fn stats(&self) -> MemoryStats {
        self.inner.lock().await.stats.clone()
    }

    pub async fn reset_stats(&self) {
        self.inner.lock().await.stats = MemoryStats::default();
    }

    pub async fn entities(&self) -> Vec<Entity> {
        let inner = self.inner.lock().await;
        let mut entities: Vec<Entity> = inner.live.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.attrs.name.cmp(&b.attrs.name));
        entities
    }

    pub async fn entity(&self, id: Uuid) -> Option<Entity> {
        self.inner.lock().await.live.entities.get(&id).cloned()
    }

    pub async fn identifier(&self, category: IdentifierCategory, value: &str) -> Option<IdentifierRecord> {
        self.inner
            .lock()
            .await
            .live
            .identifiers
            .get(&(category, value.to_string()))
            .cloned()
    }

    /// Tags attached to `entity_id`, sorted.
    pub async fn categories_of(&self, entity_id: Uuid) -> Vec<(CategoryGroup, String)> {
        let inner = self.inner.lock().await;
        let mut tags: Vec<(CategoryGroup, String)> = inner
            .live
            .categories
            .iter()
            .filter(|(_, id)| inner.live.links.contains(&(entity_id, **id)))
            .map(|((group, label), _)| (*group, label.clone()))
            .collect();
        tags.sort();
        tags
    }

    pub async fn company_type(&self, code: &str) -> Option<(Uuid, String)> {
        self.inner.lock().await.live.company_types.get(code).cloned()
    }

    pub async fn identifiers(&self) -> Vec<IdentifierRecord> {
        let inner = self.inner.lock().await;
        let mut records: Vec<IdentifierRecord> = inner.live.identifiers.values().cloned().collect();
        records.sort_by(|a, b| (a.category, &a.value).cmp(&(b.category, &b.value)));
        records
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_entity_by_identifier(
        &self,
        category: IdentifierCategory,
        value: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.stats.lookups.push((category, value.to_string()));
        let entity = inner
            .live
            .identifiers
            .get(&(category, value.to_string()))
            .and_then(|record| inner.live.entities.get(&record.entity_id))
            .cloned();
        Ok(entity)
    }

    async fn create_entity(&self, entity: NewEntity) -> Result<Entity, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_creates_after.is_some_and(|limit| inner.creates >= limit) {
            return Err(StoreError::Unavailable("memory store connection dropped".into()));
        }
        inner.creates += 1;
        inner.stats.writes += 1;
        let created = Entity {
            id: Uuid::new_v4(),
            kind: entity.kind,
            parent_id: entity.parent_id,
            attrs: entity.attrs,
            last_synced_at: Some(entity.synced_at),
        };
        inner.live.entities.insert(created.id, created.clone());
        Ok(created)
    }

    async fn write_patch(
        &self,
        entity_id: Uuid,
        patch: &EntityPatch,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.stats.writes += 1;
        let entity = inner
            .live
            .entities
            .get_mut(&entity_id)
            .ok_or_else(|| StoreError::NotFound(format!("entity {entity_id}")))?;
        entity.attrs.apply(patch);
        entity.last_synced_at = Some(synced_at);
        Ok(())
    }

    async fn create_or_rebind_identifier(
        &self,
        category: IdentifierCategory,
        value: &str,
        entity_id: Uuid,
        metadata: IdentifierMetadata,
    ) -> Result<IdentifierOutcome, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.rejected_values.contains(value) {
            return Err(StoreError::Rejected(format!("identifier {value} refused")));
        }
        if !inner.live.entities.contains_key(&entity_id) {
            return Err(StoreError::NotFound(format!("entity {entity_id}")));
        }

        let key = (category, value.to_string());
        let outcome = match inner.live.identifiers.get_mut(&key) {
            None => {
                inner.live.identifiers.insert(
                    key,
                    IdentifierRecord {
                        id: Uuid::new_v4(),
                        category,
                        value: value.to_string(),
                        entity_id,
                        metadata,
                    },
                );
                IdentifierOutcome::Created
            }
            Some(record) if record.entity_id != entity_id => {
                let previous = record.entity_id;
                record.entity_id = entity_id;
                record.backfill(&metadata);
                IdentifierOutcome::Rebound { previous }
            }
            Some(record) => {
                if record.backfill(&metadata) {
                    IdentifierOutcome::Backfilled
                } else {
                    IdentifierOutcome::Unchanged
                }
            }
        };
        if outcome != IdentifierOutcome::Unchanged {
            inner.stats.writes += 1;
        }
        Ok(outcome)
    }

    async fn ensure_company_type(&self, code: &str, name: &str) -> Result<Uuid, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some((id, _)) = inner.live.company_types.get(code) {
            return Ok(*id);
        }
        let id = Uuid::new_v4();
        inner
            .live
            .company_types
            .insert(code.to_string(), (id, name.to_string()));
        inner.stats.writes += 1;
        Ok(id)
    }

    async fn ensure_category(&self, group: CategoryGroup, label: &str) -> Result<Uuid, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(id) = inner.live.categories.get(&(group, label.to_string())) {
            return Ok(*id);
        }
        let id = Uuid::new_v4();
        inner.live.categories.insert((group, label.to_string()), id);
        inner.stats.writes += 1;
        Ok(id)
    }

    async fn link_category(&self, entity_id: Uuid, category_id: Uuid) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !inner.live.entities.contains_key(&entity_id) {
            return Err(StoreError::NotFound(format!("entity {entity_id}")));
        }
        if !inner.live.categories.values().any(|id| *id == category_id) {
            return Err(StoreError::NotFound(format!("category {category_id}")));
        }
        let linked = inner.live.links.insert((entity_id, category_id));
        if linked {
            inner.stats.writes += 1;
        }
        Ok(linked)
    }

    async fn begin_row(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.row_mark = Some(inner.live.clone());
        Ok(())
    }

    async fn release_row(&self) -> Result<(), StoreError> {
        self.inner.lock().await.row_mark = None;
        Ok(())
    }

    async fn rollback_row(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(mark) = inner.row_mark.take() {
            inner.live = mark;
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.committed = inner.live.clone();
        inner.row_mark = None;
        inner.stats.commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.live = inner.committed.clone();
        inner.row_mark = None;
        inner.stats.rollbacks += 1;
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for MemoryStore {
    async fn get_param(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.params.get(key).cloned())
    }

    async fn set_param(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .params
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.inner.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run.id)))?;
        *slot = run.clone();
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.iter().rev().take(limit).cloned().collect())
    }
}
