//! PostgreSQL-backed partner store (sqlx).

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regsync_core::{
    AttrChange, CategoryGroup, Entity, EntityAttrs, EntityKind, EntityPatch, IdentifierCategory, IdentifierMetadata,
    IdentifierOutcome, NewEntity, RunCounters, RunStatus, SyncRun,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Connection, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

use crate::{ConfigProvider, EntityStore, RunStore, StoreError};

const ENTITY_COLUMNS: &str = "p.id, p.kind, p.parent_id, p.name, p.street, p.street2, p.zip, p.city, \
     p.classification, p.legal_form, p.headcount_class, p.incorporation_date, p.active, p.country_code, \
     p.company_type_id, p.last_synced_at";

const BEGIN_ROW: &str = "SAVEPOINT regsync_row";
const RELEASE_ROW: &str = "RELEASE SAVEPOINT regsync_row";
const ROLLBACK_ROW: &str = "ROLLBACK TO SAVEPOINT regsync_row";

type OpenBatch = Option<Transaction<'static, Postgres>>;

/// Entity writes go through one open transaction per batch; runs and params use the pool
/// directly so they survive a batch rollback.
pub struct PgStore {
    pool: PgPool,
    batch: Mutex<OpenBatch>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            batch: Mutex::new(None),
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(format!("running migrations: {err}")))?;
        info!("migrations applied");
        Ok(())
    }

    async fn open_batch(&self) -> Result<MutexGuard<'_, OpenBatch>, StoreError> {
        let mut guard = self.batch.lock().await;
        if guard.is_none() {
            *guard = Some(self.pool.begin().await?);
        }
        Ok(guard)
    }
}

fn in_batch<'a>(guard: &'a mut MutexGuard<'_, OpenBatch>) -> Result<&'a mut Transaction<'static, Postgres>, StoreError> {
    guard
        .as_mut()
        .ok_or_else(|| StoreError::Unavailable("no open batch".into()))
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(err.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            _ => StoreError::Rejected(err.to_string()),
        }
    }
}

fn decode_err(what: &str, raw: &str) -> StoreError {
    StoreError::Rejected(format!("undecodable {what} {raw:?}"))
}

fn entity_from_row(row: &PgRow) -> Result<Entity, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(Entity {
        id: row.try_get("id")?,
        kind: EntityKind::from_str(&kind).map_err(|_| decode_err("entity kind", &kind))?,
        parent_id: row.try_get("parent_id")?,
        attrs: EntityAttrs {
            name: row.try_get("name")?,
            street: row.try_get("street")?,
            street2: row.try_get("street2")?,
            zip: row.try_get("zip")?,
            city: row.try_get("city")?,
            classification: row.try_get("classification")?,
            legal_form: row.try_get("legal_form")?,
            headcount_class: row.try_get("headcount_class")?,
            incorporation_date: row.try_get("incorporation_date")?,
            active: row.try_get("active")?,
            country_code: row.try_get("country_code")?,
            company_type_id: row.try_get("company_type_id")?,
        },
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<SyncRun, StoreError> {
    let status: String = row.try_get("status")?;
    let count = |column: &str| -> Result<usize, StoreError> {
        let value: i64 = row.try_get(column)?;
        Ok(usize::try_from(value).unwrap_or_default())
    };
    Ok(SyncRun {
        id: row.try_get("id")?,
        resource_id: row.try_get("resource_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: RunStatus::from_str(&status).map_err(|_| decode_err("run status", &status))?,
        message: row.try_get("message")?,
        counters: RunCounters {
            created: count("created_count")?,
            updated: count("updated_count")?,
            skipped: count("skipped_count")?,
            errors: count("error_count")?,
            duplicates: count("duplicate_count")?,
        },
        checksum: row.try_get("checksum")?,
        job_ref: row.try_get("job_ref")?,
    })
}

#[async_trait]
impl EntityStore for PgStore {
    async fn find_entity_by_identifier(
        &self,
        category: IdentifierCategory,
        value: &str,
    ) -> Result<Option<Entity>, StoreError> {
        let mut found = self
            .find_entities_by_identifiers(category, &[value.to_string()])
            .await?;
        Ok(found.remove(value))
    }

    async fn find_entities_by_identifiers(
        &self,
        category: IdentifierCategory,
        values: &[String],
    ) -> Result<HashMap<String, Entity>, StoreError> {
        if values.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT i.value, {ENTITY_COLUMNS} FROM partner_identifiers i \
             JOIN partners p ON p.id = i.partner_id \
             WHERE i.category = $1 AND i.value = ANY($2)"
        );
        let mut guard = self.open_batch().await?;
        let tx = in_batch(&mut guard)?;
        let rows = sqlx::query(&sql)
            .bind(category.code())
            .bind(values.to_vec())
            .fetch_all(&mut **tx)
            .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in &rows {
            let value: String = row.try_get("value")?;
            found.insert(value, entity_from_row(row)?);
        }
        Ok(found)
    }

    async fn create_entity(&self, entity: NewEntity) -> Result<Entity, StoreError> {
        let id = Uuid::new_v4();
        let mut guard = self.open_batch().await?;
        let tx = in_batch(&mut guard)?;
        let mut savepoint = Connection::begin(&mut **tx).await?;
        sqlx::query(
            r#"
            INSERT INTO partners
                (id, kind, parent_id, name, street, street2, zip, city, classification,
                 legal_form, headcount_class, incorporation_date, active, country_code,
                 company_type_id, last_synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(id)
        .bind(entity.kind.as_str())
        .bind(entity.parent_id)
        .bind(&entity.attrs.name)
        .bind(&entity.attrs.street)
        .bind(&entity.attrs.street2)
        .bind(&entity.attrs.zip)
        .bind(&entity.attrs.city)
        .bind(&entity.attrs.classification)
        .bind(&entity.attrs.legal_form)
        .bind(&entity.attrs.headcount_class)
        .bind(entity.attrs.incorporation_date)
        .bind(entity.attrs.active)
        .bind(&entity.attrs.country_code)
        .bind(entity.attrs.company_type_id)
        .bind(entity.synced_at)
        .execute(&mut *savepoint)
        .await?;
        savepoint.commit().await?;

        Ok(Entity {
            id,
            kind: entity.kind,
            parent_id: entity.parent_id,
            attrs: entity.attrs,
            last_synced_at: Some(entity.synced_at),
        })
    }

    async fn write_patch(
        &self,
        entity_id: Uuid,
        patch: &EntityPatch,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE partners SET ");
        {
            let mut set = qb.separated(", ");
            for change in &patch.changes {
                set.push(format!("{} = ", change.field()));
                match change {
                    AttrChange::Name(v)
                    | AttrChange::Street(v)
                    | AttrChange::Street2(v)
                    | AttrChange::Zip(v)
                    | AttrChange::City(v)
                    | AttrChange::Classification(v)
                    | AttrChange::LegalForm(v)
                    | AttrChange::HeadcountClass(v)
                    | AttrChange::CountryCode(v) => {
                        set.push_bind_unseparated(v.clone());
                    }
                    AttrChange::IncorporationDate(d) => {
                        set.push_bind_unseparated(*d);
                    }
                    AttrChange::Active(a) => {
                        set.push_bind_unseparated(*a);
                    }
                    AttrChange::CompanyType(id) => {
                        set.push_bind_unseparated(*id);
                    }
                }
            }
            set.push("last_synced_at = ");
            set.push_bind_unseparated(synced_at);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(entity_id);

        let mut guard = self.open_batch().await?;
        let tx = in_batch(&mut guard)?;
        let mut savepoint = Connection::begin(&mut **tx).await?;
        let result = qb.build().execute(&mut *savepoint).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("entity {entity_id}")));
        }
        savepoint.commit().await?;
        Ok(())
    }

    async fn create_or_rebind_identifier(
        &self,
        category: IdentifierCategory,
        value: &str,
        entity_id: Uuid,
        metadata: IdentifierMetadata,
    ) -> Result<IdentifierOutcome, StoreError> {
        let mut guard = self.open_batch().await?;
        let tx = in_batch(&mut guard)?;
        let mut savepoint = Connection::begin(&mut **tx).await?;

        let existing = sqlx::query(
            "SELECT partner_id, issued_on, valid_from FROM partner_identifiers \
             WHERE category = $1 AND value = $2 FOR UPDATE",
        )
        .bind(category.code())
        .bind(value)
        .fetch_optional(&mut *savepoint)
        .await?;

        let Some(row) = existing else {
            sqlx::query(
                "INSERT INTO partner_identifiers (id, category, value, partner_id, issued_on, valid_from) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(Uuid::new_v4())
            .bind(category.code())
            .bind(value)
            .bind(entity_id)
            .bind(metadata.issued_on)
            .bind(metadata.valid_from)
            .execute(&mut *savepoint)
            .await?;
            savepoint.commit().await?;
            return Ok(IdentifierOutcome::Created);
        };

        let bound_to: Uuid = row.try_get("partner_id")?;
        let issued_on: Option<NaiveDate> = row.try_get("issued_on")?;
        let valid_from: Option<NaiveDate> = row.try_get("valid_from")?;
        let backfills = (issued_on.is_none() && metadata.issued_on.is_some())
            || (valid_from.is_none() && metadata.valid_from.is_some());

        let outcome = if bound_to != entity_id {
            IdentifierOutcome::Rebound { previous: bound_to }
        } else if backfills {
            IdentifierOutcome::Backfilled
        } else {
            savepoint.commit().await?;
            return Ok(IdentifierOutcome::Unchanged);
        };

        sqlx::query(
            "UPDATE partner_identifiers \
                SET partner_id = $3, \
                    issued_on = COALESCE(issued_on, $4), \
                    valid_from = COALESCE(valid_from, $5) \
              WHERE category = $1 AND value = $2",
        )
        .bind(category.code())
        .bind(value)
        .bind(entity_id)
        .bind(metadata.issued_on)
        .bind(metadata.valid_from)
        .execute(&mut *savepoint)
        .await?;
        savepoint.commit().await?;
        Ok(outcome)
    }

    async fn ensure_company_type(&self, code: &str, name: &str) -> Result<Uuid, StoreError> {
        let mut guard = self.open_batch().await?;
        let tx = in_batch(&mut guard)?;
        let mut savepoint = Connection::begin(&mut **tx).await?;
        sqlx::query(
            "INSERT INTO company_types (id, code, name) VALUES ($1, $2, $3) \
             ON CONFLICT (code) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(code)
        .bind(name)
        .execute(&mut *savepoint)
        .await?;
        let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM company_types WHERE code = $1")
            .bind(code)
            .fetch_one(&mut *savepoint)
            .await?;
        savepoint.commit().await?;
        Ok(id)
    }

    async fn ensure_category(&self, group: CategoryGroup, label: &str) -> Result<Uuid, StoreError> {
        let mut guard = self.open_batch().await?;
        let tx = in_batch(&mut guard)?;
        let mut savepoint = Connection::begin(&mut **tx).await?;
        sqlx::query(
            "INSERT INTO partner_categories (id, group_name, label) VALUES ($1, $2, $3) \
             ON CONFLICT (group_name, label) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(group.name())
        .bind(label)
        .execute(&mut *savepoint)
        .await?;
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM partner_categories WHERE group_name = $1 AND label = $2",
        )
        .bind(group.name())
        .bind(label)
        .fetch_one(&mut *savepoint)
        .await?;
        savepoint.commit().await?;
        Ok(id)
    }

    async fn link_category(&self, entity_id: Uuid, category_id: Uuid) -> Result<bool, StoreError> {
        let mut guard = self.open_batch().await?;
        let tx = in_batch(&mut guard)?;
        let mut savepoint = Connection::begin(&mut **tx).await?;
        let result = sqlx::query(
            "INSERT INTO partner_category_links (partner_id, category_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(entity_id)
        .bind(category_id)
        .execute(&mut *savepoint)
        .await?;
        savepoint.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn begin_row(&self) -> Result<(), StoreError> {
        let mut guard = self.open_batch().await?;
        let tx = in_batch(&mut guard)?;
        sqlx::Executor::execute(&mut **tx, sqlx::raw_sql(BEGIN_ROW)).await?;
        Ok(())
    }

    async fn release_row(&self) -> Result<(), StoreError> {
        let mut guard = self.batch.lock().await;
        if let Some(tx) = guard.as_mut() {
            sqlx::Executor::execute(&mut **tx, sqlx::raw_sql(RELEASE_ROW)).await?;
        }
        Ok(())
    }

    async fn rollback_row(&self) -> Result<(), StoreError> {
        let mut guard = self.batch.lock().await;
        if let Some(tx) = guard.as_mut() {
            sqlx::Executor::execute(&mut **tx, sqlx::raw_sql(ROLLBACK_ROW)).await?;
            sqlx::Executor::execute(&mut **tx, sqlx::raw_sql(RELEASE_ROW)).await?;
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut guard = self.batch.lock().await;
        if let Some(tx) = guard.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let mut guard = self.batch.lock().await;
        if let Some(tx) = guard.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for PgStore {
    async fn get_param(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM sync_params WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_param(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_params (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (id, resource_id, started_at, finished_at, status, message, created_count,
                 updated_count, skipped_count, error_count, duplicate_count, checksum, job_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(&run.resource_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(&run.message)
        .bind(run.counters.created as i64)
        .bind(run.counters.updated as i64)
        .bind(run.counters.skipped as i64)
        .bind(run.counters.errors as i64)
        .bind(run.counters.duplicates as i64)
        .bind(&run.checksum)
        .bind(&run.job_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET finished_at = $2,
                   status = $3,
                   message = $4,
                   created_count = $5,
                   updated_count = $6,
                   skipped_count = $7,
                   error_count = $8,
                   duplicate_count = $9,
                   checksum = $10
             WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(&run.message)
        .bind(run.counters.created as i64)
        .bind(run.counters.updated as i64)
        .bind(run.counters.skipped as i64)
        .bind(run.counters.errors as i64)
        .bind(run.counters.duplicates as i64)
        .bind(&run.checksum)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, resource_id, started_at, finished_at, status, message, created_count,
                   updated_count, skipped_count, error_count, duplicate_count, checksum, job_ref
              FROM sync_runs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}
