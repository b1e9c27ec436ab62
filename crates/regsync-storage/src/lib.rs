//! HTTP fetch utilities and datastore collaborators for the registry mirror.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regsync_core::{
    AttrUpdate, CategoryGroup, Entity, EntityPatch, IdentifierCategory, IdentifierMetadata, IdentifierOutcome,
    NewEntity, SyncRun,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "regsync-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("no response scripted for {0}")]
    Unscripted(String),
}

/// Read-only JSON GET. The seam every registry call goes through.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError>;
}

/// Single-attempt JSON fetcher with a bounded timeout. Retries belong to the caller.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JsonSource for HttpFetcher {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "response received");
            serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
                url: final_url,
                message: err.to_string(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Canned responses keyed by exact URL. Records every request it serves.
#[derive(Debug, Default)]
pub struct StaticJsonSource {
    responses: HashMap<String, Result<JsonValue, u16>>,
    requests: Mutex<Vec<String>>,
}

impl StaticJsonSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: impl Into<String>, body: JsonValue) -> Self {
        self.responses.insert(url.into(), Ok(body));
        self
    }

    pub fn with_status(mut self, url: impl Into<String>, status: u16) -> Self {
        self.responses.insert(url.into(), Err(status));
        self
    }

    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl JsonSource for StaticJsonSource {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        self.requests.lock().await.push(url.to_string());
        match self.responses.get(url) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(status)) => Err(FetchError::HttpStatus {
                status: *status,
                url: url.to_string(),
            }),
            None => Err(FetchError::Unscripted(url.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store itself is unusable; the run cannot continue.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("uniqueness conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Partner datastore operations the sync engine relies on.
///
/// Writes land in the current batch until [`EntityStore::commit`]; [`EntityStore::rollback`]
/// discards only the uncommitted batch. Inside a batch, [`EntityStore::begin_row`] opens a
/// nested mark so one row's writes can be undone without touching the rest.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_entity_by_identifier(
        &self,
        category: IdentifierCategory,
        value: &str,
    ) -> Result<Option<Entity>, StoreError>;

    /// Bulk variant keyed by identifier value. Missing values are absent from the map.
    async fn find_entities_by_identifiers(
        &self,
        category: IdentifierCategory,
        values: &[String],
    ) -> Result<HashMap<String, Entity>, StoreError> {
        let mut found = HashMap::new();
        for value in values {
            if let Some(entity) = self.find_entity_by_identifier(category, value).await? {
                found.insert(value.clone(), entity);
            }
        }
        Ok(found)
    }

    async fn create_entity(&self, entity: NewEntity) -> Result<Entity, StoreError>;

    /// Persist only the fields in `patch`, stamping the sync time.
    async fn write_patch(
        &self,
        entity_id: Uuid,
        patch: &EntityPatch,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Diff live attributes against `update` and write the changed fields. `entity` is kept
    /// in step with what was written. Returns whether anything changed.
    async fn diff_and_write(
        &self,
        entity: &mut Entity,
        update: &AttrUpdate,
        synced_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let patch = update.diff(&entity.attrs);
        if patch.is_empty() {
            return Ok(false);
        }
        debug!(entity_id = %entity.id, fields = ?patch.fields(), "writing entity diff");
        self.write_patch(entity.id, &patch, synced_at).await?;
        entity.attrs.apply(&patch);
        entity.last_synced_at = Some(synced_at);
        Ok(true)
    }

    /// Bind `(category, value)` to `entity_id`, creating it or moving it from another entity.
    /// Missing metadata is backfilled, present metadata is kept.
    async fn create_or_rebind_identifier(
        &self,
        category: IdentifierCategory,
        value: &str,
        entity_id: Uuid,
        metadata: IdentifierMetadata,
    ) -> Result<IdentifierOutcome, StoreError>;

    /// Legal-form reference for `code`, created on first use.
    async fn ensure_company_type(&self, code: &str, name: &str) -> Result<Uuid, StoreError>;

    /// Tag `label` under `group`, created on first use.
    async fn ensure_category(&self, group: CategoryGroup, label: &str) -> Result<Uuid, StoreError>;

    /// Attach a tag to an entity. Returns whether the link is new.
    async fn link_category(&self, entity_id: Uuid, category_id: Uuid) -> Result<bool, StoreError>;

    async fn begin_row(&self) -> Result<(), StoreError>;

    /// Keep the current row's writes in the batch.
    async fn release_row(&self) -> Result<(), StoreError>;

    /// Undo every write since [`EntityStore::begin_row`].
    async fn rollback_row(&self) -> Result<(), StoreError>;

    async fn commit(&self) -> Result<(), StoreError>;

    async fn rollback(&self) -> Result<(), StoreError>;
}

/// Generic key/value parameters.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get_param(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_param(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Durable run history. Writes bypass the entity batch so a rollback never erases a run.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError>;
    async fn update_run(&self, run: &SyncRun) -> Result<(), StoreError>;
    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError>;
}

/// The three collaborators, usually backed by one store.
#[derive(Clone)]
pub struct Backend {
    pub entities: Arc<dyn EntityStore>,
    pub config: Arc<dyn ConfigProvider>,
    pub runs: Arc<dyn RunStore>,
}

impl Backend {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: EntityStore + ConfigProvider + RunStore + 'static,
    {
        Self {
            entities: store.clone(),
            config: store.clone(),
            runs: store,
        }
    }
}
