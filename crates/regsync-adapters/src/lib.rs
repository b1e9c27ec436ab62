//! Open-data registry protocol: dataset metadata, resource profile and paginated rows.

use std::collections::HashSet;
use std::sync::Arc;

use regsync_core::{DetectedColumns, RawRow, RowParseError};
use regsync_storage::{FetchError, JsonSource};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "regsync-adapters";

pub const DEFAULT_DATASET_URL: &str =
    "https://www.data.gouv.fr/api/1/datasets/repertoire-des-entreprises/";
pub const DEFAULT_TABULAR_URL: &str = "https://tabular-api.data.gouv.fr/api/resources";

pub const MIN_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEndpoints {
    pub dataset_url: String,
    pub tabular_url: String,
}

impl Default for RegistryEndpoints {
    fn default() -> Self {
        Self {
            dataset_url: DEFAULT_DATASET_URL.to_string(),
            tabular_url: DEFAULT_TABULAR_URL.to_string(),
        }
    }
}

impl RegistryEndpoints {
    pub fn profile_url(&self, resource_id: &str) -> String {
        format!("{}/{resource_id}/profile/", self.tabular_url.trim_end_matches('/'))
    }

    pub fn data_url(&self, resource_id: &str) -> String {
        format!("{}/{resource_id}/data/", self.tabular_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Error)]
pub enum MetadataFetchError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("unexpected payload from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("resource {0} is not listed in the dataset")]
    ResourceNotFound(String),
    #[error("no registry identifier column among the headers of resource {0}")]
    MissingRegistryColumn(String),
}

#[derive(Debug, Error)]
pub enum PageFetchError {
    #[error("page {page}: {source}")]
    Fetch {
        page: usize,
        #[source]
        source: FetchError,
    },
    #[error("page {page}: unexpected payload from {url}: {message}")]
    Decode {
        page: usize,
        url: String,
        message: String,
    },
    #[error("continuation {0} was already visited")]
    RepeatedContinuation(String),
    #[error("invalid data url {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

#[derive(Debug, Clone, Deserialize)]
struct DatasetMetadata {
    #[serde(default)]
    resources: Vec<ResourceMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResourceMetadata {
    id: String,
    #[serde(default)]
    checksum: Option<ResourceChecksum>,
    #[serde(default)]
    latest: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResourceChecksum {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResourceProfile {
    profile: ProfileBody,
}

#[derive(Debug, Clone, Deserialize)]
struct ProfileBody {
    #[serde(default)]
    header: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DataPage {
    #[serde(default)]
    data: Vec<JsonValue>,
    #[serde(default)]
    meta: Option<PageMeta>,
    #[serde(default)]
    links: Option<PageLinks>,
}

#[derive(Debug, Clone, Deserialize)]
struct PageMeta {
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct PageLinks {
    #[serde(default)]
    next: Option<String>,
}

fn decode<T: DeserializeOwned>(value: JsonValue) -> Result<T, String> {
    serde_json::from_value(value).map_err(|err| err.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Remote content matches the stored baseline.
    Skip { checksum: String },
    /// Rows are always read page by page from the tabular API, never from the file download.
    Proceed { checksum: Option<String> },
}

/// Checksum gate over the dataset metadata.
pub struct ChangeDetector {
    source: Arc<dyn JsonSource>,
    endpoints: RegistryEndpoints,
}

impl ChangeDetector {
    pub fn new(source: Arc<dyn JsonSource>, endpoints: RegistryEndpoints) -> Self {
        Self { source, endpoints }
    }

    pub async fn check(
        &self,
        resource_id: &str,
        last_checksum: Option<&str>,
        force: bool,
    ) -> Result<ChangeDecision, MetadataFetchError> {
        let url = &self.endpoints.dataset_url;
        let body = self
            .source
            .get_json(url)
            .await
            .map_err(|source| MetadataFetchError::Fetch {
                url: url.clone(),
                source,
            })?;
        let dataset: DatasetMetadata = decode(body).map_err(|message| MetadataFetchError::Decode {
            url: url.clone(),
            message,
        })?;

        let resource = dataset
            .resources
            .into_iter()
            .find(|r| r.id == resource_id)
            .ok_or_else(|| MetadataFetchError::ResourceNotFound(resource_id.to_string()))?;
        let checksum = resource
            .checksum
            .and_then(|c| c.value)
            .filter(|v| !v.trim().is_empty());
        let download = resource.latest.or(resource.url);
        info!(resource_id, checksum = ?checksum, download = ?download, "resource metadata fetched");

        match checksum {
            Some(checksum) if !force && last_checksum == Some(checksum.as_str()) => {
                info!(resource_id, %checksum, "checksum unchanged, skipping");
                Ok(ChangeDecision::Skip { checksum })
            }
            checksum => Ok(ChangeDecision::Proceed { checksum }),
        }
    }
}

/// Reads the resource profile and resolves the logical columns once per run.
pub async fn fetch_columns(
    source: &dyn JsonSource,
    endpoints: &RegistryEndpoints,
    resource_id: &str,
) -> Result<DetectedColumns, MetadataFetchError> {
    let url = endpoints.profile_url(resource_id);
    let body = source
        .get_json(&url)
        .await
        .map_err(|source| MetadataFetchError::Fetch {
            url: url.clone(),
            source,
        })?;
    let profile: ResourceProfile =
        decode(body).map_err(|message| MetadataFetchError::Decode { url, message })?;

    let columns = DetectedColumns::detect(&profile.profile.header);
    if !columns.has_registry_id() {
        return Err(MetadataFetchError::MissingRegistryColumn(resource_id.to_string()));
    }
    info!(headers = profile.profile.header.len(), columns = ?columns, "header map detected");
    Ok(columns)
}

/// `<column>__in=<csv>` restriction sent with the first page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFilter {
    pub column: String,
    pub values: Vec<String>,
}

pub fn clamp_page_size(page_size: usize) -> usize {
    page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

pub fn first_page_url(
    data_url: &str,
    page_size: usize,
    filter: Option<&ServerFilter>,
) -> Result<String, PageFetchError> {
    let mut url = Url::parse(data_url).map_err(|err| PageFetchError::InvalidUrl {
        url: data_url.to_string(),
        message: err.to_string(),
    })?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("page", "1")
            .append_pair("page_size", &clamp_page_size(page_size).to_string());
        if let Some(filter) = filter.filter(|f| !f.values.is_empty()) {
            query.append_pair(&format!("{}__in", filter.column), &filter.values.join(","));
        }
    }
    Ok(url.to_string())
}

#[derive(Debug)]
pub struct FetchedPage {
    pub number: usize,
    pub rows: Vec<Result<RawRow, RowParseError>>,
}

/// Finite, forward-only walk over the data pages of one resource.
///
/// The continuation link returned by the server is followed verbatim. Any page failure ends
/// the walk and is kept in [`PaginatedFetcher::interruption`].
pub struct PaginatedFetcher {
    source: Arc<dyn JsonSource>,
    next_url: Option<String>,
    visited: HashSet<String>,
    page: usize,
    total: Option<u64>,
    interruption: Option<PageFetchError>,
}

impl PaginatedFetcher {
    pub fn new(
        source: Arc<dyn JsonSource>,
        data_url: &str,
        page_size: usize,
        filter: Option<&ServerFilter>,
    ) -> Self {
        let (next_url, interruption) = match first_page_url(data_url, page_size, filter) {
            Ok(url) => (Some(url), None),
            Err(err) => {
                warn!(error = %err, "cannot build first page request");
                (None, Some(err))
            }
        };
        Self {
            source,
            next_url,
            visited: HashSet::new(),
            page: 0,
            total: None,
            interruption,
        }
    }

    pub async fn next_page(&mut self) -> Option<FetchedPage> {
        let url = self.next_url.take()?;
        if !self.visited.insert(url.clone()) {
            return self.interrupt(PageFetchError::RepeatedContinuation(url));
        }
        self.page += 1;
        let number = self.page;

        let body = match self.source.get_json(&url).await {
            Ok(body) => body,
            Err(source) => return self.interrupt(PageFetchError::Fetch { page: number, source }),
        };
        let page: DataPage = match decode(body) {
            Ok(page) => page,
            Err(message) => {
                return self.interrupt(PageFetchError::Decode {
                    page: number,
                    url,
                    message,
                })
            }
        };

        if let Some(total) = page.meta.and_then(|m| m.total) {
            self.total = Some(total);
        }
        self.next_url = page
            .links
            .and_then(|l| l.next)
            .filter(|next| !next.trim().is_empty());

        let rows: Vec<_> = page.data.iter().map(RawRow::from_json).collect();
        info!(page = number, rows = rows.len(), total = ?self.total, "page fetched");
        debug!(next = ?self.next_url, "continuation");
        Some(FetchedPage { number, rows })
    }

    /// Drains every remaining page into one row list.
    pub async fn collect_rows(&mut self) -> Vec<Result<RawRow, RowParseError>> {
        let mut rows = Vec::new();
        while let Some(page) = self.next_page().await {
            rows.extend(page.rows);
        }
        rows
    }

    pub fn pages_fetched(&self) -> usize {
        self.page
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn interruption(&self) -> Option<&PageFetchError> {
        self.interruption.as_ref()
    }

    fn interrupt(&mut self, err: PageFetchError) -> Option<FetchedPage> {
        warn!(error = %err, "pagination interrupted");
        self.next_url = None;
        self.interruption = Some(err);
        None
    }
}
