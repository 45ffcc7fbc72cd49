//! Remote API client: wire formats, paging, retries and conditional revalidation.

use std::time::Duration;

use bpx_core::{
    Collection, Contact, Entity, FeaturedProject, FundraisingEvent, Links, Organisation, Project,
};
use bpx_storage::{BackoffPolicy, FetchError, FetchedResponse, HttpFetcher, Transport};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

pub const CRATE_NAME: &str = "bpx-api";

pub const DEFAULT_BASE_URL: &str = "https://api.betterplace.org/de/api_v4/";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("remote returned status {status} for {url}")]
    Remote { status: u16, url: String },
    #[error("invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("sync of {endpoint} failed at page {page} after {attempts} attempts: {source}")]
    SyncFailed {
        endpoint: String,
        page: u32,
        attempts: usize,
        #[source]
        source: Box<ApiError>,
    },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: BackoffPolicy::default(),
        }
    }
}

// --- Wire formats ---

#[derive(Debug, Deserialize)]
pub struct ListResponse<W> {
    pub data: Vec<W>,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub total_entries: Option<u64>,
    #[serde(default)]
    pub per_page: Option<u32>,
    #[serde(default)]
    pub page: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LinkRecord {
    pub rel: Option<String>,
    pub href: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContactRecord {
    #[serde(default)]
    pub id: u64,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CarrierRecord {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrganisationRecord {
    pub id: u64,
    pub name: Option<String>,
    pub contact: Option<ContactRecord>,
    pub links: Option<Vec<LinkRecord>>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectRecord {
    pub id: u64,
    pub title: Option<String>,
    pub contact: Option<ContactRecord>,
    pub carrier: Option<CarrierRecord>,
    pub donations_total_in_cents: Option<u64>,
    pub donated_amount_in_cents: Option<u64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub donations_prohibited: Option<bool>,
    pub incomplete_needs_count: Option<u32>,
    pub incomplete_need_count: Option<u32>,
    pub links: Option<Vec<LinkRecord>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct FundraisingEventRecord {
    pub id: u64,
    pub title: Option<String>,
    pub contact: Option<ContactRecord>,
    pub donations_total_in_cents: Option<u64>,
    pub donated_amount_in_cents: Option<u64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub links: Option<Vec<LinkRecord>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct FeaturedProjectRecord {
    pub id: u64,
    pub title: Option<String>,
}

/// Conversion from the wire shape into the canonical model.
pub trait Ingest: Sized + Send + 'static {
    type Wire: DeserializeOwned + Send;

    fn ingest(wire: Self::Wire) -> Self;
}

fn ingest_links(links: Option<Vec<LinkRecord>>) -> Links {
    let mut map = Links::new();
    for link in links.unwrap_or_default() {
        if let (Some(rel), Some(href)) = (link.rel, link.href) {
            map.entry(rel).or_insert(href);
        }
    }
    map
}

fn ingest_contact(contact: Option<ContactRecord>) -> Option<Contact> {
    contact.map(|c| Contact {
        id: c.id,
        name: c.name.unwrap_or_default(),
    })
}

impl Ingest for Organisation {
    type Wire = OrganisationRecord;

    fn ingest(wire: OrganisationRecord) -> Self {
        Self {
            id: wire.id,
            name: wire.name.unwrap_or_default(),
            contact: ingest_contact(wire.contact),
            links: ingest_links(wire.links),
        }
    }
}

impl Ingest for Project {
    type Wire = ProjectRecord;

    fn ingest(wire: ProjectRecord) -> Self {
        Self {
            id: wire.id,
            title: wire.title.unwrap_or_default(),
            contact: ingest_contact(wire.contact),
            carrier: wire.carrier.and_then(|c| c.name),
            donated_amount_in_cents: wire
                .donated_amount_in_cents
                .or(wire.donations_total_in_cents)
                .unwrap_or(0),
            closed_at: wire.closed_at,
            completed_at: wire.completed_at,
            donations_prohibited: wire.donations_prohibited.unwrap_or(false),
            incomplete_need_count: wire
                .incomplete_need_count
                .or(wire.incomplete_needs_count)
                .unwrap_or(0),
            links: ingest_links(wire.links),
            updated_at: wire.updated_at,
            activated_at: wire.activated_at,
        }
    }
}

impl Ingest for FundraisingEvent {
    type Wire = FundraisingEventRecord;

    fn ingest(wire: FundraisingEventRecord) -> Self {
        Self {
            id: wire.id,
            title: wire.title.unwrap_or_default(),
            contact: ingest_contact(wire.contact),
            donated_amount_in_cents: wire
                .donated_amount_in_cents
                .or(wire.donations_total_in_cents)
                .unwrap_or(0),
            closed_at: wire.closed_at,
            links: ingest_links(wire.links),
            created_at: wire.created_at,
            updated_at: wire.updated_at,
        }
    }
}

impl Ingest for FeaturedProject {
    type Wire = FeaturedProjectRecord;

    fn ingest(wire: FeaturedProjectRecord) -> Self {
        Self {
            id: wire.id,
            title: wire.title.unwrap_or_default(),
        }
    }
}

// --- Client ---

#[derive(Debug, Clone, PartialEq)]
pub struct Page<R> {
    pub items: Vec<R>,
    pub page: u32,
    pub total_pages: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Revalidation<R> {
    /// Remote answered 304; the prior tag is echoed back.
    Unchanged { etag: Option<String> },
    Modified { items: Vec<R>, etag: Option<String> },
}

impl<R> Revalidation<R> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Revalidation::Unchanged { .. })
    }

    pub fn etag(&self) -> Option<&str> {
        match self {
            Revalidation::Unchanged { etag } | Revalidation::Modified { etag, .. } => {
                etag.as_deref()
            }
        }
    }
}

#[derive(Debug)]
pub struct ApiClient<T = HttpFetcher> {
    transport: T,
    base: Url,
    page_size: u32,
    request_timeout: Duration,
    backoff: BackoffPolicy,
}

impl<T: Transport> ApiClient<T> {
    pub fn new(transport: T, config: ApiConfig) -> Result<Self, ApiError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| ApiError::InvalidEndpoint(format!("{}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidEndpoint(config.base_url));
        }
        Ok(Self {
            transport,
            base,
            page_size: config.page_size.max(1),
            request_timeout: config.request_timeout,
            backoff: config.backoff,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidEndpoint(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn collection_endpoint(&self, collection: Collection) -> Result<Url, ApiError> {
        self.endpoint(&[format!("{}.json", collection.as_str()).as_str()])
    }

    pub fn item_endpoint(&self, collection: Collection, id: &str) -> Result<Url, ApiError> {
        self.endpoint(&[collection.as_str(), format!("{id}.json").as_str()])
    }

    pub fn featured_projects_endpoint(&self, event_id: u64) -> Result<Url, ApiError> {
        self.endpoint(&[
            Collection::FundraisingEvents.as_str(),
            event_id.to_string().as_str(),
            "featured_projects.json",
        ])
    }

    pub fn organisation_projects_endpoint(&self, organisation_id: u64) -> Result<Url, ApiError> {
        self.endpoint(&[
            Collection::Organisations.as_str(),
            organisation_id.to_string().as_str(),
            "projects.json",
        ])
    }

    /// One bounded GET. Status codes are not interpreted here.
    async fn request(
        &self,
        url: &Url,
        if_none_match: Option<&str>,
    ) -> Result<FetchedResponse, ApiError> {
        match tokio::time::timeout(self.request_timeout, self.transport.get(url, if_none_match))
            .await
        {
            Err(_) | Ok(Err(FetchError::Timeout { .. })) => Err(ApiError::Timeout {
                url: url.to_string(),
            }),
            Ok(Err(err)) => Err(ApiError::Network {
                url: url.to_string(),
                message: err.to_string(),
            }),
            Ok(Ok(resp)) => Ok(resp),
        }
    }

    async fn get_json<W: DeserializeOwned>(&self, url: &Url) -> Result<W, ApiError> {
        let resp = self.request(url, None).await?;
        ensure_success(&resp, url)?;
        decode(&resp, url)
    }

    pub async fn fetch_page<R: Ingest>(
        &self,
        endpoint: &Url,
        page: u32,
        page_size: u32,
    ) -> Result<Page<R>, ApiError> {
        let mut url = endpoint.clone();
        url.query_pairs_mut()
            .append_pair("per_page", &page_size.to_string())
            .append_pair("page", &page.to_string());

        let list: ListResponse<R::Wire> = self.get_json(&url).await?;
        Ok(Page {
            items: list.data.into_iter().map(R::ingest).collect(),
            page,
            total_pages: list.total_pages,
        })
    }

    async fn fetch_page_with_retry<R: Ingest>(
        &self,
        endpoint: &Url,
        page: u32,
    ) -> Result<Page<R>, ApiError> {
        let attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            match self.fetch_page(endpoint, page, self.page_size).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(ApiError::SyncFailed {
                            endpoint: endpoint.to_string(),
                            page,
                            attempts,
                            source: Box::new(err),
                        });
                    }
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(
                        page,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "page fetch failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Every page of a collection, in page order. Never returns a partial set.
    pub async fn fetch_all<R: Ingest>(&self, endpoint: &Url) -> Result<Vec<R>, ApiError> {
        let span = info_span!("fetch_all", endpoint = %endpoint);
        async move {
            let first = self.fetch_page_with_retry::<R>(endpoint, 1).await?;
            let total_pages = first.total_pages;
            let mut items = first.items;

            for page in 2..=total_pages {
                let next = self.fetch_page_with_retry::<R>(endpoint, page).await?;
                items.extend(next.items);
            }
            debug!(total_pages, items = items.len(), "fetched all pages");
            Ok(items)
        }
        .instrument(span)
        .await
    }

    /// Single-entity lookup by the literal ID. No retries.
    pub async fn fetch_one<R: Ingest + Entity>(&self, id: &str) -> Result<R, ApiError> {
        let url = self.item_endpoint(R::COLLECTION, id)?;
        let wire: R::Wire = self.get_json(&url).await?;
        Ok(R::ingest(wire))
    }

    /// Probe with `If-None-Match`; on change, refetch the whole collection.
    pub async fn revalidate<R: Ingest + Entity>(
        &self,
        etag: Option<&str>,
    ) -> Result<Revalidation<R>, ApiError> {
        let endpoint = self.collection_endpoint(R::COLLECTION)?;
        let mut probe = endpoint.clone();
        probe.query_pairs_mut().append_pair("per_page", "1");

        let resp = self.request(&probe, etag).await?;
        if resp.status.as_u16() == 304 {
            debug!(collection = %R::COLLECTION, "remote reports not modified");
            return Ok(Revalidation::Unchanged {
                etag: etag.map(str::to_owned),
            });
        }
        ensure_success(&resp, &probe)?;

        let new_etag = resp.etag;
        let items = self.fetch_all::<R>(&endpoint).await?;
        Ok(Revalidation::Modified {
            items,
            etag: new_etag,
        })
    }

    pub async fn featured_projects(&self, event_id: u64) -> Result<Vec<FeaturedProject>, ApiError> {
        let endpoint = self.featured_projects_endpoint(event_id)?;
        self.fetch_all(&endpoint).await
    }

    pub async fn projects_for_organisation(
        &self,
        organisation_id: u64,
    ) -> Result<Vec<Project>, ApiError> {
        let endpoint = self.organisation_projects_endpoint(organisation_id)?;
        self.fetch_all(&endpoint).await
    }
}

fn ensure_success(resp: &FetchedResponse, url: &Url) -> Result<(), ApiError> {
    let status = resp.status.as_u16();
    if status == 404 {
        return Err(ApiError::NotFound {
            url: url.to_string(),
        });
    }
    if !resp.status.is_success() {
        return Err(ApiError::Remote {
            status,
            url: url.to_string(),
        });
    }
    Ok(())
}

fn decode<W: DeserializeOwned>(resp: &FetchedResponse, url: &Url) -> Result<W, ApiError> {
    serde_json::from_slice(&resp.body).map_err(|e| ApiError::InvalidResponse {
        url: url.to_string(),
        message: e.to_string(),
    })
}
