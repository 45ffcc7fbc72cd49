//! Search over the mirrored collections: ID lookup against the remote API,
//! contact-name matching and fuzzy organisation-name matching against the
//! local snapshot.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bpx_api::{ApiClient, Ingest};
use bpx_core::{
    Entity, FundraisingEvent, FundraisingEventWithProjects, Organisation, Project,
    SearchResultSet,
};
use bpx_storage::Transport;
use bpx_sync::{Mirror, StatusRecord, SyncState};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "bpx-search";

pub const DEFAULT_FAN_OUT_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Id,
    Contact,
    Organisation,
}

impl SearchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::Id => "id",
            SearchMode::Contact => "contact",
            SearchMode::Organisation => "organisation",
        }
    }

    /// ID lookups go straight to the remote API; the other modes read the
    /// local snapshot and need a synced mirror first.
    pub fn uses_mirror(self) -> bool {
        !matches!(self, SearchMode::Id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchRequest {
    Id(String),
    Contact(String),
    Organisation(String),
}

impl SearchRequest {
    /// Pick one mode from the raw search-bar terms. Blank terms are ignored;
    /// ID beats contact beats organisation.
    pub fn from_terms(
        id: Option<&str>,
        contact: Option<&str>,
        organisation: Option<&str>,
    ) -> Option<Self> {
        fn present(term: Option<&str>) -> Option<String> {
            term.map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_owned)
        }

        present(id)
            .map(Self::Id)
            .or_else(|| present(contact).map(Self::Contact))
            .or_else(|| present(organisation).map(Self::Organisation))
    }

    pub fn mode(&self) -> SearchMode {
        match self {
            SearchRequest::Id(_) => SearchMode::Id,
            SearchRequest::Contact(_) => SearchMode::Contact,
            SearchRequest::Organisation(_) => SearchMode::Organisation,
        }
    }

    pub fn term(&self) -> &str {
        match self {
            SearchRequest::Id(t) | SearchRequest::Contact(t) | SearchRequest::Organisation(t) => t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<&'static str>,
}

impl Availability {
    const READY: Self = Self {
        available: true,
        reason: None,
    };

    fn blocked(reason: &'static str) -> Self {
        Self {
            available: false,
            reason: Some(reason),
        }
    }
}

/// Whether `mode` may run given the current sync status.
pub fn availability(mode: SearchMode, status: &StatusRecord) -> Availability {
    match mode {
        SearchMode::Id => Availability::READY,
        SearchMode::Organisation => match status.organisation_search() {
            SyncState::Ready => Availability::READY,
            SyncState::Failed => {
                Availability::blocked("Organisation data failed to load. Search is disabled.")
            }
            SyncState::Idle | SyncState::Syncing => {
                Availability::blocked("Organisation data syncing, please wait...")
            }
        },
        SearchMode::Contact => match status.contact_search() {
            SyncState::Ready => Availability::READY,
            SyncState::Failed => {
                Availability::blocked("Project & Event data failed to load. Search is disabled.")
            }
            SyncState::Idle | SyncState::Syncing => {
                Availability::blocked("Project & Event data syncing, please wait...")
            }
        },
    }
}

/// Trim, lower-case, drop `.` and split on whitespace.
pub fn normalize_name(name: &str) -> Vec<String> {
    name.trim()
        .to_lowercase()
        .replace('.', "")
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}

/// Does `query` name the person `contact_name`?
///
/// Accepts the full name, the bare last name, or a first initial followed by
/// the last name (`D. Zander`).
pub fn contact_matches(query: &str, contact_name: &str) -> bool {
    tokens_match_contact(&normalize_name(query), &normalize_name(contact_name))
}

fn tokens_match_contact(query: &[String], contact: &[String]) -> bool {
    if query.is_empty() || contact.is_empty() {
        return false;
    }
    if query == contact {
        return true;
    }
    let (Some(first), Some(last)) = (contact.first(), contact.last()) else {
        return false;
    };
    match query {
        [only] => only == last,
        [initial, surname] => {
            initial.chars().count() == 1 && first.starts_with(initial.as_str()) && surname == last
        }
        _ => false,
    }
}

pub fn edit_distance(a: &str, b: &str) -> usize {
    strsim::levenshtein(a, b)
}

fn tolerance(token: &str) -> usize {
    (token.chars().count() / 5).max(1)
}

/// Fuzzy organisation-name match: substring, else every query token must
/// prefix or nearly equal some name token.
pub fn organisation_matches(query: &str, organisation_name: &str) -> bool {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return false;
    }
    let name = organisation_name.to_lowercase();
    if name.contains(&query) {
        return true;
    }
    let name_tokens: Vec<&str> = name.split_whitespace().collect();
    query.split_whitespace().all(|q| {
        let max = tolerance(q);
        name_tokens
            .iter()
            .any(|n| n.starts_with(q) || edit_distance(q, n) <= max)
    })
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Concurrent ancillary requests per search.
    pub fan_out_width: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fan_out_width: DEFAULT_FAN_OUT_WIDTH,
        }
    }
}

pub struct SearchEngine<T> {
    api: Arc<ApiClient<T>>,
    mirror: Arc<Mirror>,
    config: SearchConfig,
}

impl<T: Transport> SearchEngine<T> {
    pub fn new(api: Arc<ApiClient<T>>, mirror: Arc<Mirror>, config: SearchConfig) -> Self {
        Self {
            api,
            mirror,
            config,
        }
    }

    pub fn api(&self) -> &ApiClient<T> {
        &self.api
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    pub async fn search(&self, request: &SearchRequest) -> SearchResultSet {
        let span = info_span!("search", mode = request.mode().as_str());
        async {
            let results = match request {
                SearchRequest::Id(id) => self.search_by_id(id).await,
                SearchRequest::Contact(name) => self.search_by_contact(name).await,
                SearchRequest::Organisation(name) => self.search_by_organisation(name).await,
            };
            debug!(matches = results.len(), "search finished");
            results
        }
        .instrument(span)
        .await
    }

    /// Look the literal ID up in all three remote collections at once.
    pub async fn search_by_id(&self, id: &str) -> SearchResultSet {
        let id = id.trim();
        let (organisation, project, event) = tokio::join!(
            self.lookup::<Organisation>(id),
            self.lookup::<Project>(id),
            self.lookup::<FundraisingEvent>(id),
        );
        SearchResultSet {
            organisations: organisation.into_iter().collect(),
            projects: project.into_iter().collect(),
            fundraising_events: self.attach_featured(event.into_iter().collect()).await,
        }
    }

    pub async fn search_by_contact(&self, query: &str) -> SearchResultSet {
        let query = normalize_name(query);
        if query.is_empty() {
            return SearchResultSet::empty();
        }
        let snapshot = self.mirror.snapshot();
        let events = matching_contacts(&query, &snapshot.fundraising_events);
        SearchResultSet {
            organisations: matching_contacts(&query, &snapshot.organisations),
            projects: matching_contacts(&query, &snapshot.projects),
            fundraising_events: self.attach_featured(events).await,
        }
    }

    /// Organisations whose name matches `query`, plus the projects they carry.
    pub async fn search_by_organisation(&self, query: &str) -> SearchResultSet {
        let matched: Vec<Organisation> = self
            .mirror
            .snapshot()
            .organisations
            .iter()
            .filter(|o| organisation_matches(query, &o.name))
            .cloned()
            .collect();
        debug!(organisations = matched.len(), "organisation names matched");

        let batches: Vec<Vec<Project>> = stream::iter(&matched)
            .map(|organisation| async move {
                match self.api.projects_for_organisation(organisation.id).await {
                    Ok(projects) => projects,
                    Err(err) => {
                        warn!(organisation = organisation.id, error = %err, "carrier projects fetch failed");
                        Vec::new()
                    }
                }
            })
            .buffered(self.config.fan_out_width.max(1))
            .collect()
            .await;

        let mut seen = HashSet::new();
        let projects = batches
            .into_iter()
            .flatten()
            .filter(|p| seen.insert(p.id))
            .collect();
        SearchResultSet {
            organisations: matched,
            projects,
            fundraising_events: Vec::new(),
        }
    }

    async fn lookup<E: Ingest + Entity>(&self, id: &str) -> Option<E> {
        match self.api.fetch_one::<E>(id).await {
            Ok(entity) => Some(entity),
            Err(err) if err.is_not_found() => {
                debug!(collection = %E::COLLECTION, id, "no entity with this id");
                None
            }
            Err(err) => {
                warn!(collection = %E::COLLECTION, id, error = %err, "id lookup failed");
                None
            }
        }
    }

    async fn attach_featured(
        &self,
        events: Vec<FundraisingEvent>,
    ) -> Vec<FundraisingEventWithProjects> {
        stream::iter(events)
            .map(|event| async move {
                let featured_projects = match self.api.featured_projects(event.id).await {
                    Ok(projects) => projects,
                    Err(err) => {
                        warn!(event = event.id, error = %err, "featured projects fetch failed");
                        Vec::new()
                    }
                };
                FundraisingEventWithProjects {
                    event,
                    featured_projects,
                }
            })
            .buffered(self.config.fan_out_width.max(1))
            .collect()
            .await
    }
}

fn matching_contacts<E: Entity>(query: &[String], entities: &[E]) -> Vec<E> {
    entities
        .iter()
        .filter(|e| {
            e.contact()
                .is_some_and(|c| tokens_match_contact(query, &normalize_name(&c.name)))
        })
        .cloned()
        .collect()
}

/// Last-request-wins wrapper around [`SearchEngine::search`].
///
/// Each submit takes a new generation; a search that completes after a newer
/// one was submitted yields `None`.
#[derive(Debug, Default)]
pub struct SearchSession {
    latest: AtomicU64,
}

impl SearchSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_generation(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    pub async fn submit<T: Transport>(
        &self,
        engine: &SearchEngine<T>,
        request: &SearchRequest,
    ) -> Option<SearchResultSet> {
        let generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let results = engine.search(request).await;
        if self.latest.load(Ordering::SeqCst) == generation {
            Some(results)
        } else {
            debug!(generation, "discarding superseded search");
            None
        }
    }
}
