//! Mirror synchronization: per-collection sync state machine, in-memory
//! snapshot and the observable status record.

use std::sync::Arc;

use bpx_api::{ApiClient, Ingest, Revalidation};
use bpx_core::{Collection, Entity, FundraisingEvent, Organisation, Project};
use bpx_storage::{CachedCollection, MirrorStore, Transport};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "bpx-sync";

pub const DEFAULT_FRESHNESS_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Ready,
    Failed,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Ready => "ready",
            SyncState::Failed => "failed",
        }
    }
}

/// `failed` beats `syncing` beats `ready`; anything else is `idle`.
pub fn aggregate(states: impl IntoIterator<Item = SyncState>) -> SyncState {
    let states: Vec<SyncState> = states.into_iter().collect();
    if states.contains(&SyncState::Failed) {
        SyncState::Failed
    } else if states.contains(&SyncState::Syncing) {
        SyncState::Syncing
    } else if states.iter().all(|s| *s == SyncState::Ready) {
        SyncState::Ready
    } else {
        SyncState::Idle
    }
}

/// One state per collection. Each sync task writes only its own key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusRecord {
    pub organisations: SyncState,
    pub projects: SyncState,
    pub fundraising_events: SyncState,
}

impl StatusRecord {
    pub fn get(&self, collection: Collection) -> SyncState {
        match collection {
            Collection::Organisations => self.organisations,
            Collection::Projects => self.projects,
            Collection::FundraisingEvents => self.fundraising_events,
        }
    }

    pub fn set(&mut self, collection: Collection, state: SyncState) {
        match collection {
            Collection::Organisations => self.organisations = state,
            Collection::Projects => self.projects = state,
            Collection::FundraisingEvents => self.fundraising_events = state,
        }
    }

    pub fn overall(&self) -> SyncState {
        aggregate(Collection::ALL.map(|c| self.get(c)))
    }

    /// Drives contact-search availability.
    pub fn contact_search(&self) -> SyncState {
        aggregate([self.projects, self.fundraising_events, self.organisations])
    }

    /// Drives organisation-search availability.
    pub fn organisation_search(&self) -> SyncState {
        self.organisations
    }

    /// Banner text for front-ends.
    pub fn message(&self) -> String {
        if self.overall() == SyncState::Failed {
            return "Failed to load local data. Some searches are disabled.".to_string();
        }
        let syncing: Vec<&str> = Collection::ALL
            .into_iter()
            .filter(|c| self.get(*c) == SyncState::Syncing)
            .map(Collection::label)
            .collect();
        if !syncing.is_empty() {
            return format!("Syncing {}...", syncing.join(", "));
        }
        if self.overall() == SyncState::Ready {
            return "Data is up-to-date.".to_string();
        }
        String::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub organisations: Arc<Vec<Organisation>>,
    pub projects: Arc<Vec<Project>>,
    pub fundraising_events: Arc<Vec<FundraisingEvent>>,
}

/// In-memory mirror shared between the sync tasks and searches.
#[derive(Debug)]
pub struct Mirror {
    organisations: watch::Sender<Arc<Vec<Organisation>>>,
    projects: watch::Sender<Arc<Vec<Project>>>,
    fundraising_events: watch::Sender<Arc<Vec<FundraisingEvent>>>,
    status: watch::Sender<StatusRecord>,
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new()
    }
}

impl Mirror {
    pub fn new() -> Self {
        Self {
            organisations: watch::channel(Arc::default()).0,
            projects: watch::channel(Arc::default()).0,
            fundraising_events: watch::channel(Arc::default()).0,
            status: watch::channel(StatusRecord::default()).0,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            organisations: self.organisations.borrow().clone(),
            projects: self.projects.borrow().clone(),
            fundraising_events: self.fundraising_events.borrow().clone(),
        }
    }

    pub fn data<E: Mirrored>(&self) -> Arc<Vec<E>> {
        E::slot(self).borrow().clone()
    }

    pub fn subscribe<E: Mirrored>(&self) -> watch::Receiver<Arc<Vec<E>>> {
        E::slot(self).subscribe()
    }

    /// Replace the in-memory collection wholesale.
    pub fn publish<E: Mirrored>(&self, data: Vec<E>) {
        E::slot(self).send_replace(Arc::new(data));
    }

    pub fn status(&self) -> StatusRecord {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusRecord> {
        self.status.subscribe()
    }

    pub fn set_state(&self, collection: Collection, state: SyncState) {
        self.status.send_if_modified(|record| {
            if record.get(collection) == state {
                return false;
            }
            record.set(collection, state);
            true
        });
    }
}

/// An entity kind that lives in the mirror.
pub trait Mirrored: Entity + Ingest + Serialize + DeserializeOwned {
    fn slot(mirror: &Mirror) -> &watch::Sender<Arc<Vec<Self>>>;
}

impl Mirrored for Organisation {
    fn slot(mirror: &Mirror) -> &watch::Sender<Arc<Vec<Self>>> {
        &mirror.organisations
    }
}

impl Mirrored for Project {
    fn slot(mirror: &Mirror) -> &watch::Sender<Arc<Vec<Self>>> {
        &mirror.projects
    }
}

impl Mirrored for FundraisingEvent {
    fn slot(mirror: &Mirror) -> &watch::Sender<Arc<Vec<Self>>> {
        &mirror.fundraising_events
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub freshness_window: chrono::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_window: chrono::Duration::hours(DEFAULT_FRESHNESS_WINDOW_HOURS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishSource {
    Cache,
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum NetworkOutcome {
    /// Cache was fresh; no request made.
    Skipped,
    Unchanged,
    Modified { items: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub collection: Collection,
    pub publications: Vec<PublishSource>,
    pub network: NetworkOutcome,
    pub state: SyncState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub organisations: CollectionReport,
    pub projects: CollectionReport,
    pub fundraising_events: CollectionReport,
}

impl SyncSummary {
    pub fn reports(&self) -> [&CollectionReport; 3] {
        [&self.organisations, &self.projects, &self.fundraising_events]
    }

    pub fn overall(&self) -> SyncState {
        aggregate(self.reports().map(|r| r.state))
    }
}

pub struct SyncOrchestrator<T> {
    api: Arc<ApiClient<T>>,
    store: Option<MirrorStore>,
    mirror: Arc<Mirror>,
    config: SyncConfig,
}

impl<T: Transport> SyncOrchestrator<T> {
    /// `store: None` means the mirror store could not be opened; every
    /// collection is then treated as uncached.
    pub fn new(
        api: Arc<ApiClient<T>>,
        store: Option<MirrorStore>,
        mirror: Arc<Mirror>,
        config: SyncConfig,
    ) -> Self {
        Self {
            api,
            store,
            mirror,
            config,
        }
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    /// Sync all three collections concurrently.
    pub async fn run(&self) -> SyncSummary {
        let span = info_span!("mirror_sync", store = self.store.is_some());
        async {
            let (organisations, projects, fundraising_events) = tokio::join!(
                self.sync_collection::<Organisation>(),
                self.sync_collection::<Project>(),
                self.sync_collection::<FundraisingEvent>(),
            );
            let summary = SyncSummary {
                organisations,
                projects,
                fundraising_events,
            };
            info!(overall = summary.overall().as_str(), "mirror sync finished");
            summary
        }
        .instrument(span)
        .await
    }

    pub async fn sync_collection<E: Mirrored>(&self) -> CollectionReport {
        let collection = E::COLLECTION;
        let mut publications = Vec::new();

        let (etag, stale) = match self.load::<E>().await {
            Some(cached) => {
                let stale = cached.is_stale(Utc::now(), self.config.freshness_window);
                debug!(%collection, items = cached.data.len(), stale, "serving cached collection");
                self.mirror.publish(cached.data);
                publications.push(PublishSource::Cache);
                self.mirror.set_state(collection, SyncState::Ready);
                (cached.etag, stale)
            }
            None => {
                self.mirror.set_state(collection, SyncState::Syncing);
                (None, true)
            }
        };

        if !stale {
            return CollectionReport {
                collection,
                publications,
                network: NetworkOutcome::Skipped,
                state: SyncState::Ready,
            };
        }

        self.mirror.set_state(collection, SyncState::Syncing);
        let (network, state) = match self.api.revalidate::<E>(etag.as_deref()).await {
            Ok(Revalidation::Unchanged { .. }) => {
                self.touch(collection).await;
                (NetworkOutcome::Unchanged, SyncState::Ready)
            }
            Ok(Revalidation::Modified { items, etag }) => {
                self.save(collection, &items, etag.as_deref()).await;
                let count = items.len();
                self.mirror.publish(items);
                publications.push(PublishSource::Network);
                (NetworkOutcome::Modified { items: count }, SyncState::Ready)
            }
            Err(err) => {
                warn!(%collection, error = %err, "collection sync failed");
                (
                    NetworkOutcome::Failed {
                        error: err.to_string(),
                    },
                    SyncState::Failed,
                )
            }
        };
        self.mirror.set_state(collection, state);

        CollectionReport {
            collection,
            publications,
            network,
            state,
        }
    }

    async fn load<E: Mirrored>(&self) -> Option<CachedCollection<E>> {
        let store = self.store.as_ref()?;
        match store.load(E::COLLECTION).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(collection = %E::COLLECTION, error = %err, "mirror store read failed");
                None
            }
        }
    }

    async fn save<E: Mirrored>(&self, collection: Collection, items: &[E], etag: Option<&str>) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(collection, items, etag).await {
            warn!(%collection, error = %err, "mirror store write failed");
        }
    }

    async fn touch(&self, collection: Collection) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.touch_timestamp(collection).await {
            warn!(%collection, error = %err, "mirror store timestamp update failed");
        }
    }
}
