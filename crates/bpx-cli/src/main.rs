use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bpx_api::{ApiClient, ApiConfig, DEFAULT_BASE_URL};
use bpx_core::{
    format_currency, format_date, Collection, Entity, FundingStatus, FundraisingEvent,
    FundraisingEventWithProjects, Organisation, Project, SearchResultSet,
};
use bpx_search::{availability, SearchConfig, SearchEngine, SearchRequest};
use bpx_storage::{CachedCollection, HttpClientConfig, HttpFetcher, MirrorStore};
use bpx_sync::{Mirror, SyncConfig, SyncOrchestrator, SyncSummary};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bpx")]
#[command(about = "Mirror and search betterplace organisations, projects and events")]
struct Cli {
    /// Directory holding the local mirror.
    #[arg(long, global = true, default_value = ".bpx")]
    data_dir: PathBuf,

    #[arg(long, global = true, default_value = DEFAULT_BASE_URL)]
    api_base: String,

    /// Per-request timeout.
    #[arg(long, global = true, default_value_t = 60)]
    timeout_secs: u64,

    /// Tracing filter directive, e.g. `info` or `bpx_api=debug`.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring the local mirror up to date.
    Sync,
    /// Show what the local mirror holds, without touching the network.
    Status,
    Search(SearchArgs),
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct SearchArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    contact: Option<String>,
    #[arg(long = "org")]
    organisation: Option<String>,
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command.as_ref().unwrap_or(&Commands::Sync) {
        Commands::Sync => {
            let (summary, _) = sync(&cli).await?;
            print_summary(&summary, cli.json)?;
        }
        Commands::Status => {
            let store = MirrorStore::open(&cli.data_dir)
                .await
                .with_context(|| format!("opening mirror at {}", cli.data_dir.display()))?;
            print_store_status(&store, cli.json).await?;
        }
        Commands::Search(args) => {
            let Some(request) = SearchRequest::from_terms(
                args.id.as_deref(),
                args.contact.as_deref(),
                args.organisation.as_deref(),
            ) else {
                bail!("search term is empty");
            };
            let engine = if request.mode().uses_mirror() {
                sync(&cli).await?.1
            } else {
                SearchEngine::new(api_client(&cli)?, Arc::new(Mirror::new()), SearchConfig::default())
            };
            let gate = availability(request.mode(), &engine.mirror().status());
            if !gate.available {
                bail!(gate.reason.unwrap_or("search unavailable"));
            }
            let results = engine.search(&request).await;
            print_results(&results, cli.json)?;
        }
    }

    Ok(())
}

async fn open_store(dir: &Path) -> Option<MirrorStore> {
    match MirrorStore::open(dir).await {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(error = %err, "mirror store unavailable; fetching everything from the network");
            None
        }
    }
}

fn api_client(cli: &Cli) -> Result<Arc<ApiClient<HttpFetcher>>> {
    let timeout = Duration::from_secs(cli.timeout_secs);
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout,
        ..HttpClientConfig::default()
    })?;
    let api = ApiClient::new(
        fetcher,
        ApiConfig {
            base_url: cli.api_base.clone(),
            request_timeout: timeout,
            ..ApiConfig::default()
        },
    )
    .context("building API client")?;
    Ok(Arc::new(api))
}

async fn sync(cli: &Cli) -> Result<(SyncSummary, SearchEngine<HttpFetcher>)> {
    let api = api_client(cli)?;
    let mirror = Arc::new(Mirror::new());
    let store = open_store(&cli.data_dir).await;

    let orchestrator =
        SyncOrchestrator::new(api.clone(), store, mirror.clone(), SyncConfig::default());
    let summary = orchestrator.run().await;
    let engine = SearchEngine::new(api, mirror, SearchConfig::default());
    Ok((summary, engine))
}

fn print_summary(summary: &SyncSummary, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    for report in summary.reports() {
        println!(
            "{:<20} {:<8} network={:?}",
            report.collection.as_str(),
            report.state.as_str(),
            report.network
        );
    }
    Ok(())
}

async fn print_store_status(store: &MirrorStore, as_json: bool) -> Result<()> {
    let now = Utc::now();
    let window = SyncConfig::default().freshness_window;
    let mut rows = Vec::new();
    for collection in Collection::ALL {
        let row = match collection {
            Collection::Organisations => describe::<Organisation>(store, collection).await?,
            Collection::Projects => describe::<Project>(store, collection).await?,
            Collection::FundraisingEvents => describe::<FundraisingEvent>(store, collection).await?,
        };
        rows.push(match row {
            Some((items, timestamp, etag)) => json!({
                "collection": collection,
                "items": items,
                "timestamp": timestamp,
                "etag": etag,
                "stale": bpx_storage::is_stale(timestamp, now, window),
            }),
            None => json!({ "collection": collection, "items": null }),
        });
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in &rows {
        let name = row["collection"].as_str().unwrap_or_default();
        match row["items"].as_u64() {
            Some(items) => println!(
                "{name:<20} {items:>6} items  synced {}  {}",
                row["timestamp"].as_str().unwrap_or_default(),
                if row["stale"].as_bool().unwrap_or(true) { "stale" } else { "fresh" },
            ),
            None => println!("{name:<20} not cached"),
        }
    }
    Ok(())
}

async fn describe<E: DeserializeOwned>(
    store: &MirrorStore,
    collection: Collection,
) -> Result<Option<(usize, chrono::DateTime<Utc>, Option<String>)>> {
    let cached: Option<CachedCollection<E>> = store
        .load(collection)
        .await
        .with_context(|| format!("reading {collection}"))?;
    Ok(cached.map(|c| (c.data.len(), c.timestamp, c.etag)))
}

fn print_results(results: &SearchResultSet, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for organisation in &results.organisations {
        print_organisation(organisation);
    }
    for project in &results.projects {
        print_project(project);
    }
    for event in &results.fundraising_events {
        print_event(event);
    }
    Ok(())
}

fn print_common<E: Entity>(kind: &str, entity: &E) {
    println!("[{kind}] {} {}", entity.id(), entity.display_name());
    if let Some(contact) = entity.contact() {
        println!("  contact: {} <{}>", contact.name, contact.backoffice_url());
    }
    if let Some(link) = entity.platform_link() {
        println!("  {link}");
    }
}

fn print_organisation(organisation: &Organisation) {
    print_common("organisation", organisation);
    println!();
}

fn print_project(project: &Project) {
    print_common("project", project);
    if let Some(carrier) = &project.carrier {
        println!("  carrier: {carrier}");
    }
    let funding = match project.funding_status() {
        FundingStatus::IncompleteNeeds(n) => format!("{n} open needs"),
        FundingStatus::Financed(Some(at)) => format!("Financed: {}", format_date(&at)),
        FundingStatus::Financed(None) => "Financed".to_string(),
    };
    println!(
        "  {} | {} | raised {}",
        project.badge(),
        funding,
        format_currency(project.donated_amount_in_cents)
    );
    println!();
}

fn print_event(entry: &FundraisingEventWithProjects) {
    let event = &entry.event;
    print_common("event", event);
    println!(
        "  {} | raised {}",
        event.badge(),
        format_currency(event.donated_amount_in_cents)
    );
    for featured in &entry.featured_projects {
        println!("  - {} {}", featured.id, featured.title);
    }
    println!();
}
