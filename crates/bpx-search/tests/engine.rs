use std::sync::Arc;
use std::time::Duration;

use bpx_api::{ApiClient, ApiConfig};
use bpx_core::{Contact, FundraisingEvent, Links, Organisation, Project};
use bpx_search::{SearchConfig, SearchEngine, SearchRequest, SearchSession};
use bpx_storage::fake::{page_body, Scripted, ScriptedTransport};
use bpx_sync::Mirror;
use serde_json::json;

fn engine() -> SearchEngine<ScriptedTransport> {
    let api = ApiClient::new(
        ScriptedTransport::new(),
        ApiConfig {
            base_url: "http://mirror.test/api/".into(),
            ..ApiConfig::default()
        },
    )
    .expect("client");
    SearchEngine::new(
        Arc::new(api),
        Arc::new(Mirror::new()),
        SearchConfig::default(),
    )
}

fn transport(engine: &SearchEngine<ScriptedTransport>) -> &ScriptedTransport {
    engine.api().transport()
}

fn contact(id: u64, name: &str) -> Option<Contact> {
    Some(Contact {
        id,
        name: name.into(),
    })
}

fn org(id: u64, name: &str, contact_name: Option<&str>) -> Organisation {
    Organisation {
        id,
        name: name.into(),
        contact: contact_name.and_then(|n| contact(id, n)),
        links: Links::new(),
    }
}

fn project(id: u64, title: &str, contact_name: &str) -> Project {
    Project {
        id,
        title: title.into(),
        contact: contact(id, contact_name),
        carrier: None,
        donated_amount_in_cents: 0,
        closed_at: None,
        completed_at: None,
        donations_prohibited: false,
        incomplete_need_count: 0,
        links: Links::new(),
        updated_at: None,
        activated_at: None,
    }
}

fn event(id: u64, title: &str, contact_name: &str) -> FundraisingEvent {
    FundraisingEvent {
        id,
        title: title.into(),
        contact: contact(id, contact_name),
        donated_amount_in_cents: 0,
        closed_at: None,
        links: Links::new(),
        created_at: None,
        updated_at: None,
    }
}

fn featured_route(event_id: u64) -> String {
    format!("/api/fundraising_events/{event_id}/featured_projects.json?per_page=100&page=1")
}

fn carrier_route(organisation_id: u64) -> String {
    format!("/api/organisations/{organisation_id}/projects.json?per_page=100&page=1")
}

fn project_json(id: u64) -> serde_json::Value {
    json!({"id": id, "title": format!("Projekt {id}")})
}

#[tokio::test]
async fn id_search_keeps_only_kinds_that_resolve() {
    let engine = engine();
    transport(&engine)
        .route(
            "/api/projects/52740.json",
            Scripted::json(&json!({"id": 52740, "title": "Brunnen", "donations_total_in_cents": 500})),
        )
        .route("/api/fundraising_events/52740.json", Scripted::Fail("reset".into()));

    let results = engine
        .search(&SearchRequest::Id(" 52740 ".into()))
        .await;

    assert!(results.organisations.is_empty());
    assert!(results.fundraising_events.is_empty());
    assert_eq!(results.projects.len(), 1);
    assert_eq!(results.projects[0].donated_amount_in_cents, 500);
    assert_eq!(transport(&engine).count("/api/organisations/52740.json"), 1);
}

#[tokio::test]
async fn id_search_attaches_featured_projects_to_found_event() {
    let engine = engine();
    transport(&engine)
        .route(
            "/api/fundraising_events/9.json",
            Scripted::json(&json!({"id": 9, "title": "Spendenlauf"})),
        )
        .route(
            &featured_route(9),
            Scripted::json(&page_body(vec![json!({"id": 1, "title": "Schule"})], 1, 1)),
        );

    let results = engine.search_by_id("9").await;

    assert_eq!(results.fundraising_events.len(), 1);
    let found = &results.fundraising_events[0];
    assert_eq!(found.event.title, "Spendenlauf");
    assert_eq!(found.featured_projects.len(), 1);
    assert_eq!(found.featured_projects[0].title, "Schule");
}

#[tokio::test(start_paused = true)]
async fn featured_projects_failure_yields_empty_list() {
    let engine = engine();
    transport(&engine)
        .route(
            "/api/fundraising_events/9.json",
            Scripted::json(&json!({"id": 9, "title": "Spendenlauf"})),
        )
        .route(&featured_route(9), Scripted::status(500));

    let results = engine.search_by_id("9").await;

    assert_eq!(results.fundraising_events.len(), 1);
    assert!(results.fundraising_events[0].featured_projects.is_empty());
}

#[tokio::test]
async fn contact_search_spans_all_snapshots() {
    let engine = engine();
    let mirror = engine.mirror();
    mirror.publish(vec![
        org(1, "CARE Deutschland", Some("Detlev Zander")),
        org(2, "Brot für die Welt", Some("Petra Zander")),
        org(3, "Ohne Kontakt", None),
    ]);
    mirror.publish(vec![
        project(10, "Brunnen", "Detlev Zander"),
        project(11, "Schule", "Hans Zanderson"),
    ]);
    mirror.publish(vec![event(20, "Spendenlauf", "detlev zander")]);
    transport(&engine).route(
        &featured_route(20),
        Scripted::json(&page_body(vec![json!({"id": 10, "title": "Brunnen"})], 1, 1)),
    );

    let results = engine
        .search(&SearchRequest::Contact("D. Zander".into()))
        .await;

    assert_eq!(
        results.organisations.iter().map(|o| o.id).collect::<Vec<_>>(),
        vec![1]
    );
    assert_eq!(
        results.projects.iter().map(|p| p.id).collect::<Vec<_>>(),
        vec![10]
    );
    assert_eq!(results.fundraising_events.len(), 1);
    assert_eq!(results.fundraising_events[0].featured_projects[0].id, 10);

    let by_surname = engine.search_by_contact("Zander").await;
    assert_eq!(by_surname.organisations.len(), 2);
    assert_eq!(by_surname.projects.len(), 1);
}

#[tokio::test]
async fn contact_search_with_blank_query_matches_nothing() {
    let engine = engine();
    engine
        .mirror()
        .publish(vec![org(1, "CARE", Some("Detlev Zander"))]);

    assert!(engine.search_by_contact(" . ").await.is_empty());
    assert!(transport(&engine).requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn organisation_search_dedups_carrier_projects_in_order() {
    let engine = engine();
    engine.mirror().publish(vec![
        org(1, "CARE Deutschland e.V.", None),
        org(2, "Brot für die Welt", None),
        org(3, "CARE International", None),
        org(4, "Care Austria", None),
    ]);
    transport(&engine)
        .route(
            &carrier_route(1),
            Scripted::json(&page_body(vec![project_json(10), project_json(11)], 1, 1)),
        )
        .route(
            &carrier_route(3),
            Scripted::json(&page_body(vec![project_json(11), project_json(12)], 1, 1)),
        )
        .route(&carrier_route(4), Scripted::Fail("refused".into()));

    let results = engine
        .search(&SearchRequest::Organisation("carr".into()))
        .await;

    assert_eq!(
        results.projects.iter().map(|p| p.id).collect::<Vec<_>>(),
        vec![10, 11, 12]
    );
    // Org 4 stays in the result although its carrier fetch fails.
    assert_eq!(
        results.organisations.iter().map(|o| o.id).collect::<Vec<_>>(),
        vec![1, 3, 4]
    );
    assert!(results.fundraising_events.is_empty());
    assert_eq!(transport(&engine).count(&carrier_route(2)), 0);
}

#[tokio::test]
async fn organisation_search_returns_matched_organisation_with_its_projects() {
    let engine = engine();
    engine
        .mirror()
        .publish(vec![org(1, "CARE Deutschland", None)]);
    transport(&engine).route(
        &carrier_route(1),
        Scripted::json(&page_body(vec![project_json(10)], 1, 1)),
    );

    let results = engine.search_by_organisation("CARE").await;

    assert_eq!(results.organisations.len(), 1);
    assert_eq!(results.organisations[0].name, "CARE Deutschland");
    assert_eq!(results.projects.len(), 1);
}

#[tokio::test]
async fn organisation_search_on_empty_snapshot_is_empty() {
    let engine = engine();
    let results = engine.search_by_organisation("CARE").await;
    assert!(results.is_empty());
    assert!(transport(&engine).requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn superseded_search_yields_nothing() {
    let engine = engine();
    transport(&engine)
        .route(
            "/api/projects/1.json",
            Scripted::json(&project_json(1)).delayed(Duration::from_secs(5)),
        )
        .route("/api/projects/2.json", Scripted::json(&project_json(2)));
    let session = SearchSession::new();

    let req1 = SearchRequest::Id("1".into());
    let req2 = SearchRequest::Id("2".into());
    let (first, second) = tokio::join!(
        session.submit(&engine, &req1),
        session.submit(&engine, &req2),
    );

    assert!(first.is_none());
    let second = second.expect("latest search wins");
    assert_eq!(second.projects[0].id, 2);
    assert_eq!(session.latest_generation(), 2);
}
