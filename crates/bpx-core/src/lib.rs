//! Core domain model for the betterplace explorer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "bpx-core";

pub const PLATFORM_REL: &str = "platform";
pub const BACKOFFICE_USERS_URL: &str = "https://www.betterplace.org/de/backoffice/users";

/// The three mirrored remote collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Organisations,
    Projects,
    FundraisingEvents,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Organisations,
        Collection::Projects,
        Collection::FundraisingEvents,
    ];

    /// Store name and remote resource path segment.
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Organisations => "organisations",
            Collection::Projects => "projects",
            Collection::FundraisingEvents => "fundraising_events",
        }
    }

    /// Short label used in status messages.
    pub fn label(self) -> &'static str {
        match self {
            Collection::Organisations => "organisations",
            Collection::Projects => "projects",
            Collection::FundraisingEvents => "events",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: u64,
    pub name: String,
}

impl Contact {
    pub fn backoffice_url(&self) -> String {
        format!("{BACKOFFICE_USERS_URL}/{}", self.id)
    }
}

/// Relation name to hyperlink.
pub type Links = BTreeMap<String, String>;

/// Shared view over the three mirrored entity kinds.
pub trait Entity: Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> u64;
    fn display_name(&self) -> &str;
    fn contact(&self) -> Option<&Contact>;
    fn links(&self) -> &Links;

    fn platform_link(&self) -> Option<&str> {
        self.links().get(PLATFORM_REL).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organisation {
    pub id: u64,
    pub name: String,
    pub contact: Option<Contact>,
    #[serde(default)]
    pub links: Links,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub title: String,
    pub contact: Option<Contact>,
    /// Name of the carrying organisation.
    pub carrier: Option<String>,
    pub donated_amount_in_cents: u64,
    pub closed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub donations_prohibited: bool,
    pub incomplete_need_count: u32,
    #[serde(default)]
    pub links: Links,
    pub updated_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundraisingEvent {
    pub id: u64,
    pub title: String,
    pub contact: Option<Contact>,
    pub donated_amount_in_cents: u64,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub links: Links,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturedProject {
    pub id: u64,
    pub title: String,
}

impl Entity for Organisation {
    const COLLECTION: Collection = Collection::Organisations;

    fn id(&self) -> u64 {
        self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn contact(&self) -> Option<&Contact> {
        self.contact.as_ref()
    }

    fn links(&self) -> &Links {
        &self.links
    }
}

impl Entity for Project {
    const COLLECTION: Collection = Collection::Projects;

    fn id(&self) -> u64 {
        self.id
    }

    fn display_name(&self) -> &str {
        &self.title
    }

    fn contact(&self) -> Option<&Contact> {
        self.contact.as_ref()
    }

    fn links(&self) -> &Links {
        &self.links
    }
}

impl Entity for FundraisingEvent {
    const COLLECTION: Collection = Collection::FundraisingEvents;

    fn id(&self) -> u64 {
        self.id
    }

    fn display_name(&self) -> &str {
        &self.title
    }

    fn contact(&self) -> Option<&Contact> {
        self.contact.as_ref()
    }

    fn links(&self) -> &Links {
        &self.links
    }
}

/// A fundraising event with its featured projects attached at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundraisingEventWithProjects {
    #[serde(flatten)]
    pub event: FundraisingEvent,
    pub featured_projects: Vec<FeaturedProject>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultSet {
    pub organisations: Vec<Organisation>,
    pub projects: Vec<Project>,
    pub fundraising_events: Vec<FundraisingEventWithProjects>,
}

impl SearchResultSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.organisations.is_empty()
            && self.projects.is_empty()
            && self.fundraising_events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.organisations.len() + self.projects.len() + self.fundraising_events.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectBadge {
    DonationsBlocked,
    Closed(DateTime<Utc>),
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingStatus {
    IncompleteNeeds(u32),
    Financed(Option<DateTime<Utc>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBadge {
    Closed(DateTime<Utc>),
    Open,
}

impl Project {
    pub fn badge(&self) -> ProjectBadge {
        if self.donations_prohibited {
            ProjectBadge::DonationsBlocked
        } else if let Some(closed_at) = self.closed_at {
            ProjectBadge::Closed(closed_at)
        } else {
            ProjectBadge::Open
        }
    }

    pub fn funding_status(&self) -> FundingStatus {
        if self.incomplete_need_count > 0 {
            FundingStatus::IncompleteNeeds(self.incomplete_need_count)
        } else {
            FundingStatus::Financed(self.completed_at)
        }
    }
}

impl FundraisingEvent {
    pub fn badge(&self) -> EventBadge {
        match self.closed_at {
            Some(closed_at) => EventBadge::Closed(closed_at),
            None => EventBadge::Open,
        }
    }
}

impl fmt::Display for ProjectBadge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectBadge::DonationsBlocked => f.write_str("Donations Blocked"),
            ProjectBadge::Closed(at) => write!(f, "Closed: {}", format_date(at)),
            ProjectBadge::Open => f.write_str("Open"),
        }
    }
}

impl fmt::Display for EventBadge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventBadge::Closed(at) => write!(f, "Closed: {}", format_date(at)),
            EventBadge::Open => f.write_str("Open"),
        }
    }
}

/// German EUR formatting of a minor-unit amount, e.g. `1.234,56 €`.
pub fn format_currency(amount_in_cents: u64) -> String {
    let euros = (amount_in_cents / 100).to_string();
    let cents = amount_in_cents % 100;

    let mut grouped = String::with_capacity(euros.len() + euros.len() / 3);
    for (i, ch) in euros.chars().enumerate() {
        if i > 0 && (euros.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    format!("{grouped},{cents:02}\u{a0}€")
}

pub fn format_date(at: &DateTime<Utc>) -> String {
    at.format("%d.%m.%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn project() -> Project {
        Project {
            id: 52740,
            title: "Brunnen für Kenia".into(),
            contact: Some(Contact {
                id: 7,
                name: "Detlev Zander".into(),
            }),
            carrier: Some("CARE Deutschland e.V.".into()),
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

    #[test]
    fn currency_uses_german_grouping() {
        assert_eq!(format_currency(0), "0,00\u{a0}€");
        assert_eq!(format_currency(5), "0,05\u{a0}€");
        assert_eq!(format_currency(123_456), "1.234,56\u{a0}€");
        assert_eq!(format_currency(100_000_000), "1.000.000,00\u{a0}€");
    }

    #[test]
    fn dates_render_day_first() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 23, 0, 0).single().unwrap();
        assert_eq!(format_date(&at), "09.03.2024");
    }

    #[test]
    fn blocked_donations_outrank_closed() {
        let closed = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).single().unwrap();
        let mut p = project();
        assert_eq!(p.badge(), ProjectBadge::Open);

        p.closed_at = Some(closed);
        assert_eq!(p.badge(), ProjectBadge::Closed(closed));
        assert_eq!(p.badge().to_string(), "Closed: 02.01.2023");

        p.donations_prohibited = true;
        assert_eq!(p.badge(), ProjectBadge::DonationsBlocked);
    }

    #[test]
    fn open_needs_hide_financed_state() {
        let mut p = project();
        assert_eq!(p.funding_status(), FundingStatus::Financed(None));
        p.incomplete_need_count = 3;
        assert_eq!(p.funding_status(), FundingStatus::IncompleteNeeds(3));
    }

    #[test]
    fn platform_link_reads_links_map() {
        let mut p = project();
        assert_eq!(p.platform_link(), None);
        p.links.insert(
            PLATFORM_REL.into(),
            "https://www.betterplace.org/de/projects/52740".into(),
        );
        assert_eq!(
            p.platform_link(),
            Some("https://www.betterplace.org/de/projects/52740")
        );
        assert_eq!(
            p.contact.as_ref().map(Contact::backoffice_url).as_deref(),
            Some("https://www.betterplace.org/de/backoffice/users/7")
        );
    }

    #[test]
    fn event_with_projects_serializes_flat() {
        let event = FundraisingEventWithProjects {
            event: FundraisingEvent {
                id: 9,
                title: "Spendenlauf".into(),
                contact: None,
                donated_amount_in_cents: 1500,
                closed_at: None,
                links: Links::new(),
                created_at: None,
                updated_at: None,
            },
            featured_projects: vec![FeaturedProject {
                id: 1,
                title: "Schule".into(),
            }],
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["id"], 9);
        assert_eq!(value["featured_projects"][0]["title"], "Schule");
        assert_eq!(EventBadge::Open.to_string(), "Open");
    }
}
