//! Scripted in-memory [`Transport`] for tests.
//!
//! Routes are keyed by path and query (`/api/projects.json?per_page=100&page=1`).
//! Each route holds a queue of responses; the last queued response is sticky so
//! a single entry answers every request. Unknown routes answer 404.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use url::Url;

use crate::{FetchError, FetchedResponse, Transport};

#[derive(Debug, Clone)]
pub enum Scripted {
    Respond {
        status: u16,
        etag: Option<String>,
        body: Vec<u8>,
        delay: Option<Duration>,
    },
    Fail(String),
    Timeout,
    /// Never completes.
    Hang,
}

impl Scripted {
    pub fn json(value: &Value) -> Self {
        Self::Respond {
            status: 200,
            etag: None,
            body: value.to_string().into_bytes(),
            delay: None,
        }
    }

    pub fn raw(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            etag: None,
            body: body.as_bytes().to_vec(),
            delay: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::raw(status, "")
    }

    pub fn not_modified() -> Self {
        Self::status(304)
    }

    pub fn with_etag(self, tag: &str) -> Self {
        match self {
            Self::Respond {
                status,
                body,
                delay,
                ..
            } => Self::Respond {
                status,
                etag: Some(tag.to_string()),
                body,
                delay,
            },
            other => other,
        }
    }

    pub fn delayed(self, by: Duration) -> Self {
        match self {
            Self::Respond {
                status, etag, body, ..
            } => Self::Respond {
                status,
                etag,
                body,
                delay: Some(by),
            },
            other => other,
        }
    }
}

/// A paginated list body as the remote API shapes it.
pub fn page_body(items: Vec<Value>, page: u32, total_pages: u32) -> Value {
    let per_page = items.len();
    json!({
        "data": items,
        "page": page,
        "per_page": per_page,
        "total_pages": total_pages,
        "total_entries": per_page as u32 * total_pages,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub path_and_query: String,
    pub if_none_match: Option<String>,
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, path_and_query: &str, response: Scripted) -> &Self {
        self.routes
            .lock()
            .expect("routes lock")
            .entry(path_and_query.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn count(&self, path_and_query: &str) -> usize {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|r| r.path_and_query == path_and_query)
            .count()
    }

    fn next(&self, key: &str) -> Option<Scripted> {
        let mut routes = self.routes.lock().expect("routes lock");
        let queue = routes.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(
        &self,
        url: &Url,
        if_none_match: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let key = path_and_query(url);
        self.requests
            .lock()
            .expect("requests lock")
            .push(RecordedRequest {
                path_and_query: key.clone(),
                if_none_match: if_none_match.map(str::to_owned),
            });

        match self.next(&key).unwrap_or_else(|| Scripted::status(404)) {
            Scripted::Respond {
                status,
                etag,
                body,
                delay,
            } => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(FetchedResponse {
                    status: StatusCode::from_u16(status)
                        .map_err(|e| FetchError::Connection(e.to_string()))?,
                    final_url: url.to_string(),
                    etag,
                    body,
                })
            }
            Scripted::Fail(message) => Err(FetchError::Connection(message)),
            Scripted::Timeout => Err(FetchError::Timeout {
                url: url.to_string(),
            }),
            Scripted::Hang => std::future::pending().await,
        }
    }
}
