//! Bug source contracts, the Bugzilla REST adapter and a fixture-backed source.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ccb_core::{BugStub, RawBug};
use reqwest::Url;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;

mod bugzilla;

pub use bugzilla::{
    classify_reqwest_error, classify_status, BackoffPolicy, BugzillaClient, BugzillaConfig,
    OneOrMany, RestBug, RestBugList, RetryDisposition, DETAIL_FIELDS,
};

pub const CRATE_NAME: &str = "ccb-adapters";

/// Customer-portal bugs of the product across every open and closed status.
pub const ALL_CUSTOMER_BUGS_URL: &str = "https://bugzilla.redhat.com/buglist.cgi?bug_status=NEW&bug_status=ASSIGNED&bug_status=POST&bug_status=MODIFIED&bug_status=ON_DEV&bug_status=ON_QA&bug_status=VERIFIED&bug_status=RELEASE_PENDING&bug_status=CLOSED&classification=Red%20Hat%20Storage&columnlist=opendate%2Cproduct%2Ccomponent%2Cassigned_to%2Cqa_contact&f1=external_bugzilla.description&list_id=13431733&o1=substring&order=qa_contact%2C%20&product=Red%20Hat%20Ceph%20Storage&query_format=advanced&v1=Red%20Hat%20Customer%20Portal";

/// Open customer-portal bugs of the product created within the last day.
pub const LAST_DAY_CUSTOMER_BUGS_URL: &str = "https://bugzilla.redhat.com/buglist.cgi?bug_status=__open__&classification=Red%20Hat%20Storage&columnlist=opendate%2Cproduct%2Ccomponent%2Cassigned_to%2Cqa_contact&f1=external_bugzilla.description&f2=creation_ts&list_id=13400065&o1=substring&o2=greaterthan&order=qa_contact%2C%20&product=Red%20Hat%20Ceph%20Storage&query_format=advanced&v1=Red%20Hat%20Customer%20Portal&v2=-1D";

pub const ALL_CUSTOMER_BUGS: &str = "all-customer-bugs";
pub const LAST_DAY_CUSTOMER_BUGS: &str = "last-day-customer-bugs";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("bug {0} does not exist or is not visible")]
    NotFound(i64),
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("invalid bug query: {0}")]
    InvalidQuery(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Search parameters in `buglist.cgi` form, tagged with a stable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugQuery {
    pub name: String,
    params: Vec<(String, String)>,
}

impl BugQuery {
    /// Translate a `buglist.cgi`/`query.cgi` URL into search parameters.
    ///
    /// Repeated keys are kept in order. A shared saved search
    /// (`namedcmd` + `sharer_id`) is reduced to `sharer_id` + `savedsearch`.
    pub fn from_buglist_url(name: impl Into<String>, url: &str) -> Result<Self, SourceError> {
        let parsed =
            Url::parse(url).map_err(|e| SourceError::InvalidQuery(format!("{url}: {e}")))?;
        let base = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default();
        if base != "buglist.cgi" && base != "query.cgi" {
            return Err(SourceError::InvalidQuery(format!(
                "{url}: expected a buglist.cgi or query.cgi URL"
            )));
        }

        let mut params = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect::<Vec<_>>();

        if base == "buglist.cgi" {
            let lookup = |key: &str| {
                params
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            };
            if let (Some(named), Some(sharer)) = (lookup("namedcmd"), lookup("sharer_id")) {
                params = vec![
                    ("sharer_id".to_string(), sharer),
                    ("savedsearch".to_string(), named),
                ];
            }
        }

        Ok(Self {
            name: name.into(),
            params,
        })
    }

    pub fn all_customer_bugs() -> Self {
        Self::from_buglist_url(ALL_CUSTOMER_BUGS, ALL_CUSTOMER_BUGS_URL)
            .expect("built-in backfill query URL is valid")
    }

    pub fn customer_bugs_last_day() -> Self {
        Self::from_buglist_url(LAST_DAY_CUSTOMER_BUGS, LAST_DAY_CUSTOMER_BUGS_URL)
            .expect("built-in incremental query URL is valid")
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn values(&self, key: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Read access to the remote bug tracker.
#[async_trait]
pub trait BugSource: Send + Sync {
    /// Verify the source is reachable before a sync phase starts.
    async fn check_connection(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn query(&self, query: &BugQuery) -> Result<Vec<BugStub>, SourceError>;

    async fn fetch_bug(&self, id: i64) -> Result<RawBug, SourceError>;
}

/// In-process source serving bugs from memory or a captured REST response.
///
/// Queries return every known bug unless a result was registered for the
/// query name with [`FixtureSource::with_query_result`].
#[derive(Debug, Default)]
pub struct FixtureSource {
    bugs: Mutex<BTreeMap<i64, RawBug>>,
    query_results: HashMap<String, Vec<i64>>,
    failing: HashSet<i64>,
    offline: bool,
    fetches: AtomicUsize,
}

impl FixtureSource {
    pub fn new(bugs: impl IntoIterator<Item = RawBug>) -> Self {
        Self {
            bugs: Mutex::new(bugs.into_iter().map(|b| (b.id, b)).collect()),
            ..Self::default()
        }
    }

    /// Load a captured `GET /rest/bug` response body (`{"bugs": [...]}`).
    pub fn from_rest_fixture(path: impl AsRef<Path>) -> Result<Self> {
        let list: RestBugList = read_json_file(path)?;
        Ok(Self::new(list.bugs.into_iter().map(RawBug::from)))
    }

    pub fn with_query_result(mut self, query_name: &str, ids: impl IntoIterator<Item = i64>) -> Self {
        self.query_results
            .insert(query_name.to_string(), ids.into_iter().collect());
        self
    }

    /// Make every fetch of `id` fail.
    pub fn with_fetch_failure(mut self, id: i64) -> Self {
        self.failing.insert(id);
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// Add or overwrite a bug, as if it changed upstream.
    pub async fn upsert_bug(&self, bug: RawBug) {
        self.bugs.lock().await.insert(bug.id, bug);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn ensure_online(&self) -> Result<(), SourceError> {
        if self.offline {
            return Err(SourceError::Unavailable("fixture source is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BugSource for FixtureSource {
    async fn check_connection(&self) -> Result<(), SourceError> {
        self.ensure_online()
    }

    async fn query(&self, query: &BugQuery) -> Result<Vec<BugStub>, SourceError> {
        self.ensure_online()?;
        let bugs = self.bugs.lock().await;
        let stubs = match self.query_results.get(&query.name) {
            Some(ids) => ids
                .iter()
                .map(|id| BugStub {
                    id: *id,
                    summary: bugs.get(id).map(|b| b.summary.clone()).unwrap_or_default(),
                })
                .collect(),
            None => bugs
                .values()
                .map(|b| BugStub {
                    id: b.id,
                    summary: b.summary.clone(),
                })
                .collect(),
        };
        Ok(stubs)
    }

    async fn fetch_bug(&self, id: i64) -> Result<RawBug, SourceError> {
        self.ensure_online()?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if self.failing.contains(&id) {
            return Err(SourceError::HttpStatus {
                status: 502,
                url: format!("fixture://bug/{id}"),
            });
        }
        self.bugs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(SourceError::NotFound(id))
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
