//! Bugzilla REST client (`/rest/bug`) with bounded retry.

use std::time::Duration;

use async_trait::async_trait;
use ccb_core::{BugFlag, BugStub, ExternalBug, RawBug, SOURCE_TIMESTAMP_FORMAT};
use chrono::DateTime;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{BugQuery, BugSource, SourceError};

const API_KEY_HEADER: &str = "X-BUGZILLA-API-KEY";
const STUB_FIELDS: &str = "id,summary";
/// `external_bugs`, `flags` and the QA whiteboard custom field are outside
/// Bugzilla's default field set and must be asked for by name.
pub const DETAIL_FIELDS: &str = "_default,flags,external_bugs,cf_ibm_storage_qa_whiteboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Throttling (429), request timeouts and 5xx outages are retried.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Doubling delay before retry `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct BugzillaConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for BugzillaConfig {
    fn default() -> Self {
        Self {
            base_url: "https://bugzilla.redhat.com".to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct BugzillaClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    backoff: BackoffPolicy,
}

impl BugzillaClient {
    pub fn new(config: BugzillaConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        let base = config.base_url.trim_end_matches('/');
        let base_url = Url::parse(&format!("{base}/"))
            .map_err(|e| SourceError::InvalidQuery(format!("bugzilla url {base}: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.base_url
            .join(path)
            .map_err(|e| SourceError::InvalidQuery(format!("{path}: {e}")))
    }

    pub fn search_url(&self, query: &BugQuery) -> Result<Url, SourceError> {
        let mut url = self.endpoint("rest/bug")?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query
                .params()
                .iter()
                .filter(|(k, _)| k != "include_fields")
            {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("include_fields", STUB_FIELDS);
        }
        Ok(url)
    }

    pub fn detail_url(&self, id: i64) -> Result<Url, SourceError> {
        let mut url = self.endpoint(&format!("rest/bug/{id}"))?;
        url.query_pairs_mut()
            .append_pair("include_fields", DETAIL_FIELDS);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url.clone());
            if let Some(key) = &self.api_key {
                request = request.header(API_KEY_HEADER, key);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|e| SourceError::Decode {
                            url: url.to_string(),
                            message: e.to_string(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable bugzilla response");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable bugzilla transport error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(last_request_error.map(SourceError::Request).unwrap_or_else(|| {
            SourceError::Unavailable(format!("no response from {url}"))
        }))
    }
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct StubList {
    #[serde(default)]
    bugs: Vec<BugStub>,
}

#[async_trait]
impl BugSource for BugzillaClient {
    async fn check_connection(&self) -> Result<(), SourceError> {
        let url = self.endpoint("rest/version")?;
        let version: VersionResponse = self.get_json(url).await?;
        debug!(version = %version.version, "connected to bugzilla");
        Ok(())
    }

    async fn query(&self, query: &BugQuery) -> Result<Vec<BugStub>, SourceError> {
        let url = self.search_url(query)?;
        let span = info_span!("bugzilla_query", query = %query.name);
        let list: StubList = self.get_json(url).instrument(span).await?;
        Ok(list.bugs)
    }

    async fn fetch_bug(&self, id: i64) -> Result<RawBug, SourceError> {
        let url = self.detail_url(id)?;
        let span = info_span!("bugzilla_fetch", bug_id = id);
        let list: RestBugList = match self.get_json(url).instrument(span).await {
            Err(SourceError::HttpStatus { status: 404, .. }) => return Err(SourceError::NotFound(id)),
            other => other?,
        };
        list.bugs
            .into_iter()
            .find(|b| b.id == id)
            .map(RawBug::from)
            .ok_or(SourceError::NotFound(id))
    }
}

/// `GET /rest/bug` response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestBugList {
    #[serde(default)]
    pub bugs: Vec<RestBug>,
}

/// Single-valued fields the REST API may return as a one-element list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }

    fn into_text(self) -> String {
        self.into_vec().join(", ")
    }
}

/// Bug as returned by the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestBug {
    pub id: i64,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub component: OneOrMany,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub version: OneOrMany,
    #[serde(default)]
    pub target_release: OneOrMany,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub creation_time: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub qa_contact: Option<String>,
    #[serde(default)]
    pub cf_ibm_storage_qa_whiteboard: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub flags: Vec<BugFlag>,
    #[serde(default)]
    pub external_bugs: Vec<ExternalBug>,
}

/// REST timestamps are RFC 3339; anything else is passed through untouched
/// and left for the normalizer to reject.
fn source_timestamp(value: &str) -> String {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.naive_utc().format(SOURCE_TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|_| value.to_string())
}

impl From<RestBug> for RawBug {
    fn from(bug: RestBug) -> Self {
        RawBug {
            id: bug.id,
            product: bug.product.unwrap_or_default(),
            component: bug.component.into_text(),
            status: bug.status.unwrap_or_default(),
            resolution: bug.resolution.unwrap_or_default(),
            version: bug.version.into_text(),
            target_release: bug.target_release.into_vec(),
            summary: bug.summary.unwrap_or_default(),
            creation_time: source_timestamp(bug.creation_time.as_deref().unwrap_or_default()),
            severity: bug.severity.unwrap_or_default(),
            assigned_to: bug.assigned_to.unwrap_or_default(),
            qa_contact: bug.qa_contact.unwrap_or_default(),
            qa_whiteboard: bug.cf_ibm_storage_qa_whiteboard.unwrap_or_default(),
            creator: bug.creator.unwrap_or_default(),
            flags: bug.flags,
            external_bugs: bug.external_bugs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BugzillaClient {
        BugzillaClient::new(BugzillaConfig {
            base_url: "https://bugzilla.example.com/".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn default_backoff_doubles_up_to_eight_seconds() {
        let policy = BackoffPolicy::default();
        let delays = (0..6)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 8_000]);
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(8));
    }

    #[test]
    fn bugzilla_throttling_and_outages_are_retried() {
        for code in [429, 408, 502, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), RetryDisposition::Retryable, "{code}");
        }
        for code in [400, 401, 404] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable, "{code}");
        }
    }

    #[test]
    fn detail_url_requests_closed_loop_fields() {
        let url = client().detail_url(2245001).unwrap();
        assert_eq!(url.path(), "/rest/bug/2245001");
        let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![(
                "include_fields".to_string(),
                "_default,flags,external_bugs,cf_ibm_storage_qa_whiteboard".to_string()
            )]
        );
    }

    #[test]
    fn search_url_forces_stub_fields() {
        let client = client();
        let url = client.search_url(&BugQuery::customer_bugs_last_day()).unwrap();
        assert_eq!(url.host_str(), Some("bugzilla.example.com"));
        assert_eq!(url.path(), "/rest/bug");
        let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
        assert!(pairs.contains(&("v2".to_string(), "-1D".to_string())));
        assert!(pairs.contains(&("product".to_string(), "Red Hat Ceph Storage".to_string())));
        assert_eq!(
            pairs.iter().filter(|(k, _)| k == "include_fields").collect::<Vec<_>>(),
            vec![&("include_fields".to_string(), "id,summary".to_string())]
        );
    }

    #[test]
    fn rest_bug_flattens_list_fields_and_timestamps() {
        let json = r#"{
            "id": 2245001,
            "component": ["RADOS"],
            "version": ["7.0", "7.1"],
            "target_release": ["7.1z1"],
            "creation_time": "2024-02-01T09:30:05Z",
            "cf_ibm_storage_qa_whiteboard": null,
            "flags": [{"name": "qe_test_coverage", "status": "+", "setter": "qa@example.com", "id": 1}],
            "external_bugs": [{"type": {"description": "Red Hat Customer Portal", "id": 60}, "ext_description": "Acme"}]
        }"#;
        let raw = RawBug::from(serde_json::from_str::<RestBug>(json).unwrap());
        assert_eq!(raw.component, "RADOS");
        assert_eq!(raw.version, "7.0, 7.1");
        assert_eq!(raw.target_release, vec!["7.1z1".to_string()]);
        assert_eq!(raw.creation_time, "20240201T09:30:05");
        assert_eq!(raw.qa_whiteboard, "");
        assert_eq!(raw.flags[0].status, "+");
        assert_eq!(raw.external_bugs[0].ext_description.as_deref(), Some("Acme"));
    }

    #[test]
    fn legacy_timestamps_pass_through() {
        assert_eq!(source_timestamp("20240201T09:30:05"), "20240201T09:30:05");
        assert_eq!(source_timestamp(""), "");
    }

    mod http {
        use super::*;
        use ccb_core::normalize;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use tokio::task::JoinHandle;

        const BUG_100: &str = r#"{"bugs": [{
            "id": 100,
            "component": ["RGW"],
            "version": ["7.0"],
            "target_release": ["7.1"],
            "summary": "It's broken",
            "creation_time": "2024-02-01T09:30:05Z",
            "status": "NEW",
            "severity": "high",
            "flags": [{"name": "qe_test_coverage", "status": "+"}],
            "external_bugs": [
                {"type": {"description": "Red Hat Customer Portal"}, "ext_description": "cust A"},
                {"type": {"description": "Polarion Requirement"}, "ext_description": null}
            ]
        }]}"#;

        /// Serve one scripted `(status, body)` per connection and hand back
        /// the raw request heads in arrival order.
        async fn serve(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let handle = tokio::spawn(async move {
                let mut requests = Vec::new();
                for (status, body) in responses {
                    let (mut socket, _) = listener.accept().await.unwrap();
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut buf).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        head.extend_from_slice(&buf[..n]);
                    }
                    requests.push(String::from_utf8_lossy(&head).into_owned());
                    let reply = format!(
                        "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    socket.write_all(reply.as_bytes()).await.unwrap();
                    socket.shutdown().await.ok();
                }
                requests
            });
            (base, handle)
        }

        fn client_for(base: &str, max_retries: usize) -> BugzillaClient {
            BugzillaClient::new(BugzillaConfig {
                base_url: base.to_string(),
                api_key: Some("s3cret".into()),
                backoff: BackoffPolicy {
                    max_retries,
                    base_delay: Duration::ZERO,
                    max_delay: Duration::ZERO,
                },
                ..Default::default()
            })
            .unwrap()
        }

        #[tokio::test]
        async fn fetch_retries_throttling_then_reads_closed_loop_fields() {
            let (base, server) =
                serve(vec![(503, "{}"), (429, "{}"), (200, BUG_100)]).await;
            let raw = client_for(&base, 3).fetch_bug(100).await.unwrap();
            let requests = server.await.unwrap();

            assert_eq!(requests.len(), 3);
            for request in &requests {
                let request_line = request.lines().next().unwrap();
                assert!(request_line.starts_with("GET /rest/bug/100?include_fields="));
                assert!(request_line.contains(
                    "include_fields=_default%2Cflags%2Cexternal_bugs%2Ccf_ibm_storage_qa_whiteboard"
                ));
                assert!(request.to_ascii_lowercase().contains("x-bugzilla-api-key: s3cret"));
            }

            assert_eq!(raw.external_bugs.len(), 2);
            let row = normalize(&raw).unwrap();
            assert!(row.closed_loop);
            assert_eq!(row.customer_data, "cust A");
            assert_eq!(row.summary, "Its broken");
        }

        #[tokio::test]
        async fn fetch_gives_up_after_max_retries() {
            let (base, server) = serve(vec![(502, "{}"), (502, "{}"), (502, "{}")]).await;
            let err = client_for(&base, 2).fetch_bug(100).await.unwrap_err();
            assert!(matches!(err, SourceError::HttpStatus { status: 502, .. }));
            assert_eq!(server.await.unwrap().len(), 3);
        }

        #[tokio::test]
        async fn missing_bug_maps_to_not_found_without_retry() {
            let (base, server) = serve(vec![(404, r#"{"error": true}"#)]).await;
            let err = client_for(&base, 3).fetch_bug(7).await.unwrap_err();
            assert!(matches!(err, SourceError::NotFound(7)));
            assert_eq!(server.await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn query_and_connection_check_send_api_key() {
            let (base, server) = serve(vec![
                (200, r#"{"version": "5.0.4.rh100"}"#),
                (200, r#"{"bugs": [{"id": 100, "summary": "It's broken"}, {"id": 101}]}"#),
            ])
            .await;
            let client = client_for(&base, 0);
            client.check_connection().await.unwrap();
            let stubs = client
                .query(&BugQuery::customer_bugs_last_day())
                .await
                .unwrap();
            let requests = server.await.unwrap();

            assert_eq!(stubs.iter().map(|s| s.id).collect::<Vec<_>>(), vec![100, 101]);
            assert_eq!(stubs[1].summary, "");
            assert!(requests[0].starts_with("GET /rest/version "));
            assert!(requests[1].starts_with("GET /rest/bug?"));
            assert!(requests[1].contains("include_fields=id%2Csummary"));
            assert!(requests
                .iter()
                .all(|r| r.to_ascii_lowercase().contains("x-bugzilla-api-key: s3cret")));
        }
    }
}
