use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::de::DeserializeOwned;
use sha1::{Digest, Sha1};
use tracing::debug;
use url::Url;

use crate::app::{PodsyncError, Result};
use crate::directory::dto::{Envelope, EpisodesBody, FeedBody, FeedsBody};
use crate::directory::Directory;
use crate::domain::{ApiEpisode, ApiFeed};
use crate::queue::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.podcastindex.org/api/1.0/";
pub const USER_AGENT: &str = concat!("podsync/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_MAX_RESULTS: usize = 40;

pub const API_KEY_ENV: &str = "PODCAST_INDEX_API_KEY";
pub const API_SECRET_ENV: &str = "PODCAST_INDEX_API_SECRET";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let key = std::env::var(API_KEY_ENV).ok()?;
        let secret = std::env::var(API_SECRET_ENV).ok()?;
        Some(Self::new(key, secret))
    }

    /// Hex SHA-1 of key, secret and the request time in unix seconds.
    pub fn signature(&self, unix_time: i64) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.api_key.as_bytes());
        hasher.update(self.api_secret.as_bytes());
        hasher.update(unix_time.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn headers(&self, unix_time: i64) -> Result<HeaderMap> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| {
            PodsyncError::Config(format!("Invalid PodcastIndex credentials: {}", e))
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Auth-Date",
            HeaderValue::from_str(&unix_time.to_string()).map_err(invalid)?,
        );
        headers.insert(
            "X-Auth-Key",
            HeaderValue::from_str(&self.api_key).map_err(invalid)?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&self.signature(unix_time)).map_err(invalid)?,
        );
        Ok(headers)
    }
}

pub struct PodcastIndexClient {
    client: Client,
    base: Url,
    credentials: Credentials,
    retry: RetryPolicy,
    max_results: usize,
}

impl PodcastIndexClient {
    pub fn new(credentials: Credentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .gzip(true)
            .brotli(true)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base: Url::parse(DEFAULT_BASE_URL)?,
            credentials,
            retry: RetryPolicy::default(),
            max_results: DEFAULT_MAX_RESULTS,
        })
    }

    pub fn with_base_url(mut self, base: &str) -> Result<Self> {
        let mut url = Url::parse(base)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.base = url;
        Ok(self)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, String)]) -> Result<T> {
        self.retry
            .run(endpoint, || self.get_once(endpoint, query))
            .await
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.base.join(endpoint)?;
        let headers = self.credentials.headers(Utc::now().timestamp())?;
        debug!(endpoint, "Directory request");

        let response = self
            .client
            .get(url)
            .headers(headers)
            .query(query)
            .send()
            .await?
            .error_for_status()?;

        let envelope: Envelope<T> = response.json().await?;
        envelope.into_body()
    }
}

#[async_trait]
impl Directory for PodcastIndexClient {
    async fn search_by_term(&self, query: &str) -> Result<Vec<ApiFeed>> {
        let body: FeedsBody = self
            .get(
                "search/byterm",
                &[("q", query.to_string()), ("max", self.max_results.to_string())],
            )
            .await?;
        Ok(body.feeds.into_iter().map(ApiFeed::from).collect())
    }

    async fn trending(&self) -> Result<Vec<ApiFeed>> {
        let body: FeedsBody = self
            .get("podcasts/trending", &[("max", self.max_results.to_string())])
            .await?;
        Ok(body.feeds.into_iter().map(ApiFeed::from).collect())
    }

    async fn podcast_by_id(&self, feed_id: &str) -> Result<ApiFeed> {
        let body: FeedBody = self
            .get("podcasts/byfeedid", &[("id", feed_id.to_string())])
            .await?;
        Ok(body.feed.into())
    }

    async fn episodes_by_podcast_id(&self, feed_id: &str) -> Result<Vec<ApiEpisode>> {
        let body: EpisodesBody = self
            .get(
                "episodes/byfeedid",
                &[("id", feed_id.to_string()), ("max", self.max_results.to_string())],
            )
            .await?;
        Ok(body.items.into_iter().map(ApiEpisode::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials::new("UXKCGDSYGUUEVQJSYDZH", "secretsecret")
    }

    async fn client(server: &MockServer) -> PodcastIndexClient {
        PodcastIndexClient::new(credentials())
            .unwrap()
            .with_base_url(&server.uri())
            .unwrap()
            .with_retry(RetryPolicy {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(5),
                ..RetryPolicy::new(3)
            })
    }

    #[test]
    fn test_signature() {
        assert_eq!(
            credentials().signature(1_700_000_000),
            "67d45eb1f36cb53ce464f1738fdf9431af013f38"
        );
    }

    #[test]
    fn test_debug_hides_secret() {
        let rendered = format!("{:?}", credentials());
        assert!(!rendered.contains("secretsecret"));
    }

    #[tokio::test]
    async fn test_search_sends_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search/byterm"))
            .and(query_param("q", "syntax"))
            .and(header("X-Auth-Key", "UXKCGDSYGUUEVQJSYDZH"))
            .and(header_exists("X-Auth-Date"))
            .and(header_exists("Authorization"))
            .and(header("User-Agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "true",
                "feeds": [{"id": 920666, "title": "Syntax", "url": "https://feed.syntax.fm/rss"}],
                "count": 1
            })))
            .mount(&server)
            .await;

        let feeds = client(&server).await.search_by_term("syntax").await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].id, "920666");
    }

    #[tokio::test]
    async fn test_false_status_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/podcasts/byfeedid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "false",
                "description": "Feed not found"
            })))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server).await.podcast_by_id("1").await.unwrap_err();
        assert!(matches!(err, PodsyncError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/episodes/byfeedid"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .episodes_by_podcast_id("920666")
            .await
            .unwrap_err();
        assert!(matches!(err, PodsyncError::Http(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/podcasts/byfeedid"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).await.podcast_by_id("1").await.unwrap_err();
        assert!(matches!(err, PodsyncError::Http(ref e) if e.is_decode()));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/podcasts/trending"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/podcasts/trending"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": true,
                "feeds": []
            })))
            .mount(&server)
            .await;

        let feeds = client(&server).await.trending().await.unwrap();
        assert!(feeds.is_empty());
    }
}
