use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::app::{PodsyncError, Result};
use crate::sync::{PullRequest, PullResponse, PushRequest, SyncChannel};

pub const USER_AGENT: &str = concat!("podsync/", env!("CARGO_PKG_VERSION"));

/// Sync channel speaking JSON over HTTP: `POST {base}/push` and
/// `POST {base}/pull`.
pub struct HttpSyncChannel {
    client: Client,
    base: Url,
}

impl HttpSyncChannel {
    pub fn new(base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .brotli(true)
            .user_agent(USER_AGENT)
            .build()?;
        Self::with_client(client, base)
    }

    pub fn with_client(client: Client, base: &str) -> Result<Self> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { client, base })
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<Option<R>> {
        let url = self.base.join(endpoint)?;
        let response = self.client.post(url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PodsyncError::Sync(format!(
                "{} returned {}: {}",
                endpoint,
                status,
                detail.trim()
            )));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait]
impl SyncChannel for HttpSyncChannel {
    async fn push(&self, request: &PushRequest) -> Result<()> {
        self.post::<_, serde_json::Value>("push", request).await?;
        Ok(())
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        self.post("pull", request)
            .await?
            .ok_or_else(|| PodsyncError::Sync("pull returned an empty body".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::PatchOp;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_pull_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync/pull"))
            .and(body_partial_json(json!({"clientId": "c1", "cookie": 4})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cookie": 5,
                "lastMutationId": 2,
                "patch": [{"op": "put", "key": "/volume", "value": 0.5}]
            })))
            .mount(&server)
            .await;

        let channel = HttpSyncChannel::new(&format!("{}/sync", server.uri())).unwrap();
        let response = channel
            .pull(&PullRequest {
                client_id: "c1".into(),
                cookie: Some(4),
            })
            .await
            .unwrap();

        assert_eq!(response.cookie, 5);
        assert_eq!(response.last_mutation_id, 2);
        assert_eq!(
            response.patch,
            vec![PatchOp::Put {
                key: "/volume".into(),
                value: json!(0.5)
            }]
        );
    }

    #[tokio::test]
    async fn test_push_error_status_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/push"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let channel = HttpSyncChannel::new(&server.uri()).unwrap();
        let err = channel
            .push(&PushRequest {
                client_id: "c1".into(),
                mutations: vec![],
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_push_accepts_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/push"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let channel = HttpSyncChannel::new(&server.uri()).unwrap();
        channel
            .push(&PushRequest {
                client_id: "c1".into(),
                mutations: vec![],
            })
            .await
            .unwrap();
    }
}
