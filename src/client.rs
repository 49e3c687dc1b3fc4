use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::api::{SetWebhookRequest, SetWebhookResponse};
use crate::config::{mask_token, HttpClientConfig};

const MEDIA_TYPE_JSON: &str = "application/json";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("got {content_type:?} response (status {status}), expected application/json")]
    ContentType {
        status: StatusCode,
        content_type: String,
    },
    #[error("failed to decode response body: {0}")]
    Decode(#[source] serde_json::Error),
}

/// HTTP client for the Bot API.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    api_base: String,
}

impl Client {
    pub fn new(api_base: &str, config: &HttpClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout())
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, token: &str, path: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, token, path)
    }

    /// Issue a single request to `{api_base}/bot{token}/{path}` and decode the
    /// JSON response. The body is skipped entirely when `request` is `None`.
    ///
    /// Responses that do not declare `application/json` are rejected with
    /// [`ClientError::ContentType`] without reading the body.
    pub async fn call<Req, Resp>(
        &self,
        method: Method,
        token: &str,
        path: &str,
        request: Option<&Req>,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut builder = self
            .http
            .request(method.clone(), self.url(token, path))
            .header(CONTENT_TYPE, MEDIA_TYPE_JSON);

        if let Some(request) = request {
            let body = serde_json::to_vec(request).map_err(ClientError::Encode)?;
            builder = builder.body(body);
        }

        debug!(
            "Calling {} {}/bot{}/{}",
            method,
            self.api_base,
            mask_token(token),
            path
        );

        let response = builder.send().await?;
        let status = response.status();

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.starts_with(MEDIA_TYPE_JSON) {
            return Err(ClientError::ContentType {
                status,
                content_type,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(ClientError::Decode)
    }
}

/// The remote operations the listener depends on.
#[async_trait]
pub trait WebhookApi: Send + Sync {
    async fn set_webhook(
        &self,
        token: &str,
        request: &SetWebhookRequest,
    ) -> Result<SetWebhookResponse, ClientError>;
}

#[async_trait]
impl WebhookApi for Client {
    async fn set_webhook(
        &self,
        token: &str,
        request: &SetWebhookRequest,
    ) -> Result<SetWebhookResponse, ClientError> {
        self.call(Method::POST, token, "setWebhook", Some(request))
            .await
    }
}
