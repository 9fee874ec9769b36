//! # REST Client
//!
//! A thin asynchronous client for the Polygon REST API, built on `reqwest`
//! with `reqwest-middleware` retries (exponential backoff on transient
//! failures). Every request carries the `apiKey` query parameter and a
//! per-request timeout; non-2xx answers become [`RestError::Status`].

use std::fmt;
use std::time::{Duration, Instant};

use reqwest::Url;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Production REST endpoint.
pub const POLYGON_REST_URL: &str = "https://api.polygon.io";

/// Settings for [`MarketRestClient`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestConfig {
    /// Absolute base URL; endpoints are joined onto it.
    pub base_url: String,
    /// Credential sent as the `apiKey` query parameter.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout_ms: u64,
    /// Retries for transient failures (connect errors, 5xx, 429).
    pub max_retries: u32,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: POLYGON_REST_URL.to_string(),
            api_key: String::new(),
            timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

impl fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Errors from the REST layer.
#[derive(Debug, Error)]
pub enum RestError {
    /// No API key configured; nothing was sent.
    #[error("No API key configured")]
    MissingApiKey,

    /// The base URL or endpoint did not form a valid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Transport failure or timeout, after retries.
    #[error("Request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),

    /// The server answered outside 2xx.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Numeric status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The body was not the expected JSON.
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// A decoded 2xx response with transaction metadata.
#[derive(Debug, Clone)]
pub struct RestResponse<T> {
    /// The deserialized body.
    pub data: T,
    /// HTTP status code.
    pub status: u16,
    /// Wall time from send to decoded body.
    pub latency: Duration,
}

/// Polygon REST client with retry middleware.
pub struct MarketRestClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for MarketRestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketRestClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl MarketRestClient {
    /// Builds the client.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the HTTP client cannot be
    /// constructed.
    pub fn new(config: &RestConfig) -> Result<Self, RestError> {
        let base_url = Url::parse(&config.base_url)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(reqwest_middleware::Error::from)?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(config.max_retries);
        let inner = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    /// `GET {base_url}{endpoint}?{query}&apiKey=...`, decoded as JSON.
    ///
    /// # Errors
    /// [`RestError::MissingApiKey`] without sending anything when no key is
    /// configured; [`RestError::Status`] on non-2xx; [`RestError::Request`]
    /// on transport failure or timeout.
    pub async fn get_json<T>(&self, endpoint: &str, query: &[(String, String)]) -> Result<RestResponse<T>, RestError>
    where
        T: DeserializeOwned,
    {
        if self.api_key.is_empty() {
            log::warn!("No API key configured; skipping {}", endpoint);
            return Err(RestError::MissingApiKey);
        }

        let mut url = self.base_url.join(endpoint)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
            pairs.append_pair("apiKey", &self.api_key);
        }

        log::debug!("GET {}", endpoint);
        let started = Instant::now();
        let response = self.inner.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("GET {} -> {}", endpoint, status);
            return Err(RestError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let data = response
            .json::<T>()
            .await
            .map_err(|e| RestError::Decode(e.to_string()))?;
        let latency = started.elapsed();
        log::debug!("GET {} -> {} in {:?}", endpoint, status, latency);

        Ok(RestResponse {
            data,
            status: status.as_u16(),
            latency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::Value;

    fn client_for(server: &mockito::ServerGuard, api_key: &str) -> MarketRestClient {
        MarketRestClient::new(&RestConfig {
            base_url: server.url(),
            api_key: api_key.to_string(),
            timeout_ms: 2_000,
            max_retries: 0,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn appends_query_and_api_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v3/reference/tickers")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("search".into(), "apple inc".into()),
                Matcher::UrlEncoded("apiKey".into(), "KEY".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"results":[{"ticker":"AAPL"}],"count":1}"#)
            .create_async()
            .await;

        let client = client_for(&server, "KEY");
        let response: RestResponse<Value> = client
            .get_json(
                "/v3/reference/tickers",
                &[("search".to_string(), "apple inc".to_string())],
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.data["results"][0]["ticker"], "AAPL");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/marketstatus/now")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body("NOT_AUTHORIZED")
            .create_async()
            .await;

        let client = client_for(&server, "KEY");
        let err = client
            .get_json::<Value>("/v1/marketstatus/now", &[])
            .await
            .unwrap_err();
        match err {
            RestError::Status { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "NOT_AUTHORIZED");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_key_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = client_for(&server, "");
        let err = client
            .get_json::<Value>("/v1/marketstatus/now", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::MissingApiKey));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn invalid_json_is_a_decode_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/marketstatus/now")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let client = client_for(&server, "KEY");
        let err = client
            .get_json::<Value>("/v1/marketstatus/now", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::Decode(_)));
    }

    #[test]
    fn relative_base_url_is_rejected() {
        let config = RestConfig {
            base_url: "api.polygon.io".into(),
            ..Default::default()
        };
        assert!(matches!(
            MarketRestClient::new(&config),
            Err(RestError::InvalidUrl(_))
        ));
    }

    #[test]
    fn config_debug_hides_api_key() {
        let config = RestConfig {
            api_key: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
