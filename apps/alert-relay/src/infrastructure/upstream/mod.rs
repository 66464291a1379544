//! Upstream Alert Feed Adapter
//!
//! HTTP implementation of [`AlertSource`] for the Home Front Command feed.
//!
//! # Endpoints
//!
//! - Open alerts: `https://www.oref.org.il/WarningMessages/alert/alerts.json`
//! - History: `https://www.oref.org.il/WarningMessages/alert/History/AlertsHistory.json`
//!
//! The feed expects browser-like headers; requests without a referer are
//! frequently rejected.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, REFERER, USER_AGENT};

use crate::application::ports::{AlertSource, UpstreamError};
use crate::domain::alert::{HistoryRecord, PayloadError, RawAlert, parse_history, parse_snapshot};

/// Default open-alerts endpoint.
pub const DEFAULT_ALERTS_URL: &str = "https://www.oref.org.il/WarningMessages/alert/alerts.json";

/// Default history endpoint.
pub const DEFAULT_HISTORY_URL: &str =
    "https://www.oref.org.il/WarningMessages/alert/History/AlertsHistory.json";

const FEED_REFERER: &str = "https://www.oref.org.il/";
const FEED_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Connection settings for [`OrefClient`].
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Open-alerts endpoint.
    pub alerts_url: String,
    /// History endpoint.
    pub history_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            alerts_url: DEFAULT_ALERTS_URL.to_string(),
            history_url: DEFAULT_HISTORY_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Upstream feed client.
#[derive(Debug, Clone)]
pub struct OrefClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl OrefClient {
    /// Build a client.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError::Network` if the HTTP client cannot be built.
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static(FEED_REFERER));
        headers.insert(USER_AGENT, HeaderValue::from_static(FEED_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "X-Requested-With",
            HeaderValue::from_static("XMLHttpRequest"),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        Ok(Self { http, config })
    }

    async fn get_body(&self, url: &str) -> Result<Vec<u8>, UpstreamError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }
}

impl From<PayloadError> for UpstreamError {
    fn from(err: PayloadError) -> Self {
        Self::Malformed(err.to_string())
    }
}

#[async_trait]
impl AlertSource for OrefClient {
    async fn fetch_snapshot(&self) -> Result<Vec<RawAlert>, UpstreamError> {
        let body = self.get_body(&self.config.alerts_url).await?;
        Ok(parse_snapshot(&body)?)
    }

    async fn fetch_history(&self) -> Result<Vec<HistoryRecord>, UpstreamError> {
        let body = self.get_body(&self.config.history_url).await?;
        Ok(parse_history(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer) -> OrefClient {
        OrefClient::new(UpstreamConfig {
            alerts_url: format!("{}/alerts.json", server.uri()),
            history_url: format!("{}/history.json", server.uri()),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn snapshot_sends_feed_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alerts.json"))
            .and(header("referer", FEED_REFERER))
            .and(header("x-requested-with", "XMLHttpRequest"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "\u{feff}{\"id\":\"133\",\"cat\":\"1\",\"title\":\"ירי רקטות וטילים\",\"data\":[\"Ashkelon\"],\"desc\":\"Enter shelter\"}",
            ))
            .mount(&server)
            .await;

        let alerts = client_for(&server).fetch_snapshot().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, "133");
        assert_eq!(alerts[0].data, vec!["Ashkelon"]);
    }

    #[tokio::test]
    async fn empty_body_means_no_alerts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alerts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("\r\n"))
            .mount(&server)
            .await;

        assert!(client_for(&server).fetch_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_snapshot().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Status(503)));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alerts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>blocked</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_snapshot().await.unwrap_err();
        assert!(matches!(err, UpstreamError::Malformed(_)));
    }

    #[tokio::test]
    async fn history_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"alertDate":"2024-05-01 10:00:00","title":"ירי רקטות וטילים","data":"Sderot","category":1}]"#,
            ))
            .mount(&server)
            .await;

        let records = client_for(&server).fetch_history().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "Sderot");
    }
}
