//! HTTP Stream Transport
//!
//! Opens a long-lived `GET` against an event-stream endpoint and yields the
//! response body line by line.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};

use crate::application::ports::{LineStream, StreamTransport, TransportError};

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

/// Default connect timeout for stream requests.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line accepted from a stream, excluding the terminator.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// `reqwest`-backed [`StreamTransport`].
///
/// The client carries only a connect timeout; stalled streams are detected
/// by the caller's liveness watchdog.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    max_line_bytes: usize,
}

impl HttpTransport {
    /// Build a transport with the default connect timeout.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Open` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Open(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Limit the length of a single line. A longer line fails the stream.
    #[must_use]
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Box<dyn LineStream>, TransportError> {
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let body: ChunkStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec())),
        );
        Ok(Box::new(HttpLineStream::new(body, self.max_line_bytes)))
    }
}

/// Splits a chunked body into lines.
struct HttpLineStream {
    body: ChunkStream,
    buffer: Vec<u8>,
    max_line_bytes: usize,
    finished: bool,
}

impl HttpLineStream {
    fn new(body: ChunkStream, max_line_bytes: usize) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            max_line_bytes,
            finished: false,
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

#[async_trait]
impl LineStream for HttpLineStream {
    async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(line) = self.take_line() {
                return Some(Ok(line));
            }
            if self.buffer.len() > self.max_line_bytes {
                self.finished = true;
                self.buffer.clear();
                return Some(Err(TransportError::Read(format!(
                    "line exceeds {} bytes",
                    self.max_line_bytes
                ))));
            }
            if self.finished {
                if self.buffer.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut self.buffer);
                return Some(Ok(String::from_utf8_lossy(&rest).into_owned()));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    self.buffer.clear();
                    return Some(Err(TransportError::Read(e.to_string())));
                }
                None => self.finished = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn collect(mut stream: Box<dyn LineStream>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = stream.next_line().await {
            lines.push(line.unwrap());
        }
        lines
    }

    #[tokio::test]
    async fn yields_lines_and_sends_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/alerts-stream"))
            .and(header("x-api-key", "secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: keep-alive\r\n\r\n: comment\ndata: tail"),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new().unwrap();
        let stream = transport
            .open(
                &format!("{}/api/alerts-stream", server.uri()),
                &[("X-API-Key".to_string(), "secret".to_string())],
            )
            .await
            .unwrap();

        assert_eq!(
            collect(stream).await,
            vec!["data: keep-alive", "", ": comment", "data: tail"]
        );
    }

    #[tokio::test]
    async fn overlong_line_fails_the_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("data: ok\n{}", "x".repeat(100))),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new().unwrap().with_max_line_bytes(16);
        let mut stream = transport.open(&server.uri(), &[]).await.unwrap();

        assert_eq!(stream.next_line().await.unwrap().unwrap(), "data: ok");
        assert!(matches!(
            stream.next_line().await,
            Some(Err(TransportError::Read(_)))
        ));
        assert!(stream.next_line().await.is_none());
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = HttpTransport::new().unwrap();
        let result = transport.open(&server.uri(), &[]).await;
        assert!(matches!(result, Err(TransportError::Status(401))));
    }

    #[tokio::test]
    async fn unreachable_host_fails_to_open() {
        let transport = HttpTransport::new().unwrap();
        let result = transport.open("http://127.0.0.1:1/stream", &[]).await;
        assert!(matches!(result, Err(TransportError::Open(_))));
    }
}
