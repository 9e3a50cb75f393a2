use crate::feed::parser::{parse_feed, ParseError, RssFeed};
use futures::StreamExt;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Sent on every feed request.
pub const USER_AGENT: &str = "gator";

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Default per-fetch budget covering both the request and the body read.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Stage of a fetch at which an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    Request,
    Read,
    Parse,
}

impl fmt::Display for FetchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchStage::Request => "request",
            FetchStage::Read => "read",
            FetchStage::Parse => "parse",
        })
    }
}

/// Errors that can occur while fetching a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Request(#[source] reqwest::Error),
    /// No response headers before the caller's timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Connection dropped while the body was streaming
    #[error("Failed to read response body: {0}")]
    Read(#[source] reqwest::Error),
    /// Body still streaming when the caller's timeout ran out
    #[error("Reading response body timed out after {0:?}")]
    ReadTimeout(Duration),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large (over 10MB)")]
    TooLarge,
    /// Body is not a well-formed RSS document
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

impl FetchError {
    pub fn stage(&self) -> FetchStage {
        match self {
            FetchError::Request(_) | FetchError::Timeout(_) => FetchStage::Request,
            FetchError::Read(_) | FetchError::ReadTimeout(_) | FetchError::TooLarge => {
                FetchStage::Read
            }
            FetchError::Parse(_) => FetchStage::Parse,
        }
    }
}

/// Build the HTTP client shared by every fetch.
///
/// No client-level timeout is set; each call to [`fetch_feed`] brings its own.
pub fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
}

/// Fetch and parse the RSS feed at `url`.
///
/// Issues a GET with `User-Agent: gator`, reads the whole body (capped at
/// 10MB) and parses it, unescaping HTML entities in titles and descriptions.
/// `timeout` is one budget for the request and the body read together; running
/// out before the headers arrive is a request error, afterwards a read error.
///
/// A non-2xx status is logged but not treated as an error: the body is still
/// parsed, and usually fails at the parse stage.
///
/// The call has no side effects beyond the request, so it is safe to retry.
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<RssFeed, FetchError> {
    let deadline = tokio::time::Instant::now() + timeout;

    let request = client
        .get(url)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .send();
    let response = tokio::time::timeout_at(deadline, request)
        .await
        .map_err(|_| FetchError::Timeout(timeout))?
        .map_err(FetchError::Request)?;

    let status = response.status();
    if !status.is_success() {
        tracing::warn!(feed = %url, status = %status, "Non-success status, parsing body anyway");
    }

    let bytes = tokio::time::timeout_at(deadline, read_limited_bytes(response, MAX_FEED_SIZE))
        .await
        .map_err(|_| FetchError::ReadTimeout(timeout))??;

    tracing::debug!(feed = %url, bytes = bytes.len(), "Downloaded feed");

    Ok(parse_feed(&bytes)?)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::TooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Read)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::TooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test &amp;amp; Co</title>
    <link>https://example.com/</link>
    <description>desc</description>
    <item><title>First</title><link>https://example.com/1</link></item>
    <item><title>Second</title><link>https://example.com/2</link></item>
</channel></rss>"#;

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = build_http_client().unwrap();
        let url = format!("{}/feed", mock_server.uri());
        let feed = fetch_feed(&client, &url, DEFAULT_FETCH_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(feed.title, "Test & Co");
        let titles: Vec<_> = feed.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["First", "Second"]);
    }

    #[tokio::test]
    async fn test_non_success_status_still_parsed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let client = build_http_client().unwrap();
        let feed = fetch_feed(&client, &mock_server.uri(), DEFAULT_FETCH_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(feed.items.len(), 2);
    }

    #[tokio::test]
    async fn test_error_page_is_parse_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("<html><body>oops</body></html>"))
            .mount(&mock_server)
            .await;

        let client = build_http_client().unwrap();
        let err = fetch_feed(&client, &mock_server.uri(), DEFAULT_FETCH_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), FetchStage::Parse);
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<rss><channel></rss>"))
            .mount(&mock_server)
            .await;

        let client = build_http_client().unwrap();
        let err = fetch_feed(&client, &mock_server.uri(), DEFAULT_FETCH_TIMEOUT)
            .await
            .unwrap_err();
        match err {
            FetchError::Parse(_) => {}
            e => panic!("Expected Parse error, got {:?}", e),
        }
    }

    /// A loopback URL whose port has nothing listening on it.
    fn closed_port_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}/feed", port)
    }

    #[tokio::test]
    async fn test_connection_refused_is_request_error() {
        let client = build_http_client().unwrap();
        let err = fetch_feed(&client, &closed_port_url(), DEFAULT_FETCH_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request(_)), "got {:?}", err);
        assert_eq!(err.stage(), FetchStage::Request);
        assert_eq!(err.stage().to_string(), "request");
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let client = build_http_client().unwrap();
        let err = fetch_feed(&client, &mock_server.uri(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)), "got {:?}", err);
        assert_eq!(err.stage(), FetchStage::Request);
    }

    #[tokio::test]
    async fn test_stalled_body_times_out_at_read_stage() {
        // Sends headers and part of the body, then goes quiet
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n<rss><channel>")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = build_http_client().unwrap();
        let url = format!("http://{}/feed", addr);
        let err = fetch_feed(&client, &url, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ReadTimeout(_)), "got {:?}", err);
        assert_eq!(err.stage(), FetchStage::Read);

        server.abort();
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b' '; MAX_FEED_SIZE + 1]))
            .mount(&mock_server)
            .await;

        let client = build_http_client().unwrap();
        let err = fetch_feed(&client, &mock_server.uri(), DEFAULT_FETCH_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge), "got {:?}", err);
        assert_eq!(err.stage(), FetchStage::Read);
    }
}
