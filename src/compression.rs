//! # Remote Compression Module
//!
//! Client per il servizio di compressione lossy remoto (Tinify / TinyPNG).
//!
//! ## Responsabilità:
//! - Definisce il trait `ImageCompressor`, il punto di aggancio usato dal transcoder
//! - Implementa `TinifyClient` con `reqwest` (HTTP basic auth, upload + download)
//! - Mappa le risposte HTTP in `CompressionError` tipizzati
//! - Fornisce `validate()` per il controllo della chiave prima di iniziare il batch
//!
//! ## Flusso di una compressione:
//! 1. `POST /shrink` con i byte dell'immagine come body
//! 2. Risposta `201 Created` con header `Location` che punta al risultato
//! 3. `GET` sul `Location` (stessa auth) per scaricare i byte compressi
//!
//! ## Mapping errori:
//! - `401`, `429` → `Account` (chiave non valida o quota esaurita, fatale)
//! - altri `4xx` → `Client`
//! - `5xx` → `Server`
//! - errori di trasporto → `Connection`
//!
//! La chiave vive dentro il client: nessuna configurazione globale condivisa.
//! Un client per credenziale, condiviso fra i worker tramite `Arc`.

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Endpoint pubblico del servizio Tinify
pub const TINIFY_API_URL: &str = "https://api.tinify.com";

/// Compressioni gratuite al mese per account free
pub const FREE_MONTHLY_COMPRESSIONS: u64 = 500;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors reported by the remote compression service
#[derive(thiserror::Error, Debug)]
pub enum CompressionError {
    #[error("account error ({status}): {message}")]
    Account { status: u16, message: String },

    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl CompressionError {
    /// Build the error matching an unsuccessful HTTP status
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 429 => Self::Account { status, message },
            400..=499 => Self::Client { status, message },
            500..=599 => Self::Server { status, message },
            _ => Self::UnexpectedResponse(format!("status {}: {}", status, message)),
        }
    }
}

/// Compressions used this month, as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionUsage {
    pub used: u64,
    pub remaining: u64,
}

impl CompressionUsage {
    pub fn from_count(used: u64) -> Self {
        Self {
            used,
            remaining: FREE_MONTHLY_COMPRESSIONS.saturating_sub(used),
        }
    }
}

/// A remote lossy image compressor
#[async_trait]
pub trait ImageCompressor: Send + Sync {
    /// Name used in log messages
    fn name(&self) -> &str;

    /// Compress an already encoded JPEG/PNG and return the new bytes
    async fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Check the credential and report the current usage
    async fn validate(&self) -> Result<CompressionUsage, CompressionError>;
}

#[derive(Debug, Deserialize)]
struct TinifyErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Tinify HTTP API client
pub struct TinifyClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TinifyClient {
    /// Create a client bound to one API key
    pub fn new(api_key: impl Into<String>) -> Result<Self, CompressionError> {
        Self::with_base_url(api_key, TINIFY_API_URL)
    }

    /// Create a client against a custom endpoint (proxies, test servers)
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, CompressionError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("epub-image-optimizer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn shrink_url(&self) -> String {
        format!("{}/shrink", self.base_url)
    }

    async fn shrink(&self, data: &[u8]) -> Result<reqwest::Response, CompressionError> {
        let response = self
            .client
            .post(self.shrink_url())
            .basic_auth("api", Some(&self.api_key))
            .body(data.to_vec())
            .send()
            .await?;
        Ok(response)
    }

    /// Turn a non-success response into the matching error
    async fn error_from_response(response: reqwest::Response) -> CompressionError {
        let status = response.status().as_u16();
        let message = match response.json::<TinifyErrorBody>().await {
            Ok(body) if !body.message.is_empty() => format!("{} ({})", body.message, body.error),
            Ok(body) => body.error,
            Err(_) => String::from("no error details"),
        };
        CompressionError::from_status(status, message)
    }

    fn compression_count(response: &reqwest::Response) -> Option<u64> {
        response
            .headers()
            .get("Compression-Count")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }
}

#[async_trait]
impl ImageCompressor for TinifyClient {
    fn name(&self) -> &str {
        "tinify"
    }

    async fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let response = self.shrink(data).await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        if let Some(count) = Self::compression_count(&response) {
            debug!("Tinify compression count this month: {}", count);
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                CompressionError::UnexpectedResponse("missing Location header".to_string())
            })?;

        let output = self
            .client
            .get(&location)
            .basic_auth("api", Some(&self.api_key))
            .send()
            .await?;
        if !output.status().is_success() {
            return Err(Self::error_from_response(output).await);
        }

        Ok(output.bytes().await?.to_vec())
    }

    async fn validate(&self) -> Result<CompressionUsage, CompressionError> {
        // An empty upload is rejected with a client error once the key is accepted
        let response = self.shrink(&[]).await?;
        let count = Self::compression_count(&response).unwrap_or(0);
        let status = response.status();

        if status.is_success() || status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(CompressionUsage::from_count(count));
        }

        match Self::error_from_response(response).await {
            CompressionError::Client { .. } => Ok(CompressionUsage::from_count(count)),
            err => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// base64 of `api:secret`
    const BASIC_AUTH: &str = "authorization: basic yxbponnly3jlda==";

    fn http_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            status,
            body.len()
        );
        for (name, value) in headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");

        let mut response = head.into_bytes();
        response.extend_from_slice(body);
        response
    }

    /// Reads one request and returns its head, lowercased
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = stream.read(&mut chunk).await.unwrap();
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);

            if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&data[..end]).to_lowercase();
                let body_length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + body_length {
                    return head;
                }
            }
        }
        String::from_utf8_lossy(&data).to_lowercase()
    }

    /// Local HTTP server answering one connection per canned response
    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        (listener, base_url)
    }

    fn serve(listener: TcpListener, responses: Vec<Vec<u8>>) -> JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut stream).await);
                stream.write_all(&response).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            requests
        })
    }

    #[tokio::test]
    async fn test_compress_follows_location() {
        let (listener, base_url) = bind().await;
        let location = format!("{}/output/abc123", base_url);
        let server = serve(
            listener,
            vec![
                http_response(
                    "201 Created",
                    &[("Location", location.as_str()), ("Compression-Count", "7")],
                    br#"{"input":{"size":12},"output":{"size":4}}"#,
                ),
                http_response("200 OK", &[("Content-Type", "image/png")], b"tiny"),
            ],
        );

        let client = TinifyClient::with_base_url("secret", &base_url).unwrap();
        let compressed = client.compress(b"original png").await.unwrap();
        assert_eq!(compressed, b"tiny");

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].starts_with("post /shrink "));
        assert!(requests[0].contains(BASIC_AUTH));
        assert!(requests[1].starts_with("get /output/abc123 "));
        assert!(requests[1].contains(BASIC_AUTH));
    }

    #[tokio::test]
    async fn test_compress_without_location_is_unexpected() {
        let (listener, base_url) = bind().await;
        let server = serve(listener, vec![http_response("201 Created", &[], b"{}")]);

        let client = TinifyClient::with_base_url("secret", &base_url).unwrap();
        let err = client.compress(b"original png").await.unwrap_err();
        assert!(matches!(err, CompressionError::UnexpectedResponse(ref m) if m.contains("Location")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_compress_rejected_credentials() {
        let (listener, base_url) = bind().await;
        let server = serve(
            listener,
            vec![http_response(
                "401 Unauthorized",
                &[("Content-Type", "application/json")],
                br#"{"error":"Unauthorized","message":"Credentials are invalid."}"#,
            )],
        );

        let client = TinifyClient::with_base_url("secret", &base_url).unwrap();
        let err = client.compress(b"original png").await.unwrap_err();
        match err {
            CompressionError::Account { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("Credentials are invalid."));
            }
            other => panic!("expected account error, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_compress_quota_exhausted() {
        let (listener, base_url) = bind().await;
        let server = serve(
            listener,
            vec![http_response(
                "429 Too Many Requests",
                &[("Content-Type", "application/json")],
                br#"{"error":"TooManyRequests","message":"Your monthly limit has been exceeded"}"#,
            )],
        );

        let client = TinifyClient::with_base_url("secret", &base_url).unwrap();
        let err = client.compress(b"original png").await.unwrap_err();
        assert!(matches!(err, CompressionError::Account { status: 429, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_compress_server_error() {
        let (listener, base_url) = bind().await;
        let server = serve(listener, vec![http_response("503 Service Unavailable", &[], b"")]);

        let client = TinifyClient::with_base_url("secret", &base_url).unwrap();
        let err = client.compress(b"original png").await.unwrap_err();
        assert!(matches!(err, CompressionError::Server { status: 503, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_accepts_input_missing() {
        let (listener, base_url) = bind().await;
        let server = serve(
            listener,
            vec![http_response(
                "400 Bad Request",
                &[("Content-Type", "application/json"), ("Compression-Count", "42")],
                br#"{"error":"InputMissing","message":"Input file is empty"}"#,
            )],
        );

        let client = TinifyClient::with_base_url("secret", &base_url).unwrap();
        let usage = client.validate().await.unwrap();
        assert_eq!(usage, CompressionUsage { used: 42, remaining: 458 });

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("post /shrink "));
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_key() {
        let (listener, base_url) = bind().await;
        let server = serve(
            listener,
            vec![http_response(
                "401 Unauthorized",
                &[("Content-Type", "application/json")],
                br#"{"error":"Unauthorized","message":"Credentials are invalid."}"#,
            )],
        );

        let client = TinifyClient::with_base_url("wrong", &base_url).unwrap();
        let err = client.validate().await.unwrap_err();
        assert!(matches!(err, CompressionError::Account { status: 401, .. }));
        server.await.unwrap();
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            CompressionError::from_status(401, "Unauthorized".into()),
            CompressionError::Account { status: 401, .. }
        ));
        assert!(matches!(
            CompressionError::from_status(429, "TooManyRequests".into()),
            CompressionError::Account { status: 429, .. }
        ));
        assert!(matches!(
            CompressionError::from_status(415, "Unsupported media type".into()),
            CompressionError::Client { status: 415, .. }
        ));
        assert!(matches!(
            CompressionError::from_status(503, "Unavailable".into()),
            CompressionError::Server { status: 503, .. }
        ));
        assert!(matches!(
            CompressionError::from_status(302, "Found".into()),
            CompressionError::UnexpectedResponse(_)
        ));
    }

    #[test]
    fn test_usage_remaining_never_underflows() {
        assert_eq!(
            CompressionUsage::from_count(120),
            CompressionUsage { used: 120, remaining: 380 }
        );
        assert_eq!(CompressionUsage::from_count(800).remaining, 0);
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = TinifyClient::with_base_url("key", "http://localhost:8080/").unwrap();
        assert_eq!(client.shrink_url(), "http://localhost:8080/shrink");
        assert_eq!(client.name(), "tinify");
    }
}
