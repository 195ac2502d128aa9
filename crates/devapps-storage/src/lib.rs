//! Durable application store (SQLite) + HTTP transport utilities.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use devapps_core::DevelopmentApplication;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "devapps-storage";

pub const DEFAULT_DATABASE_PATH: &str = "data.sqlite";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("opening database {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("creating schema: {0}")]
    Schema(#[source] sqlx::Error),
    #[error("upserting application {council_reference}: {source}")]
    Upsert {
        council_reference: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("querying applications: {0}")]
    Query(#[source] sqlx::Error),
}

/// Table of development applications keyed by `council_reference`.
///
/// The pool holds a single connection, so concurrent upserts from many tasks
/// are serialized by the pool rather than by callers.
#[derive(Debug, Clone)]
pub struct ApplicationStore {
    pool: SqlitePool,
}

impl ApplicationStore {
    /// Open (creating if missing) the SQLite file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let store = Self::connect(options, &path.display().to_string()).await?;
        tracing::info!(path = %path.display(), "application store opened");
        Ok(store)
    }

    /// Ephemeral store, mostly for tests.
    pub async fn in_memory() -> Result<Self, PersistError> {
        let target = "sqlite::memory:";
        let options = SqliteConnectOptions::from_str(target).map_err(|source| {
            PersistError::Open {
                target: target.to_string(),
                source,
            }
        })?;
        Self::connect(options, target).await
    }

    async fn connect(options: SqliteConnectOptions, target: &str) -> Result<Self, PersistError> {
        // An in-memory database lives exactly as long as its one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| PersistError::Open {
                target: target.to_string(),
                source,
            })?;
        Ok(Self { pool })
    }

    /// Create the `data` table if absent. Safe to call on every run.
    pub async fn ensure_schema(&self) -> Result<(), PersistError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS [data] (
                [council_reference] TEXT PRIMARY KEY,
                [address] TEXT,
                [description] TEXT,
                [info_url] TEXT,
                [date_scraped] TEXT,
                [date_received] TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(PersistError::Schema)?;
        Ok(())
    }

    /// Insert or fully replace the row for `app.application_number`.
    pub async fn upsert(&self, app: &DevelopmentApplication) -> Result<(), PersistError> {
        sqlx::query(
            "INSERT OR REPLACE INTO [data] \
             (council_reference, address, description, info_url, date_scraped, date_received) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&app.application_number)
        .bind(&app.address)
        .bind(&app.description)
        .bind(&app.info_url)
        .bind(&app.date_scraped)
        .bind(app.date_received.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|source| PersistError::Upsert {
            council_reference: app.application_number.clone(),
            source,
        })?;
        Ok(())
    }

    pub async fn get(
        &self,
        council_reference: &str,
    ) -> Result<Option<DevelopmentApplication>, PersistError> {
        let row = sqlx::query(
            "SELECT council_reference, address, description, info_url, date_scraped, date_received \
             FROM [data] WHERE council_reference = ?",
        )
        .bind(council_reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(PersistError::Query)?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DevelopmentApplication {
            application_number: row.try_get("council_reference").map_err(PersistError::Query)?,
            address: row
                .try_get::<Option<String>, _>("address")
                .map_err(PersistError::Query)?
                .unwrap_or_default(),
            description: row
                .try_get::<Option<String>, _>("description")
                .map_err(PersistError::Query)?
                .unwrap_or_default(),
            info_url: row
                .try_get::<Option<String>, _>("info_url")
                .map_err(PersistError::Query)?
                .unwrap_or_default(),
            date_scraped: row
                .try_get::<Option<String>, _>("date_scraped")
                .map_err(PersistError::Query)?
                .unwrap_or_default(),
            date_received: row.try_get("date_received").map_err(PersistError::Query)?,
        }))
    }

    pub async fn count(&self) -> Result<i64, PersistError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM [data]")
            .fetch_one(&self.pool)
            .await
            .map_err(PersistError::Query)?;
        row.try_get("n").map_err(PersistError::Query)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrent_requests: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrent_requests: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Shared JSON-over-HTTP client with a cap on in-flight requests.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            limit: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
        })
    }

    /// POST `body` as JSON and decode a JSON response. Non-2xx is an error.
    pub async fn post_json<B, T>(&self, run_id: Uuid, url: &str, body: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let span = info_span!("http_fetch", %run_id, url);
        self.post_json_inner(url, body).instrument(span).await
    }

    async fn post_json_inner<B, T>(&self, url: &str, body: &B) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let _permit = self
            .limit
            .acquire()
            .await
            .expect("request limiter is never closed");

        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(status_error(status, final_url));
        }

        let bytes = resp.bytes().await?;
        debug!(bytes = bytes.len(), "response received");
        serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
            url: final_url,
            source,
        })
    }
}

fn status_error(status: StatusCode, url: String) -> FetchError {
    FetchError::HttpStatus {
        status: status.as_u16(),
        url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn application(number: &str, address: &str) -> DevelopmentApplication {
        DevelopmentApplication {
            application_number: number.to_string(),
            address: address.to_string(),
            description: "Material change of use".to_string(),
            info_url: format!("https://example.test/?n={number}"),
            date_scraped: "2026-03-07".to_string(),
            date_received: Some("2026-03-01".to_string()),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = ApplicationStore::in_memory().await.expect("store");
        store.ensure_schema().await.expect("schema");

        let app = application("A-100", "1 Ann St");
        store.upsert(&app).await.expect("upsert");

        let loaded = store.get("A-100").await.expect("get").expect("row present");
        assert_eq!(loaded, app);
        assert_eq!(store.get("missing").await.expect("get"), None);
    }

    #[tokio::test]
    async fn second_upsert_of_same_key_overwrites_row() {
        let store = ApplicationStore::in_memory().await.expect("store");
        store.ensure_schema().await.expect("schema");

        store.upsert(&application("A-100", "1 Ann St")).await.expect("first");
        let mut second = application("A-100", "2 Ann St");
        second.date_received = None;
        store.upsert(&second).await.expect("second");

        assert_eq!(store.count().await.expect("count"), 1);
        let loaded = store.get("A-100").await.expect("get").expect("row present");
        assert_eq!(loaded.address, "2 Ann St");
        assert_eq!(loaded.date_received, None);
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let store = ApplicationStore::in_memory().await.expect("store");
        store.ensure_schema().await.expect("first");
        store.ensure_schema().await.expect("second");
        assert_eq!(store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn concurrent_upserts_to_distinct_keys_all_land() {
        let store = ApplicationStore::in_memory().await.expect("store");
        store.ensure_schema().await.expect("schema");

        let apps: Vec<_> = (0..25)
            .map(|i| application(&format!("A-{i}"), &format!("{i} Queen St")))
            .collect();
        let results = futures::future::join_all(apps.iter().map(|app| store.upsert(app))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(store.count().await.expect("count"), 25);
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.sqlite");

        let store = ApplicationStore::open(&path).await.expect("open");
        store.ensure_schema().await.expect("schema");
        store.upsert(&application("A-7", "7 Eagle St")).await.expect("upsert");
        store.close().await;

        let reopened = ApplicationStore::open(&path).await.expect("reopen");
        reopened.ensure_schema().await.expect("schema");
        let loaded = reopened.get("A-7").await.expect("get").expect("row present");
        assert_eq!(loaded.address, "7 Eagle St");
    }

    #[tokio::test]
    async fn upsert_without_schema_reports_the_application() {
        let store = ApplicationStore::in_memory().await.expect("store");
        let err = store
            .upsert(&application("A-404", "404 Nowhere Rd"))
            .await
            .expect_err("no table yet");
        match err {
            PersistError::Upsert {
                council_reference, ..
            } => assert_eq!(council_reference, "A-404"),
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Answer one HTTP request with a fixed response; yields the raw request text.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let url = format!("http://{addr}/Geo/GetApplicationFilterResults");

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                    let length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });

        (url, handle)
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).expect("client")
    }

    #[tokio::test]
    async fn non_success_status_is_an_http_status_error() {
        let (url, server) = serve_once("502 Bad Gateway", r#"{"error":"upstream"}"#).await;
        let err = fetcher()
            .post_json::<_, serde_json::Value>(Uuid::new_v4(), &url, &serde_json::json!({}))
            .await
            .expect_err("502 must fail");
        server.await.expect("server");

        match err {
            FetchError::HttpStatus { status, url: failed } => {
                assert_eq!(status, 502);
                assert_eq!(failed, url);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn undecodable_body_is_a_decode_error() {
        let (url, server) = serve_once("200 OK", "not json").await;
        let err = fetcher()
            .post_json::<_, serde_json::Value>(Uuid::new_v4(), &url, &serde_json::json!({}))
            .await
            .expect_err("body is not JSON");
        server.await.expect("server");

        assert!(matches!(err, FetchError::Decode { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn posts_json_body_and_decodes_response() {
        #[derive(Debug, serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Page {
            total_features: u64,
            features: Vec<serde_json::Value>,
        }

        let (url, server) = serve_once(
            "200 OK",
            r#"{"totalFeatures":1,"features":[{"properties":{"application_number":"A-1"}}]}"#,
        )
        .await;
        let body = serde_json::json!({ "PagingStartIndex": 0, "MaxRecords": 200 });
        let page: Page = fetcher()
            .post_json(Uuid::new_v4(), &url, &body)
            .await
            .expect("decoded page");
        let request = server.await.expect("server");

        assert_eq!(page.total_features, 1);
        assert_eq!(page.features.len(), 1);
        assert!(request.starts_with("POST /Geo/GetApplicationFilterResults"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(request.contains(r#""PagingStartIndex":0"#));
    }

    #[test]
    fn default_http_config_bounds_concurrency() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert_eq!(config.max_concurrent_requests, 4);
        assert!(HttpFetcher::new(config).is_ok());
    }
}
