//! Sync pipeline orchestration: fetch every page, dedupe, normalize, upsert.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use devapps_core::{dedupe, normalize, DEFAULT_INFO_URL_BASE};
use devapps_source::{
    HttpPageSource, PageSource, Paginator, QueryWindow, DEFAULT_ENDPOINT, DEFAULT_WINDOW_DAYS,
};
use devapps_storage::{
    ApplicationStore, FetchError, HttpClientConfig, HttpFetcher, PersistError,
    DEFAULT_DATABASE_PATH,
};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "devapps-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub endpoint: String,
    pub info_url_base: String,
    pub window_days: i64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_concurrent_requests: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            info_url_base: DEFAULT_INFO_URL_BASE.to_string(),
            window_days: DEFAULT_WINDOW_DAYS,
            user_agent: "devapps-bot/0.1".to_string(),
            http_timeout_secs: 20,
            max_concurrent_requests: 4,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("DEVAPPS_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            endpoint: std::env::var("DEVAPPS_ENDPOINT").unwrap_or(defaults.endpoint),
            info_url_base: std::env::var("DEVAPPS_INFO_URL_BASE")
                .unwrap_or(defaults.info_url_base),
            window_days: env_parsed("DEVAPPS_WINDOW_DAYS").unwrap_or(defaults.window_days),
            user_agent: std::env::var("DEVAPPS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parsed("DEVAPPS_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            max_concurrent_requests: env_parsed("DEVAPPS_MAX_CONCURRENT_REQUESTS")
                .unwrap_or(defaults.max_concurrent_requests),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    FetchingPages,
    Deduplicating,
    Persisting,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Stages only move forward; any live stage may fail.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (NotStarted, FetchingPages)
            | (FetchingPages, Deduplicating)
            | (Deduplicating, Persisting)
            | (Persisting, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::NotStarted => "not_started",
            RunState::FetchingPages => "fetching_pages",
            RunState::Deduplicating => "deduplicating",
            RunState::Persisting => "persisting",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_date: NaiveDate,
    pub fetched: usize,
    pub deduplicated: usize,
    pub persisted: usize,
    pub state: RunState,
}

#[derive(Debug)]
pub struct PersistFailure {
    pub application_number: String,
    pub error: PersistError,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching applications: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] PersistError),
    #[error("{}", describe_failures(.persisted, .failures))]
    Persist {
        persisted: usize,
        failures: Vec<PersistFailure>,
    },
}

fn describe_failures(persisted: &usize, failures: &[PersistFailure]) -> String {
    match failures.first() {
        Some(first) => format!(
            "{} application(s) failed to save ({} saved); first: {}",
            failures.len(),
            persisted,
            first.error
        ),
        None => format!("no failures recorded ({persisted} saved)"),
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    run_id: Uuid,
    source: Arc<dyn PageSource>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let run_id = Uuid::new_v4();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            max_concurrent_requests: config.max_concurrent_requests,
        })?;
        let source = HttpPageSource::new(Arc::new(http), config.endpoint.clone(), run_id);
        Ok(Self {
            config,
            run_id,
            source: Arc::new(source),
        })
    }

    pub fn with_source(mut self, source: Arc<dyn PageSource>) -> Self {
        self.source = source;
        self
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        self.run_once_at(Local::now()).await
    }

    /// Run the whole pipeline as if started at `now`.
    ///
    /// The query window and the scrape date both derive from `now` and are
    /// fixed for the run.
    pub async fn run_once_at(&self, now: DateTime<Local>) -> Result<SyncRunSummary, SyncError> {
        let mut state = RunState::NotStarted;
        let result = self.run_stages(now, &mut state).await;
        match &result {
            Ok(_) => self.advance(&mut state, RunState::Done),
            Err(err) => {
                error!(run_id = %self.run_id, stage = %state, error = %err, "sync run failed");
                self.advance(&mut state, RunState::Failed);
            }
        }
        result.map(|summary| SyncRunSummary { state, ..summary })
    }

    async fn run_stages(
        &self,
        now: DateTime<Local>,
        state: &mut RunState,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_date = now.date_naive();

        let store = ApplicationStore::open(&self.config.database_path).await?;
        store.ensure_schema().await?;

        self.advance(state, RunState::FetchingPages);
        let window = QueryWindow::trailing(now.with_timezone(&Utc), self.config.window_days);
        let paginator = Paginator::new(self.source.clone(), window);
        let fetched = paginator.fetch_all().await?;

        self.advance(state, RunState::Deduplicating);
        let fetched_count = fetched.len();
        let records = dedupe(fetched);
        info!(
            run_id = %self.run_id,
            fetched = fetched_count,
            unique = records.len(),
            "deduplicated applications"
        );

        self.advance(state, RunState::Persisting);
        let info_url_base = self.config.info_url_base.as_str();
        let store_ref = &store;
        let outcomes = join_all(records.iter().map(|feature| async move {
            let app = normalize(feature, run_date, info_url_base);
            match store_ref.upsert(&app).await {
                Ok(()) => {
                    info!(
                        application = %app.application_number,
                        address = %app.address,
                        description = %app.description,
                        date_received = app.date_received.as_deref().unwrap_or_default(),
                        "saved application"
                    );
                    Ok(())
                }
                Err(err) => {
                    error!(
                        application = %app.application_number,
                        error = %err,
                        "failed to save application"
                    );
                    Err(PersistFailure {
                        application_number: app.application_number,
                        error: err,
                    })
                }
            }
        }))
        .await;
        store.close().await;

        let mut persisted = 0usize;
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(()) => persisted += 1,
                Err(failure) => failures.push(failure),
            }
        }
        if !failures.is_empty() {
            return Err(SyncError::Persist {
                persisted,
                failures,
            });
        }

        Ok(SyncRunSummary {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            run_date,
            fetched: fetched_count,
            deduplicated: records.len(),
            persisted,
            state: *state,
        })
    }

    fn advance(&self, state: &mut RunState, next: RunState) {
        debug_assert!(
            state.can_transition_to(next),
            "invalid run transition {state} -> {next}"
        );
        info!(run_id = %self.run_id, from = %state, to = %next, "run state");
        *state = next;
    }
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary, SyncError> {
    SyncPipeline::new(config)?.run_once().await
}

/// Create the database and its table without fetching anything.
pub async fn init_database(config: &SyncConfig) -> Result<(), SyncError> {
    let store = ApplicationStore::open(&config.database_path).await?;
    store.ensure_schema().await?;
    store.close().await;
    Ok(())
}
