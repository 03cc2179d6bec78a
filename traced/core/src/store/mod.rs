//! Persistence of runs and spans.
//!
//! [`TraceStore`] hides the backend. All backends share the same contract:
//! a batch of spans for one run is written atomically, a run never leaves a
//! terminal status once written, and spans read back in close order.

mod embedded;
pub mod flush;
mod mysql;
mod postgres;
pub mod retry;
mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use traced_proto::prelude::{Run, RunFilter, RunId, RunSummary, Span};

pub use embedded::SledStore;
pub use flush::{FlushControl, Flusher, PersistenceAlert};
pub use mysql::MySqlStore;
pub use postgres::PostgresStore;
pub use retry::with_retry;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("encoding error: {0}")]
    Codec(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("unsupported store url `{0}`")]
    UnsupportedUrl(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Backend(_))
    }
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Io(io) => StoreError::Unavailable(io.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Codec(e.to_string())
            }
            sqlx::Error::Configuration(_) => StoreError::UnsupportedUrl(e.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Sled,
    Postgres,
    MySql,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Sled => "sled",
            Engine::Postgres => "postgres",
            Engine::MySql => "mysql",
        }
    }
}

#[async_trait]
pub trait TraceStore: Send + Sync + std::fmt::Debug {
    fn engine(&self) -> Engine;

    /// Inserts or updates a run. A stored run with a terminal status is
    /// left untouched.
    async fn write_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Writes spans of `run_id` in one atomic batch. Spans already stored
    /// under the same id are kept as they are.
    async fn write_spans(&self, run_id: &RunId, spans: &[Span]) -> Result<(), StoreError>;

    async fn read_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError>;

    /// Spans of a run ordered by close sequence.
    async fn read_spans(&self, run_id: &RunId) -> Result<Vec<Span>, StoreError>;

    /// Runs matching `filter`, newest first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError>;

    /// Removes a run and its spans. Returns whether the run existed.
    async fn delete_run(&self, run_id: &RunId) -> Result<bool, StoreError>;
}

/// Where a store URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    Sled(String),
    Postgres(String),
    MySql(String),
}

impl StoreUrl {
    pub fn parse(url: &str) -> Result<Self, StoreError> {
        let url = url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(StoreUrl::Postgres(url.to_string()))
        } else if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            Ok(StoreUrl::MySql(url.replacen("mariadb://", "mysql://", 1)))
        } else if let Some(path) = url.strip_prefix("sled://") {
            if path.is_empty() {
                return Err(StoreError::UnsupportedUrl(url.to_string()));
            }
            Ok(StoreUrl::Sled(path.to_string()))
        } else if url.is_empty() || url.contains("://") {
            Err(StoreError::UnsupportedUrl(url.to_string()))
        } else {
            Ok(StoreUrl::Sled(url.to_string()))
        }
    }
}

/// Opens the backend named by `url`: `sled://<path>` or a bare path,
/// `postgres://...`, or `mysql://...`.
pub async fn open_store(url: &str) -> Result<Arc<dyn TraceStore>, StoreError> {
    let store: Arc<dyn TraceStore> = match StoreUrl::parse(url)? {
        StoreUrl::Sled(path) => Arc::new(SledStore::open(path)?),
        StoreUrl::Postgres(url) => Arc::new(PostgresStore::connect(&url).await?),
        StoreUrl::MySql(url) => Arc::new(MySqlStore::connect(&url).await?),
    };
    log::info!("opened {} trace store", store.engine().as_str());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_url_parsing() {
        assert_eq!(
            StoreUrl::parse("sled:///var/lib/traced").unwrap(),
            StoreUrl::Sled("/var/lib/traced".to_string())
        );
        assert_eq!(
            StoreUrl::parse("./traces").unwrap(),
            StoreUrl::Sled("./traces".to_string())
        );
        assert!(matches!(
            StoreUrl::parse("postgresql://u@localhost/t").unwrap(),
            StoreUrl::Postgres(_)
        ));
        assert_eq!(
            StoreUrl::parse("mariadb://u@db/t").unwrap(),
            StoreUrl::MySql("mysql://u@db/t".to_string())
        );
        assert!(StoreUrl::parse("redis://localhost").is_err());
        assert!(StoreUrl::parse("sled://").is_err());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(!StoreError::Codec("bad".into()).is_retryable());
        assert!(!StoreError::NotFound(RunId::new()).is_retryable());
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[tokio::test]
    async fn test_open_store_picks_sled_for_paths() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sled://{}", dir.path().join("db").display());
        let store = open_store(&url).await.unwrap();
        assert_eq!(store.engine(), Engine::Sled);
    }
}
