use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions};
use sqlx::QueryBuilder;
use traced_proto::prelude::{Run, RunFilter, RunId, RunSummary, Span};

use super::sql::{finish_summaries, to_i64, RunRow, SpanRow, SummaryRow, MYSQL};
use super::{Engine, StoreError, TraceStore};

const MAX_CONNECTIONS: u32 = 8;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// MySQL (and MariaDB) backend. The pool is shared by every run; a connection is
/// held only for the duration of one statement or batch transaction.
#[derive(Debug, Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await?;
        let store = Self::from_pool(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        MySqlStore { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in MYSQL.schema {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TraceStore for MySqlStore {
    fn engine(&self) -> Engine {
        Engine::MySql
    }

    async fn write_run(&self, run: &Run) -> Result<(), StoreError> {
        let row = RunRow::from_run(run)?;
        sqlx::query(MYSQL.upsert_run)
            .bind(row.id)
            .bind(row.name)
            .bind(row.status)
            .bind(row.started_at)
            .bind(row.ended_at)
            .bind(row.metadata)
            .bind(row.version)
            .bind(row.tags)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_spans(&self, run_id: &RunId, spans: &[Span]) -> Result<(), StoreError> {
        if let Some(stray) = spans.iter().find(|s| &s.run_id != run_id) {
            return Err(StoreError::Invalid(format!(
                "span {} belongs to run {}, not {run_id}",
                stray.id, stray.run_id
            )));
        }
        let rows = spans
            .iter()
            .map(SpanRow::from_span)
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(MYSQL.insert_span)
                .bind(row.run_id)
                .bind(row.id)
                .bind(row.seq)
                .bind(row.parent_id)
                .bind(row.name)
                .bind(row.thread_id)
                .bind(row.started_at)
                .bind(row.ended_at)
                .bind(row.args_snapshot)
                .bind(row.result_snapshot)
                .bind(row.error)
                .bind(row.sampled)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn read_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        sqlx::query_as::<_, RunRow>(MYSQL.select_run)
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(RunRow::into_run)
            .transpose()
    }

    async fn read_spans(&self, run_id: &RunId) -> Result<Vec<Span>, StoreError> {
        sqlx::query_as::<_, SpanRow>(MYSQL.select_spans)
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SpanRow::into_span)
            .collect()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let mut qb = QueryBuilder::<MySql>::new(MYSQL.select_summaries);
        if let Some(name) = &filter.name {
            qb.push(" AND r.name = ").push_bind(name.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND r.status = ").push_bind(status.as_str());
        }
        if let Some(after) = filter.started_after {
            qb.push(" AND r.started_at >= ")
                .push_bind(to_i64(after.as_nanos(), "started_after")?);
        }
        if let Some(before) = filter.started_before {
            qb.push(" AND r.started_at <= ")
                .push_bind(to_i64(before.as_nanos(), "started_before")?);
        }
        qb.push(MYSQL.group_summaries);

        let rows: Vec<SummaryRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        finish_summaries(rows, filter)
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<bool, StoreError> {
        let id = run_id.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query(MYSQL.delete_spans)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query(MYSQL.delete_run)
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }
}
