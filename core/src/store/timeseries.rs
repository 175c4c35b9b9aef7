//! Time-series gateway (C10): fans analytical queries out against QuestDB
//! over the Postgres wire protocol, runs startup maintenance, and purges
//! orphaned job tables.
//!
//! Queries are issued with `sqlx::query`/`query_as` runtime binding rather
//! than the `query!`/`query_as!` compile-time macros used elsewhere in this
//! workspace's Postgres repositories: those macros need `cargo sqlx
//! prepare` against a live schema, which QuestDB (a time-series engine that
//! only speaks the Postgres wire protocol, not a real Postgres server)
//! cannot offer the same way.

use crate::config::TimeSeriesConfig;
use crate::error::ControllerResult;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct TimeSeriesGateway {
    pool: PgPool,
    query_semaphore: Arc<Semaphore>,
    purge_limit: usize,
    purging: AtomicBool,
}

impl TimeSeriesGateway {
    pub async fn connect(config: &TimeSeriesConfig) -> ControllerResult<Self> {
        let pool = PgPool::connect(&config.connection_url).await?;
        Ok(Self {
            pool,
            query_semaphore: Arc::new(Semaphore::new(config.concurrent_query_limit)),
            purge_limit: config.concurrent_table_purge_limit,
            purging: AtomicBool::new(false),
        })
    }

    /// Executes one query; a connection or programming error is logged and
    /// returned as an empty row set rather than propagated, so cache-style
    /// callers tolerate missing data instead of failing.
    pub async fn execute_query(&self, sql: &str) -> Vec<PgRow> {
        let _permit = self.query_semaphore.acquire().await;
        match sqlx::query(sql).fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(%sql, error = %err, "time-series query failed, returning empty result");
                Vec::new()
            }
        }
    }

    /// Fans a batch of queries out under the configured concurrency limit,
    /// returning results positionally.
    pub async fn execute_queries(&self, sqls: &[String]) -> Vec<Vec<PgRow>> {
        let futures = sqls.iter().map(|sql| self.execute_query(sql));
        futures::future::join_all(futures).await
    }

    /// Run once on startup: adds missing indexes on symbol columns
    /// (`jobId`, `node`, `level`) and resumes any suspended write-ahead log.
    pub async fn maintenance(&self, tables: &[String]) -> ControllerResult<()> {
        for table in tables {
            let columns = self.symbol_columns(table).await;
            for column in ["jobId", "node", "level"] {
                if columns.contains(column) && !self.has_index(table, column).await {
                    let sql = format!("ALTER TABLE {table} ADD INDEX ({column})");
                    if let Err(err) = sqlx::query(&sql).execute(&self.pool).await {
                        tracing::warn!(%table, %column, error = %err, "failed to add index");
                    }
                }
            }
        }

        let suspended = sqlx::query("SELECT name FROM wal_tables WHERE suspended = true")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();

        for row in suspended {
            if let Ok(name) = row.try_get::<String, _>("name") {
                let sql = format!("ALTER TABLE {name} RESUME WAL");
                if let Err(err) = sqlx::query(&sql).execute(&self.pool).await {
                    tracing::warn!(table = %name, error = %err, "failed to resume WAL");
                }
            }
        }

        Ok(())
    }

    async fn symbol_columns(&self, table: &str) -> HashSet<String> {
        let sql = format!("SHOW COLUMNS FROM {table}");
        match sqlx::query(&sql).fetch_all(&self.pool).await {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| row.try_get::<String, _>("column").ok())
                .collect(),
            Err(_) => HashSet::new(),
        }
    }

    async fn has_index(&self, table: &str, column: &str) -> bool {
        let sql = format!("SHOW COLUMNS FROM {table}");
        match sqlx::query(&sql).fetch_all(&self.pool).await {
            Ok(rows) => rows.into_iter().any(|row| {
                row.try_get::<String, _>("column").map(|c| c == column).unwrap_or(false)
                    && row.try_get::<bool, _>("indexed").unwrap_or(false)
            }),
            Err(_) => false,
        }
    }

    /// Guarded by a non-blocking in-process flag: a second concurrent call
    /// is a documented no-op, not an error. For every metric table, lists
    /// distinct `jobId`s, intersects the union with the document store's
    /// current job set, and swaps in a backup table filtered to drop the
    /// orphan difference.
    pub async fn purge(&self, tables: &[String], known_job_ids: &HashSet<i64>) -> ControllerResult<()> {
        if self.purging.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            tracing::info!("purge already in progress, skipping");
            return Ok(());
        }
        let result = self.purge_inner(tables, known_job_ids).await;
        self.purging.store(false, Ordering::SeqCst);
        result
    }

    async fn purge_inner(&self, tables: &[String], known_job_ids: &HashSet<i64>) -> ControllerResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.purge_limit));
        let mut handles = Vec::new();

        for table in tables.to_vec() {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let pool = self.pool.clone();
            let known = known_job_ids.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                purge_table(&pool, &table, &known).await
            }));
        }

        for handle in handles {
            if let Ok(Err(err)) = handle.await {
                tracing::warn!(error = %err, "table purge failed");
            }
        }
        Ok(())
    }
}

async fn purge_table(pool: &PgPool, table: &str, known_job_ids: &HashSet<i64>) -> ControllerResult<()> {
    let distinct_sql = format!("SELECT DISTINCT jobId FROM {table}");
    let rows = sqlx::query(&distinct_sql).fetch_all(pool).await?;
    let present: HashSet<i64> =
        rows.into_iter().filter_map(|row| row.try_get::<i64, _>("jobId").ok()).collect();

    let orphans: Vec<i64> = present.difference(known_job_ids).copied().collect();
    if orphans.is_empty() {
        return Ok(());
    }

    let orphan_list = orphans.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
    let backup_table = format!("{table}_purge_backup");

    sqlx::query(&format!(
        "CREATE TABLE {backup_table} AS (SELECT * FROM {table} WHERE jobId NOT IN ({orphan_list})) TIMESTAMP(ts) PARTITION BY DAY"
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!("DROP TABLE {table}")).execute(pool).await?;
    sqlx::query(&format!("RENAME TABLE {backup_table} TO {table}")).execute(pool).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_set_is_present_minus_known() {
        let present: HashSet<i64> = [1, 2, 3, 4].into_iter().collect();
        let known: HashSet<i64> = [1, 3].into_iter().collect();
        let orphans: HashSet<i64> = present.difference(&known).copied().collect();
        assert_eq!(orphans, [2, 4].into_iter().collect());
    }
}
