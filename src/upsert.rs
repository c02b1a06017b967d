//! Idempotent insert-or-update of mapped rows, keyed by natural key.

use crate::config::{ColumnSpec, StreamConfig};
use crate::error::{Error, Result};
use crate::mapper::{MirrorRow, MirrorValue};
use crate::schema::SYNCED_AT_COLUMN;
use chrono::NaiveDateTime;
use duckdb::{Connection, ToSql};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Row counts from one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    /// Keys not present before
    pub inserted: usize,
    /// Keys present with at least one differing value
    pub updated: usize,
    /// Keys present with identical values
    pub unchanged: usize,
}

impl UpsertStats {
    /// Rows written (inserted or updated).
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Cooperative time budget for synchronous mirror work.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Fail with a timeout once the budget is spent.
    pub fn check(&self, operation: &str) -> Result<()> {
        if Instant::now() >= self.at {
            Err(Error::timeout(operation, self.budget))
        } else {
            Ok(())
        }
    }
}

/// Prepared SQL for upserting one stream's rows.
#[derive(Debug, Clone)]
pub struct UpsertPlan {
    table: String,
    exists_sql: String,
    insert_sql: String,
    update_sql: Option<String>,
    touch_sql: String,
}

impl UpsertPlan {
    /// Build the statements for `stream`.
    ///
    /// Row values bind in the order [`crate::mapper::map_batch`] produces
    /// them: natural key first, then mutable columns.
    pub fn new(stream: &StreamConfig) -> Self {
        let key: Vec<&ColumnSpec> = stream
            .natural_key
            .iter()
            .filter_map(|name| stream.column(name))
            .collect();
        let mutable: Vec<&ColumnSpec> = stream.mutable_columns().collect();

        let key_match = key
            .iter()
            .map(|c| format!("{} = {}", c.name, cast_param(c)))
            .collect::<Vec<_>>()
            .join(" AND ");

        let exists_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            stream.target_table, key_match
        );

        let mut names: Vec<&str> = key.iter().chain(&mutable).map(|c| c.name.as_str()).collect();
        names.push(SYNCED_AT_COLUMN);
        let mut casts: Vec<String> = key.iter().chain(&mutable).map(|c| cast_param(c)).collect();
        casts.push("CAST(? AS TIMESTAMP)".into());
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            stream.target_table,
            names.join(", "),
            casts.join(", ")
        );

        // identical rows match no row here and are only touched
        let update_sql = (!mutable.is_empty()).then(|| {
            let assignments = mutable
                .iter()
                .map(|c| format!("{} = {}", c.name, cast_param(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let changed = mutable
                .iter()
                .map(|c| format!("{} IS DISTINCT FROM {}", c.name, cast_param(c)))
                .collect::<Vec<_>>()
                .join(" OR ");
            format!(
                "UPDATE {} SET {}, {} = CAST(? AS TIMESTAMP) WHERE {} AND ({})",
                stream.target_table, assignments, SYNCED_AT_COLUMN, key_match, changed
            )
        });

        let touch_sql = format!(
            "UPDATE {} SET {} = CAST(? AS TIMESTAMP) WHERE {}",
            stream.target_table, SYNCED_AT_COLUMN, key_match
        );

        Self {
            table: stream.target_table.clone(),
            exists_sql,
            insert_sql,
            update_sql,
            touch_sql,
        }
    }

    /// Target table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Apply `rows` in order. Later rows with an earlier row's key update it.
    ///
    /// Runs on whatever `conn` is; callers pass a transaction so that any
    /// error leaves the table as it was.
    #[instrument(skip_all, fields(table = %self.table, rows = rows.len()))]
    pub fn apply(
        &self,
        conn: &Connection,
        rows: &[MirrorRow],
        synced_at: NaiveDateTime,
        deadline: &Deadline,
    ) -> Result<UpsertStats> {
        let mut stats = UpsertStats::default();
        if rows.is_empty() {
            return Ok(stats);
        }

        let mut exists = conn
            .prepare(&self.exists_sql)
            .map_err(|e| Error::mirror_query(&self.table, "Prepare lookup failed", e))?;
        let mut insert = conn
            .prepare(&self.insert_sql)
            .map_err(|e| Error::mirror_query(&self.table, "Prepare insert failed", e))?;
        let mut update = match &self.update_sql {
            Some(sql) => Some(
                conn.prepare(sql)
                    .map_err(|e| Error::mirror_query(&self.table, "Prepare update failed", e))?,
            ),
            None => None,
        };
        let mut touch = conn
            .prepare(&self.touch_sql)
            .map_err(|e| Error::mirror_query(&self.table, "Prepare touch failed", e))?;

        let stamp = MirrorValue::Timestamp(synced_at);

        for (index, row) in rows.iter().enumerate() {
            deadline.check(&format!("upsert into {}", self.table))?;

            let key_params: Vec<&dyn ToSql> = row.key.iter().map(|v| v as &dyn ToSql).collect();
            let present: i64 = exists
                .query_row(key_params.as_slice(), |r| r.get(0))
                .map_err(|e| {
                    Error::mirror_query(&self.table, format!("Lookup failed at row {}", index), e)
                })?;

            if present == 0 {
                let mut params: Vec<&dyn ToSql> = key_params;
                params.extend(row.values.iter().map(|v| v as &dyn ToSql));
                params.push(&stamp);
                insert.execute(params.as_slice()).map_err(|e| {
                    Error::mirror_query(&self.table, format!("Insert failed at row {}", index), e)
                })?;
                stats.inserted += 1;
                continue;
            }

            let affected = match update.as_mut() {
                Some(update) => {
                    let mut params: Vec<&dyn ToSql> =
                        row.values.iter().map(|v| v as &dyn ToSql).collect();
                    params.push(&stamp);
                    params.extend(row.key.iter().map(|v| v as &dyn ToSql));
                    params.extend(row.values.iter().map(|v| v as &dyn ToSql));
                    update.execute(params.as_slice()).map_err(|e| {
                        let message = format!("Update failed at row {}", index);
                        Error::mirror_query(&self.table, message, e)
                    })?
                }
                None => 0,
            };

            if affected > 0 {
                stats.updated += 1;
                continue;
            }

            let mut params: Vec<&dyn ToSql> = Vec::with_capacity(key_params.len() + 1);
            params.push(&stamp);
            params.extend(key_params);
            touch.execute(params.as_slice()).map_err(|e| {
                Error::mirror_query(&self.table, format!("Touch failed at row {}", index), e)
            })?;
            stats.unchanged += 1;
        }

        debug!(
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            written = stats.written(),
            "upsert applied"
        );
        Ok(stats)
    }
}

fn cast_param(column: &ColumnSpec) -> String {
    format!("CAST(? AS {})", column.column_type.to_duckdb())
}
