//! DuckDB / MotherDuck reporting mirror.

use crate::config::{MirrorConfig, StreamConfig, SyncStrategy};
use crate::error::{Error, Result};
use crate::mapper::MappedBatch;
use crate::schema::{Column, ColumnType, SYNCED_AT_COLUMN, Table};
use crate::upsert::{Deadline, UpsertPlan, UpsertStats};
use crate::watermark::{Watermark, WatermarkStore};
use chrono::NaiveDateTime;
use duckdb::{Connection, params};
use tracing::{debug, info, instrument, warn};

/// Result of committing one stream batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOutcome {
    /// Row counts
    pub stats: UpsertStats,
    /// Watermark in force after the commit
    pub watermark: Option<NaiveDateTime>,
}

/// Mirror store wrapper.
pub struct MirrorStore {
    conn: Connection,
    config: MirrorConfig,
}

impl MirrorStore {
    /// Open the mirror described by `config`.
    #[instrument(skip(config), fields(path = %display_path(&config.path)))]
    pub fn open(config: MirrorConfig) -> Result<Self> {
        info!("Opening mirror...");

        let conn = if config.path == ":memory:" {
            Connection::open_in_memory()
                .map_err(|e| Error::mirror_connection("Failed to open in-memory mirror", e))?
        } else if config.is_motherduck() {
            Self::open_motherduck(&config)?
        } else {
            Connection::open(&config.path)
                .map_err(|e| Error::mirror_connection("Failed to open mirror file", e))?
        };

        info!("Mirror open");
        Ok(Self { conn, config })
    }

    fn open_motherduck(config: &MirrorConfig) -> Result<Connection> {
        let database = config
            .path
            .trim_start_matches("md:")
            .split('?')
            .next()
            .unwrap_or_default();

        // connect without a database first so it can be created
        if !database.is_empty() {
            let init = Connection::open(with_token("md:", &config.token))
                .map_err(|e| Error::mirror_connection("Failed to connect to MotherDuck", e))?;
            init.execute_batch(&format!("CREATE DATABASE IF NOT EXISTS {}", database))
                .map_err(|e| Error::mirror_query("", "Failed to create database", e))?;
            info!("Ensured database exists: {}", database);
        }

        Connection::open(with_token(&config.path, &config.token))
            .map_err(|e| Error::mirror_connection("Failed to connect to database", e))
    }

    /// Mirror configuration.
    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Test connectivity.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .execute_batch("SELECT 1")
            .map_err(|e| Error::mirror_query("", "Ping failed", e))
    }

    /// Create the watermark table if needed.
    pub fn ensure_watermark_table(&self) -> Result<()> {
        WatermarkStore::new(&self.conn).ensure_table()
    }

    /// Target table definition for a stream.
    pub fn table_for(stream: &StreamConfig) -> Table {
        let mut table = Table::new(&stream.target_table);
        for spec in &stream.columns {
            let in_key = stream.natural_key.contains(&spec.name);
            table.add_column(
                Column::new(&spec.name, spec.column_type).nullable(spec.nullable && !in_key),
            );
        }
        table.add_column(Column::new(SYNCED_AT_COLUMN, ColumnType::Timestamp));
        table.set_primary_key(stream.natural_key.clone());
        table
    }

    /// Create the stream's target table, adding any columns declared since it was created.
    #[instrument(skip(self, stream), fields(table = %stream.target_table))]
    pub fn ensure_stream_table(&self, stream: &StreamConfig) -> Result<()> {
        let table = Self::table_for(stream);
        let ddl = table.to_duckdb_ddl();
        debug!("Creating table with DDL: {}", ddl);

        self.conn
            .execute_batch(&ddl)
            .map_err(|e| Error::mirror_query(&table.name, "Create table failed", e))?;

        for column in table.columns.iter().filter(|c| !table.primary_key.contains(&c.name)) {
            let alter = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                table.name,
                column.name,
                column.column_type.to_duckdb()
            );
            self.conn
                .execute_batch(&alter)
                .map_err(|e| Error::mirror_query(&table.name, "Add column failed", e))?;
        }

        debug!("Created/verified table: {}", table.name);
        Ok(())
    }

    /// Check if table exists. Accepts `schema.table`.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = match table.split_once('.') {
            Some((schema, name)) => self.conn.query_row(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = ? AND table_name = ?",
                params![schema, name],
                |row| row.get(0),
            ),
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
                params![table],
                |row| row.get(0),
            ),
        }
        .map_err(|e| Error::mirror_query(table, "Check table exists failed", e))?;

        Ok(count > 0)
    }

    /// Get row count for a table.
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM {}", table);
        self.conn
            .query_row(&query, [], |row| row.get(0))
            .map_err(|e| Error::mirror_query(table, "Count failed", e))
    }

    /// Committed watermark for a stream key.
    pub fn watermark(&self, key: &str) -> Result<Option<NaiveDateTime>> {
        WatermarkStore::new(&self.conn).get(key)
    }

    /// All committed watermarks.
    pub fn watermarks(&self) -> Result<Vec<Watermark>> {
        WatermarkStore::new(&self.conn).list()
    }

    /// Upsert a mapped batch and advance the stream's watermark in one transaction.
    ///
    /// Any error, including the deadline passing, rolls back both.
    #[instrument(skip_all, fields(stream = %stream.key, rows = batch.rows.len()))]
    pub fn apply_batch(
        &mut self,
        stream: &StreamConfig,
        plan: &UpsertPlan,
        batch: &MappedBatch,
        now: NaiveDateTime,
    ) -> Result<ApplyOutcome> {
        if batch.rows.len() > self.config.warn_batch_rows {
            warn!(
                rows = batch.rows.len(),
                threshold = self.config.warn_batch_rows,
                "Large batch applied in a single transaction"
            );
        }

        let deadline = Deadline::after(self.config.apply_timeout());
        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::mirror_query(plan.table(), "Begin transaction failed", e))?;

        let stats = plan.apply(&tx, &batch.rows, now, &deadline)?;

        let watermarks = WatermarkStore::new(&tx);
        let watermark = match (stream.strategy, batch.max_timestamp) {
            (SyncStrategy::Incremental, Some(candidate)) => {
                Some(watermarks.advance(&stream.key, candidate, now)?)
            }
            _ => watermarks.get(&stream.key)?,
        };

        deadline.check(&format!("commit to {}", plan.table()))?;
        tx.commit()
            .map_err(|e| Error::mirror_query(plan.table(), "Commit failed", e))?;

        Ok(ApplyOutcome { stats, watermark })
    }

    /// Get a reference to the underlying connection for advanced queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn with_token(path: &str, token: &str) -> String {
    if token.is_empty() {
        return path.to_string();
    }
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{}{}motherduck_token={}", path, separator, token)
}

/// Path for logging, with any inline token removed.
fn display_path(path: &str) -> String {
    match path.split_once("motherduck_token=") {
        Some((head, _)) => format!("{}motherduck_token=***", head),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::production_plan_stream;

    fn memory() -> MirrorStore {
        MirrorStore::open(MirrorConfig {
            path: ":memory:".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_token_handling() {
        assert_eq!(with_token("md:plant", ""), "md:plant");
        assert_eq!(with_token("md:plant", "abc"), "md:plant?motherduck_token=abc");
        assert_eq!(
            with_token("md:plant?saas_mode=true", "abc"),
            "md:plant?saas_mode=true&motherduck_token=abc"
        );
        assert_eq!(
            display_path("md:plant?motherduck_token=abc"),
            "md:plant?motherduck_token=***"
        );
    }

    #[test]
    fn test_table_for_stream() {
        let table = MirrorStore::table_for(&production_plan_stream());
        let ddl = table.to_duckdb_ddl();
        assert!(ddl.contains("faccd VARCHAR NOT NULL"));
        assert!(ddl.contains("d_ymd VARCHAR(8) NOT NULL"));
        assert!(ddl.contains("synced_at TIMESTAMP"));
        assert!(ddl.contains("PRIMARY KEY (faccd, setsubicd, itemcd, d_ymd)"));
    }

    #[test]
    fn test_ensure_tables_idempotent() {
        let store = memory();
        let stream = production_plan_stream();
        store.ping().unwrap();
        store.ensure_watermark_table().unwrap();
        store.ensure_stream_table(&stream).unwrap();
        store.ensure_stream_table(&stream).unwrap();

        assert!(store.table_exists("prodplan_mirror").unwrap());
        assert!(store.table_exists("sync_watermark").unwrap());
        assert!(!store.table_exists("prodresult_mirror").unwrap());
        assert_eq!(store.count_rows("prodplan_mirror").unwrap(), 0);
    }

    #[test]
    fn test_new_columns_are_added() {
        let store = memory();
        let mut stream = production_plan_stream();
        store.ensure_stream_table(&stream).unwrap();

        stream
            .columns
            .push(crate::config::ColumnSpec::new("lot_no", ColumnType::Text));
        store.ensure_stream_table(&stream).unwrap();

        store
            .connection()
            .execute_batch("SELECT lot_no FROM prodplan_mirror")
            .unwrap();
    }
}
