//! Durable per-stream watermarks kept in the mirror itself.
//!
//! The watermark row is written through the same connection (and, during a
//! batch, the same transaction) as the stream's rows, so rows and watermark
//! commit or roll back together.

use crate::error::{Error, Result};
use crate::mapper::{MirrorValue, parse_timestamp};
use chrono::NaiveDateTime;
use duckdb::{Connection, OptionalExt, params};
use serde::Serialize;
use tracing::debug;

/// Table holding one row per stream key.
pub const WATERMARK_TABLE: &str = "sync_watermark";

/// A stored watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    /// Stream key
    pub key: String,
    /// Highest source timestamp committed so far
    pub last_value: Option<NaiveDateTime>,
    /// When the watermark last moved
    pub updated_at: Option<NaiveDateTime>,
}

/// Watermark access over an open mirror connection or transaction.
pub struct WatermarkStore<'c> {
    conn: &'c Connection,
}

impl<'c> WatermarkStore<'c> {
    /// Wrap a connection. A `duckdb::Transaction` derefs to one.
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Create the watermark table if it is missing.
    pub fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                 wm_key VARCHAR PRIMARY KEY,\n    \
                 last_value TIMESTAMP,\n    \
                 updated_at TIMESTAMP\n)",
            WATERMARK_TABLE
        );
        self.conn
            .execute_batch(&ddl)
            .map_err(|e| Error::mirror_query(WATERMARK_TABLE, "Create table failed", e))
    }

    /// Current watermark for `key`, `None` when the stream has never committed one.
    pub fn get(&self, key: &str) -> Result<Option<NaiveDateTime>> {
        let sql = format!(
            "SELECT CAST(last_value AS VARCHAR) FROM {} WHERE wm_key = ?",
            WATERMARK_TABLE
        );
        let stored: Option<Option<String>> = self
            .conn
            .query_row(&sql, params![key], |row| row.get(0))
            .optional()
            .map_err(|e| Error::mirror_query(WATERMARK_TABLE, "Read watermark failed", e))?;

        Ok(stored.flatten().as_deref().and_then(parse_timestamp))
    }

    /// Move the watermark forward to `candidate` if it is strictly greater.
    ///
    /// Returns the value in force afterwards. A candidate at or below the
    /// stored value leaves the row untouched.
    pub fn advance(
        &self,
        key: &str,
        candidate: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<NaiveDateTime> {
        let current = self.get(key)?;
        let value = MirrorValue::Timestamp(candidate);
        let stamp = MirrorValue::Timestamp(now);

        match current {
            Some(existing) if existing >= candidate => {
                debug!(key, %existing, %candidate, "watermark kept");
                return Ok(existing);
            }
            Some(_) => {
                let sql = format!(
                    "UPDATE {} SET last_value = CAST(? AS TIMESTAMP), \
                     updated_at = CAST(? AS TIMESTAMP) WHERE wm_key = ?",
                    WATERMARK_TABLE
                );
                self.conn
                    .execute(&sql, params![value, stamp, key])
                    .map_err(|e| {
                        Error::mirror_query(WATERMARK_TABLE, "Advance watermark failed", e)
                    })?;
            }
            None => {
                let sql = format!(
                    "INSERT INTO {} (wm_key, last_value, updated_at) \
                     VALUES (?, CAST(? AS TIMESTAMP), CAST(? AS TIMESTAMP))",
                    WATERMARK_TABLE
                );
                self.conn
                    .execute(&sql, params![key, value, stamp])
                    .map_err(|e| {
                        Error::mirror_query(WATERMARK_TABLE, "Insert watermark failed", e)
                    })?;
            }
        }

        debug!(key, %candidate, "watermark advanced");
        Ok(candidate)
    }

    /// All stored watermarks, ordered by key.
    pub fn list(&self) -> Result<Vec<Watermark>> {
        let sql = format!(
            "SELECT wm_key, CAST(last_value AS VARCHAR), CAST(updated_at AS VARCHAR) \
             FROM {} ORDER BY wm_key",
            WATERMARK_TABLE
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| Error::mirror_query(WATERMARK_TABLE, "Prepare list failed", e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|e| Error::mirror_query(WATERMARK_TABLE, "List watermarks failed", e))?;

        let mut watermarks = Vec::new();
        for row in rows {
            let (key, last_value, updated_at) =
                row.map_err(|e| Error::mirror_query(WATERMARK_TABLE, "Read row failed", e))?;
            watermarks.push(Watermark {
                key,
                last_value: last_value.as_deref().and_then(parse_timestamp),
                updated_at: updated_at.as_deref().and_then(parse_timestamp),
            });
        }
        Ok(watermarks)
    }
}
