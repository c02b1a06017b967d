//! Mirror table definitions and DDL generation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the bookkeeping column stamped on every upserted row.
pub const SYNCED_AT_COLUMN: &str = "synced_at";

/// Table definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Table name
    pub name: String,
    /// Columns
    pub columns: Vec<Column>,
    /// Primary key columns
    pub primary_key: Vec<String>,
}

impl Table {
    /// Create a new table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Add a column.
    pub fn add_column(&mut self, column: Column) {
        self.columns.push(column);
    }

    /// Set primary key.
    pub fn set_primary_key(&mut self, columns: Vec<String>) {
        self.primary_key = columns;
    }

    /// Generate CREATE TABLE DDL for DuckDB.
    pub fn to_duckdb_ddl(&self) -> String {
        let mut ddl = format!("CREATE TABLE IF NOT EXISTS {} (\n", self.name);

        let col_defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                format!(
                    "    {} {}{}",
                    c.name,
                    c.column_type.to_duckdb(),
                    c.constraints_ddl()
                )
            })
            .collect();

        ddl.push_str(&col_defs.join(",\n"));

        if !self.primary_key.is_empty() {
            ddl.push_str(&format!(
                ",\n    PRIMARY KEY ({})",
                self.primary_key.join(", ")
            ));
        }

        ddl.push_str("\n)");
        ddl
    }
}

/// Column definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Column type
    pub column_type: ColumnType,
    /// Is nullable
    pub nullable: bool,
}

impl Column {
    /// Create a new nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    /// Set nullable.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    fn constraints_ddl(&self) -> String {
        if self.nullable {
            String::new()
        } else {
            " NOT NULL".to_string()
        }
    }
}

/// Column types a mirrored value can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Trimmed text
    #[default]
    Text,
    /// Boolean
    Boolean,
    /// 64-bit integer
    Integer,
    /// Double precision float
    Double,
    /// Fixed-point decimal
    Decimal,
    /// Calendar date
    Date,
    /// `YYYYMMDD` business date kept as text
    CompactDate,
    /// Timestamp without timezone
    Timestamp,
}

impl ColumnType {
    /// Convert to DuckDB type string.
    pub fn to_duckdb(&self) -> &'static str {
        match self {
            ColumnType::Text => "VARCHAR",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "BIGINT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Decimal => "DECIMAL(18,4)",
            ColumnType::Date => "DATE",
            ColumnType::CompactDate => "VARCHAR(8)",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_duckdb())
    }
}
