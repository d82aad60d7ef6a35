use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;

/// A single cell of a query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Value {
    /// Renders the cell as text, `None` for SQL NULL.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Float(v) if *v >= 0.0 => Some(*v as u64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(v) => Some(*v),
            Value::TimestampTz(v) => Some(v.naive_utc()),
            Value::Date(v) => v.and_hms_opt(0, 0, 0),
            Value::Text(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S")),
            Value::TimestampTz(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%:z")),
            Value::Date(v) => write!(f, "{v}"),
            Value::Time(v) => write!(f, "{v}"),
            Value::Json(v) => write!(f, "{v}"),
            Value::Bytes(v) => {
                f.write_str("0x")?;
                for byte in v {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Materialized result of a read-style statement.
///
/// An empty result is still a `Table`, with no rows and possibly no columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Column position, matched case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.rows.iter().map(move |values| Record {
            table: self,
            values,
        })
    }

    pub fn first(&self) -> Option<Record<'_>> {
        self.records().next()
    }
}

/// Borrowed view of one row with by-name access.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    table: &'a Table,
    values: &'a [Value],
}

impl<'a> Record<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.table
            .column_index(column)
            .and_then(|idx| self.values.get(idx))
    }

    /// Text of a non-NULL cell; `None` when the column is missing or NULL.
    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(Value::as_text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub key: String,
    pub default: Option<String>,
    pub extra: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDescriptor {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    pub constraint_name: String,
}

// One table of a schema analysis run; nothing is persisted beyond the report files.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub name: String,
    pub rows: Option<u64>,
    pub engine: Option<String>,
    pub collation: Option<String>,
    pub created: Option<NaiveDateTime>,
    pub columns: Vec<ColumnDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

/// `source_table.source_column -> target_table.target_column`, derived from a
/// table's own foreign keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipEdge {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
}

impl From<(&str, &ForeignKeyDescriptor)> for RelationshipEdge {
    fn from((table, fk): (&str, &ForeignKeyDescriptor)) -> Self {
        Self {
            source_table: table.to_string(),
            source_column: fk.column.clone(),
            target_table: fk.referenced_table.clone(),
            target_column: fk.referenced_column.clone(),
        }
    }
}

/// A row of the schema-wide relationship query. Kept separate from the
/// per-table edges; the two sources are never merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRow {
    pub child_table: String,
    pub child_column: String,
    pub constraint_name: String,
    pub parent_table: String,
    pub parent_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaAnalysis {
    pub database: String,
    pub tables: Vec<TableDescriptor>,
    pub relationships: Vec<RelationshipEdge>,
    pub all_relationships: Vec<ReferenceRow>,
    pub elapsed: Duration,
}

impl SchemaAnalysis {
    pub fn tables_count(&self) -> usize {
        self.tables.len()
    }
}
