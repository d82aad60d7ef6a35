use crate::app::models::Table;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::{Map, Value as JsonValue};
use std::fs;
use std::path::{Path, PathBuf};

/// Rows as JSON objects keyed by column name.
pub fn table_to_json(table: &Table) -> Result<JsonValue> {
    let rows = table
        .rows
        .iter()
        .map(|row| {
            let mut object = Map::with_capacity(table.columns.len());
            for (column, value) in table.columns.iter().zip(row) {
                object.insert(column.clone(), serde_json::to_value(value)?);
            }
            Ok(JsonValue::Object(object))
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;
    Ok(JsonValue::Array(rows))
}

/// Saves `table` as `<dir>/<query stem>_<date>.json`.
pub fn save_results(
    table: &Table,
    query_name: &str,
    dir: &Path,
    date: NaiveDate,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let stem = Path::new(query_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("query");
    let path = dir.join(format!("{stem}_{}.json", date.format("%Y-%m-%d")));

    let json = serde_json::to_string_pretty(&table_to_json(table)?)?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
