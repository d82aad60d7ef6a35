use crate::app::error::ReportError;
use crate::app::models::{RelationshipEdge, SchemaAnalysis, Table};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const WIDE: usize = 100;
const NARROW: usize = 50;
const NOT_AVAILABLE: &str = "N/A";

fn rule(ch: char, width: usize) -> String {
    ch.to_string().repeat(width)
}

pub struct OutputGenerator;

impl OutputGenerator {
    /// Fixed-width schema listing: contents, per-table columns and foreign
    /// keys, then outgoing/incoming references grouped by table name.
    pub fn generate_schema_listing(analysis: &SchemaAnalysis) -> Result<String, ReportError> {
        let mut output = String::new();

        writeln!(output, "DATABASE SCHEMA: {}", analysis.database)?;
        writeln!(output, "{}\n", rule('=', WIDE))?;
        writeln!(output, "Total tables: {}\n", analysis.tables_count())?;

        writeln!(output, "TABLE OF CONTENTS")?;
        writeln!(output, "{}", rule('-', NARROW))?;
        for (i, table) in analysis.tables.iter().enumerate() {
            writeln!(output, "{}. {} (rows: {})", i + 1, table.name, display_rows(table.rows))?;
        }

        writeln!(output, "\n\nDETAILED SCHEMA")?;
        writeln!(output, "{}\n", rule('=', WIDE))?;

        for table in &analysis.tables {
            writeln!(output, "TABLE: {}", table.name)?;
            writeln!(output, "{}", rule('=', WIDE))?;
            writeln!(
                output,
                "Rows: {} | Engine: {} | Created: {}",
                display_rows(table.rows),
                table.engine.as_deref().unwrap_or(NOT_AVAILABLE),
                table
                    .created
                    .map(|c| c.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            )?;
            writeln!(output, "{}", rule('-', WIDE))?;

            writeln!(
                output,
                "{:<30}{:<20}{:<10}{:<10}{:<20}{}",
                "COLUMN", "TYPE", "NULLABLE", "KEY", "DEFAULT", "EXTRA"
            )?;
            writeln!(output, "{}", rule('-', WIDE))?;
            for col in &table.columns {
                writeln!(
                    output,
                    "{:<30}{:<20}{:<10}{:<10}{:<20}{}",
                    col.name,
                    col.data_type,
                    if col.nullable { "YES" } else { "NO" },
                    col.key,
                    col.default.as_deref().unwrap_or("NULL"),
                    col.extra
                )?;
            }

            if !table.foreign_keys.is_empty() {
                writeln!(output, "\nFOREIGN KEYS:")?;
                writeln!(output, "{}", rule('-', WIDE))?;
                writeln!(output, "{:<30}{:<50}{}", "COLUMN", "REFERENCES", "CONSTRAINT NAME")?;
                writeln!(output, "{}", rule('-', WIDE))?;
                for fk in &table.foreign_keys {
                    let reference = format!("{}.{}", fk.referenced_table, fk.referenced_column);
                    writeln!(output, "{:<30}{:<50}{}", fk.column, reference, fk.constraint_name)?;
                }
            }

            writeln!(output, "\n")?;
        }

        if !analysis.relationships.is_empty() {
            Self::write_relationship_summary(&mut output, &analysis.relationships)?;
        }

        Ok(output)
    }

    fn write_relationship_summary(
        output: &mut String,
        relationships: &[RelationshipEdge],
    ) -> Result<(), std::fmt::Error> {
        let mut outgoing: BTreeMap<&str, Vec<&RelationshipEdge>> = BTreeMap::new();
        let mut incoming: BTreeMap<&str, Vec<&RelationshipEdge>> = BTreeMap::new();
        for edge in relationships {
            outgoing.entry(&edge.source_table).or_default().push(edge);
            incoming.entry(&edge.target_table).or_default().push(edge);
        }

        writeln!(output, "\nRELATIONSHIP SUMMARY")?;
        writeln!(output, "{}\n", rule('=', WIDE))?;

        writeln!(output, "OUTGOING REFERENCES:")?;
        writeln!(output, "{}", rule('-', WIDE))?;
        for (source, edges) in &outgoing {
            writeln!(output, "Table '{source}' references:")?;
            for e in edges {
                writeln!(
                    output,
                    "  - Table '{}' via {}.{} -> {}.{}",
                    e.target_table, source, e.source_column, e.target_table, e.target_column
                )?;
            }
            writeln!(output)?;
        }

        writeln!(output, "\nINCOMING REFERENCES:")?;
        writeln!(output, "{}", rule('-', WIDE))?;
        for (target, edges) in &incoming {
            writeln!(output, "Table '{target}' is referenced by:")?;
            for e in edges {
                writeln!(
                    output,
                    "  - Table '{}' via {}.{} -> {}.{}",
                    e.source_table, e.source_table, e.source_column, target, e.target_column
                )?;
            }
            writeln!(output)?;
        }

        Ok(())
    }

    /// Relationship table from the schema-wide query, then a "referenced by"
    /// index per parent table.
    pub fn generate_reference_diagram(analysis: &SchemaAnalysis) -> Result<String, ReportError> {
        let mut output = String::new();

        writeln!(output, "ENTITY RELATIONSHIP DIAGRAM: {}", analysis.database)?;
        writeln!(output, "{}\n", rule('=', WIDE))?;

        writeln!(output, "RELATIONSHIPS")?;
        writeln!(output, "{}", rule('-', WIDE))?;
        writeln!(
            output,
            "{:<30}{:<30}{:<30}{:<30}{}",
            "CHILD TABLE", "CHILD COLUMN", "PARENT TABLE", "PARENT COLUMN", "CONSTRAINT NAME"
        )?;
        writeln!(output, "{}", rule('-', WIDE))?;
        for rel in &analysis.all_relationships {
            writeln!(
                output,
                "{:<30}{:<30}{:<30}{:<30}{}",
                rel.child_table,
                rel.child_column,
                rel.parent_table,
                rel.parent_column,
                rel.constraint_name
            )?;
        }

        writeln!(output, "\n\nTABLE REFERENCES")?;
        writeln!(output, "{}\n", rule('=', WIDE))?;

        let mut referenced: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for rel in &analysis.all_relationships {
            referenced.entry(&rel.parent_table).or_default().push(format!(
                "  - Table '{}' via {}.{} -> {}.{}",
                rel.child_table,
                rel.child_table,
                rel.child_column,
                rel.parent_table,
                rel.parent_column
            ));
        }

        for (table, mut references) in referenced {
            references.sort();
            writeln!(output, "Table '{table}' is referenced by:")?;
            for reference in references {
                writeln!(output, "{reference}")?;
            }
            writeln!(output)?;
        }

        Ok(output)
    }

    /// Plain grid for printing an ad hoc result to a terminal.
    pub fn render_table(table: &Table) -> Result<String, ReportError> {
        let mut output = String::new();
        if table.columns.is_empty() {
            writeln!(output, "(no columns)")?;
            return Ok(output);
        }

        let cells: Vec<Vec<String>> = table
            .rows
            .iter()
            .map(|row| row.iter().map(|v| v.to_string()).collect())
            .collect();
        let widths: Vec<usize> = table
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                cells
                    .iter()
                    .filter_map(|row| row.get(i))
                    .map(|c| c.chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        writeln!(output, "{}", grid_line(table.columns.iter().map(String::as_str), &widths))?;
        writeln!(
            output,
            "{}",
            widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-")
        )?;
        for row in &cells {
            writeln!(output, "{}", grid_line(row.iter().map(String::as_str), &widths))?;
        }
        writeln!(output, "({} rows)", table.len())?;
        Ok(output)
    }

    /// Writes `contents` to `dir/file_name`, creating `dir` if needed.
    pub fn write_report(
        dir: &Path,
        file_name: &str,
        contents: &str,
    ) -> Result<PathBuf, ReportError> {
        fs::create_dir_all(dir).map_err(|source| ReportError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(file_name);
        fs::write(&path, contents).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "report written");
        Ok(path)
    }
}

fn grid_line<'a>(values: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    values
        .zip(widths)
        .map(|(v, &w)| format!("{v:<w$}"))
        .collect::<Vec<_>>()
        .join(" | ")
        .trim_end()
        .to_string()
}

fn display_rows(rows: Option<u64>) -> String {
    rows.map(|r| r.to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::inspector::Inspector;
    use crate::app::inspector::fixtures::shop_session;
    use crate::app::models::{ReferenceRow, Value};
    use std::time::Duration;

    async fn shop_analysis(limit: Option<usize>) -> SchemaAnalysis {
        let mut session = shop_session();
        Inspector::new(&mut session, limit).analyze().await.unwrap()
    }

    fn edge(source: &str, source_col: &str, target: &str, target_col: &str) -> RelationshipEdge {
        RelationshipEdge {
            source_table: source.into(),
            source_column: source_col.into(),
            target_table: target.into(),
            target_column: target_col.into(),
        }
    }

    #[tokio::test]
    async fn schema_listing_shows_foreign_key_row() {
        let listing = OutputGenerator::generate_schema_listing(&shop_analysis(None).await).unwrap();

        assert!(listing.starts_with("DATABASE SCHEMA: shop\n"));
        assert!(listing.contains("Total tables: 2\n"));
        assert!(listing.contains("1. orders (rows: 250)\n"));
        assert!(listing.contains("Rows: 250 | Engine: InnoDB | Created: 2024-01-15 08:00:00\n"));
        let fk_row = format!("{:<30}{:<50}{}\n", "user_id", "users.id", "fk_orders_user");
        assert!(listing.contains(&fk_row));
        let id_row = format!(
            "{:<30}{:<20}{:<10}{:<10}{:<20}{}\n",
            "id", "int", "NO", "PRI", "NULL", "auto_increment"
        );
        assert!(listing.contains(&id_row));
        // users has no foreign keys: only one FOREIGN KEYS section overall
        assert_eq!(listing.matches("FOREIGN KEYS:").count(), 1);
    }

    #[test]
    fn outgoing_and_incoming_are_listed_once() {
        let analysis = SchemaAnalysis {
            database: "db".into(),
            tables: Vec::new(),
            relationships: vec![edge("B", "a_id", "A", "id")],
            all_relationships: Vec::new(),
            elapsed: Duration::ZERO,
        };
        let listing = OutputGenerator::generate_schema_listing(&analysis).unwrap();

        let outgoing = "Table 'B' references:\n  - Table 'A' via B.a_id -> A.id\n";
        let incoming = "Table 'A' is referenced by:\n  - Table 'B' via B.a_id -> A.id\n";
        assert_eq!(listing.matches(outgoing).count(), 1);
        assert_eq!(listing.matches(incoming).count(), 1);
        assert!(listing.find("OUTGOING").unwrap() < listing.find("INCOMING").unwrap());
    }

    #[test]
    fn reference_groups_are_sorted_by_table_name() {
        let analysis = SchemaAnalysis {
            database: "db".into(),
            tables: Vec::new(),
            relationships: vec![
                edge("shipments", "order_id", "orders", "id"),
                edge("orders", "user_id", "users", "id"),
                edge("invoices", "order_id", "orders", "id"),
            ],
            all_relationships: Vec::new(),
            elapsed: Duration::ZERO,
        };
        let listing = OutputGenerator::generate_schema_listing(&analysis).unwrap();

        let invoices = listing.find("Table 'invoices' references:").unwrap();
        let orders = listing.find("Table 'orders' references:").unwrap();
        let shipments = listing.find("Table 'shipments' references:").unwrap();
        assert!(invoices < orders && orders < shipments);

        let to_orders = listing.find("Table 'orders' is referenced by:").unwrap();
        let to_users = listing.find("Table 'users' is referenced by:").unwrap();
        assert!(to_orders < to_users);
    }

    #[tokio::test]
    async fn reference_diagram_lists_referenced_by() {
        let analysis = shop_analysis(None).await;
        let diagram = OutputGenerator::generate_reference_diagram(&analysis).unwrap();

        assert!(diagram.starts_with("ENTITY RELATIONSHIP DIAGRAM: shop\n"));
        let row = format!(
            "{:<30}{:<30}{:<30}{:<30}{}\n",
            "orders", "user_id", "users", "id", "fk_orders_user"
        );
        assert!(diagram.contains(&row));
        assert!(diagram.contains(
            "Table 'users' is referenced by:\n  - Table 'orders' via orders.user_id -> users.id\n"
        ));
    }

    #[test]
    fn referenced_by_entries_are_sorted() {
        let reference = |child: &str| ReferenceRow {
            child_table: child.into(),
            child_column: "user_id".into(),
            constraint_name: format!("fk_{child}"),
            parent_table: "users".into(),
            parent_column: "id".into(),
        };
        let analysis = SchemaAnalysis {
            database: "db".into(),
            tables: Vec::new(),
            relationships: Vec::new(),
            all_relationships: vec![reference("sessions"), reference("carts")],
            elapsed: Duration::ZERO,
        };
        let diagram = OutputGenerator::generate_reference_diagram(&analysis).unwrap();
        let carts = diagram.find("  - Table 'carts'").unwrap();
        let sessions = diagram.find("  - Table 'sessions'").unwrap();
        assert!(carts < sessions);
    }

    #[tokio::test]
    async fn truncated_run_still_renders() {
        let analysis = shop_analysis(Some(1)).await;
        let listing = OutputGenerator::generate_schema_listing(&analysis).unwrap();
        assert!(listing.contains("Total tables: 1\n"));
        assert!(!listing.contains("TABLE: users\n"));
        assert!(listing.contains("Table 'users' is referenced by:"));
        OutputGenerator::generate_reference_diagram(&analysis).unwrap();
    }

    #[tokio::test]
    async fn reports_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let mut written = Vec::new();
        for run in 0..2 {
            let mut analysis = shop_analysis(None).await;
            analysis.elapsed = Duration::from_millis(run * 750);
            let listing = OutputGenerator::generate_schema_listing(&analysis).unwrap();
            let diagram = OutputGenerator::generate_reference_diagram(&analysis).unwrap();
            let listing_name = format!("schema_{run}.txt");
            let diagram_name = format!("erd_{run}.txt");
            let listing_path =
                OutputGenerator::write_report(dir.path(), &listing_name, &listing).unwrap();
            let diagram_path =
                OutputGenerator::write_report(dir.path(), &diagram_name, &diagram).unwrap();
            written.push((
                std::fs::read(listing_path).unwrap(),
                std::fs::read(diagram_path).unwrap(),
            ));
        }
        assert_eq!(written[0], written[1]);
    }

    #[test]
    fn write_report_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("reports").join("mysql");
        let path = OutputGenerator::write_report(&nested, "schema.txt", "x\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "x\n");
    }

    #[test]
    fn render_table_aligns_columns() {
        let table = Table::with_rows(
            vec!["id".into(), "name".into()],
            vec![
                vec![Value::Int(1), Value::Text("alice".into())],
                vec![Value::Int(22), Value::Null],
            ],
        );
        let rendered = OutputGenerator::render_table(&table).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "id | name");
        assert_eq!(lines[1], "---+------");
        assert_eq!(lines[2], "1  | alice");
        assert_eq!(lines[3], "22 | NULL");
        assert_eq!(lines[4], "(2 rows)");
    }
}
