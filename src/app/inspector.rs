use crate::app::db::{DEFAULT_MAX_ROWS, DEFAULT_TIMEOUT_MS, QueryOutcome, SqlExecutor, SqlParam};
use crate::app::error::{DbError, ReportError};
use crate::app::models::{
    ColumnDescriptor, ForeignKeyDescriptor, ReferenceRow, RelationshipEdge, SchemaAnalysis,
    Table, TableDescriptor, Value,
};
use std::time::Instant;
use tracing::{error, info, warn};

const TABLES_TIMEOUT_MS: u64 = 30_000;
const TABLES_MAX_ROWS: usize = 10_000;
const TABLE_DETAIL_TIMEOUT_MS: u64 = 10_000;
const RELATIONSHIPS_TIMEOUT_MS: u64 = 30_000;

const DATABASE_NAME_SQL: &str = "SELECT DATABASE() AS db_name";

const TABLES_SQL: &str = r#"
    SELECT TABLE_NAME, TABLE_ROWS, ENGINE, TABLE_COLLATION, CREATE_TIME
    FROM INFORMATION_SCHEMA.TABLES
    WHERE TABLE_SCHEMA = DATABASE()
    ORDER BY TABLE_NAME
"#;

const COLUMNS_SQL: &str = r#"
    SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, COLUMN_DEFAULT, EXTRA
    FROM INFORMATION_SCHEMA.COLUMNS
    WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
    ORDER BY ORDINAL_POSITION
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT COLUMN_NAME, REFERENCED_TABLE_NAME, REFERENCED_COLUMN_NAME, CONSTRAINT_NAME
    FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
    WHERE TABLE_SCHEMA = DATABASE()
      AND TABLE_NAME = ?
      AND REFERENCED_TABLE_NAME IS NOT NULL
"#;

const RELATIONSHIPS_SQL: &str = r#"
    SELECT
        TABLE_NAME AS child_table,
        COLUMN_NAME AS child_column,
        CONSTRAINT_NAME AS constraint_name,
        REFERENCED_TABLE_NAME AS parent_table,
        REFERENCED_COLUMN_NAME AS parent_column
    FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
    WHERE TABLE_SCHEMA = DATABASE()
      AND REFERENCED_TABLE_NAME IS NOT NULL
    ORDER BY parent_table, child_table
"#;

// Walks MySQL information_schema through any SqlExecutor.
pub struct Inspector<'a, E> {
    conn: &'a mut E,
    limit: Option<usize>,
}

impl<'a, E: SqlExecutor> Inspector<'a, E> {
    pub fn new(conn: &'a mut E, limit: Option<usize>) -> Self {
        Self { conn, limit }
    }

    pub async fn analyze(&mut self) -> Result<SchemaAnalysis, ReportError> {
        let started = Instant::now();

        let database = self.get_database_name().await;

        let mut tables = match self.get_all_tables().await {
            Ok(tables) if !tables.is_empty() => tables,
            Ok(_) => {
                error!("no tables found");
                return Err(ReportError::NoTables);
            }
            Err(err) => {
                error!(error = %err, "table listing failed");
                return Err(ReportError::NoTables);
            }
        };

        if let Some(limit) = self.limit.filter(|n| *n > 0) {
            tables.truncate(limit);
        }

        let mut relationships = Vec::new();
        for table in &mut tables {
            table.columns = self.get_table_columns(&table.name).await;
            table.foreign_keys = self.get_table_foreign_keys(&table.name).await;
            relationships.extend(
                table
                    .foreign_keys
                    .iter()
                    .map(|fk| RelationshipEdge::from((table.name.as_str(), fk))),
            );
        }

        let all_relationships = self.get_all_relationships().await;

        let elapsed = started.elapsed();
        info!(
            database = %database,
            tables = tables.len(),
            relationships = relationships.len(),
            "schema analysis completed in {:.2} seconds",
            elapsed.as_secs_f64()
        );

        Ok(SchemaAnalysis {
            database,
            tables,
            relationships,
            all_relationships,
            elapsed,
        })
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        timeout_ms: u64,
        max_rows: usize,
    ) -> Result<Table, DbError> {
        match self.conn.execute(sql, params, timeout_ms, max_rows).await? {
            QueryOutcome::Rows(table) => Ok(table),
            QueryOutcome::Committed { .. } => Ok(Table::empty()),
        }
    }

    async fn get_database_name(&mut self) -> String {
        self.query(DATABASE_NAME_SQL, &[], DEFAULT_TIMEOUT_MS, DEFAULT_MAX_ROWS)
            .await
            .ok()
            .and_then(|t| t.first().and_then(|r| r.text("db_name")))
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn get_all_tables(&mut self) -> Result<Vec<TableDescriptor>, DbError> {
        let table = self
            .query(TABLES_SQL, &[], TABLES_TIMEOUT_MS, TABLES_MAX_ROWS)
            .await?;
        Ok(table
            .records()
            .filter_map(|r| {
                Some(TableDescriptor {
                    name: r.text("TABLE_NAME")?,
                    rows: r.get("TABLE_ROWS").and_then(Value::as_u64),
                    engine: r.text("ENGINE"),
                    collation: r.text("TABLE_COLLATION"),
                    created: r.get("CREATE_TIME").and_then(Value::as_datetime),
                    columns: Vec::new(),
                    foreign_keys: Vec::new(),
                })
            })
            .collect())
    }

    // A failed or empty lookup means "no columns"; it never aborts the run.
    async fn get_table_columns(&mut self, table_name: &str) -> Vec<ColumnDescriptor> {
        let params = [SqlParam::from(table_name)];
        let table = match self
            .query(COLUMNS_SQL, &params, TABLE_DETAIL_TIMEOUT_MS, DEFAULT_MAX_ROWS)
            .await
        {
            Ok(table) => table,
            Err(err) => {
                warn!(table = table_name, error = %err, "column lookup failed");
                return Vec::new();
            }
        };

        table
            .records()
            .filter_map(|r| {
                Some(ColumnDescriptor {
                    name: r.text("COLUMN_NAME")?,
                    data_type: r.text("COLUMN_TYPE").unwrap_or_default(),
                    nullable: r
                        .text("IS_NULLABLE")
                        .is_some_and(|v| v.eq_ignore_ascii_case("YES")),
                    key: r.text("COLUMN_KEY").unwrap_or_default(),
                    default: r.text("COLUMN_DEFAULT"),
                    extra: r.text("EXTRA").unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn get_table_foreign_keys(&mut self, table_name: &str) -> Vec<ForeignKeyDescriptor> {
        let params = [SqlParam::from(table_name)];
        let table = match self
            .query(FOREIGN_KEYS_SQL, &params, TABLE_DETAIL_TIMEOUT_MS, DEFAULT_MAX_ROWS)
            .await
        {
            Ok(table) => table,
            Err(err) => {
                warn!(table = table_name, error = %err, "foreign key lookup failed");
                return Vec::new();
            }
        };

        table
            .records()
            .filter_map(|r| {
                Some(ForeignKeyDescriptor {
                    column: r.text("COLUMN_NAME")?,
                    referenced_table: r.text("REFERENCED_TABLE_NAME")?,
                    referenced_column: r.text("REFERENCED_COLUMN_NAME").unwrap_or_default(),
                    constraint_name: r.text("CONSTRAINT_NAME").unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn get_all_relationships(&mut self) -> Vec<ReferenceRow> {
        let table = match self
            .query(RELATIONSHIPS_SQL, &[], RELATIONSHIPS_TIMEOUT_MS, DEFAULT_MAX_ROWS)
            .await
        {
            Ok(table) => table,
            Err(err) => {
                warn!(error = %err, "relationship lookup failed");
                return Vec::new();
            }
        };

        table
            .records()
            .filter_map(|r| {
                Some(ReferenceRow {
                    child_table: r.text("child_table")?,
                    child_column: r.text("child_column").unwrap_or_default(),
                    constraint_name: r.text("constraint_name").unwrap_or_default(),
                    parent_table: r.text("parent_table")?,
                    parent_column: r.text("parent_column").unwrap_or_default(),
                })
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{COLLATION, shop_driver, shop_session};
    use super::*;
    use crate::app::db::Session;
    use crate::app::db::testing::ScriptedDriver;

    #[tokio::test]
    async fn builds_nested_schema_record() {
        let mut session = shop_session();
        let analysis = Inspector::new(&mut session, None).analyze().await.unwrap();

        assert_eq!(analysis.database, "shop");
        assert_eq!(analysis.tables_count(), 2);

        let orders = &analysis.tables[0];
        assert_eq!(orders.name, "orders");
        assert_eq!(orders.rows, Some(250));
        assert_eq!(orders.engine.as_deref(), Some("InnoDB"));
        assert_eq!(orders.collation.as_deref(), Some(COLLATION));
        assert_eq!(orders.columns.len(), 3);
        assert_eq!(orders.columns[0].extra, "auto_increment");
        assert!(orders.columns[2].nullable);
        assert_eq!(orders.columns[2].default.as_deref(), Some("new"));
        assert_eq!(
            orders.foreign_keys,
            vec![ForeignKeyDescriptor {
                column: "user_id".into(),
                referenced_table: "users".into(),
                referenced_column: "id".into(),
                constraint_name: "fk_orders_user".into(),
            }]
        );

        let users = &analysis.tables[1];
        assert!(users.foreign_keys.is_empty());
        assert_eq!(users.columns[1].extra, "");

        assert_eq!(
            analysis.relationships,
            vec![RelationshipEdge {
                source_table: "orders".into(),
                source_column: "user_id".into(),
                target_table: "users".into(),
                target_column: "id".into(),
            }]
        );
        assert_eq!(analysis.all_relationships.len(), 1);
    }

    #[tokio::test]
    async fn issues_one_metadata_query_per_step() {
        let mut session = shop_session();
        Inspector::new(&mut session, None).analyze().await.unwrap();
        let fetches = session
            .driver()
            .calls
            .iter()
            .filter(|c| c.starts_with("fetch"))
            .count();
        // database name, table list, 2 x (columns + foreign keys), relationships
        assert_eq!(fetches, 7);
    }

    #[tokio::test]
    async fn limit_truncates_table_list() {
        let mut session = shop_session();
        let analysis = Inspector::new(&mut session, Some(1)).analyze().await.unwrap();

        assert_eq!(analysis.tables_count(), 1);
        assert_eq!(analysis.tables[0].name, "orders");
        // the edge points at a table that is no longer listed
        assert_eq!(analysis.relationships[0].target_table, "users");
    }

    #[tokio::test]
    async fn zero_limit_means_no_limit() {
        let mut session = shop_session();
        let analysis = Inspector::new(&mut session, Some(0)).analyze().await.unwrap();
        assert_eq!(analysis.tables_count(), 2);
    }

    #[tokio::test]
    async fn empty_table_list_aborts() {
        let driver = ScriptedDriver::default()
            .answer("INFORMATION_SCHEMA.TABLES", Some(Table::empty()));
        let mut session = Session::new(driver);
        let err = Inspector::new(&mut session, None).analyze().await.unwrap_err();
        assert!(matches!(err, ReportError::NoTables));
    }

    #[tokio::test]
    async fn failed_table_list_aborts() {
        let mut session = Session::new(ScriptedDriver::default());
        let err = Inspector::new(&mut session, None).analyze().await.unwrap_err();
        assert!(matches!(err, ReportError::NoTables));
    }

    #[tokio::test]
    async fn missing_table_details_do_not_abort() {
        let driver = ScriptedDriver::default().answer(
            "INFORMATION_SCHEMA.TABLES",
            Some(Table::with_rows(
                vec!["TABLE_NAME".into(), "TABLE_ROWS".into()],
                vec![vec![Value::Text("audit_log".into()), Value::Null]],
            )),
        );
        let mut session = Session::new(driver);
        let analysis = Inspector::new(&mut session, None).analyze().await.unwrap();

        assert_eq!(analysis.database, "unknown");
        let audit = &analysis.tables[0];
        assert_eq!(audit.rows, None);
        assert_eq!(audit.engine, None);
        assert_eq!(audit.collation, None);
        assert!(audit.columns.is_empty());
        assert!(audit.foreign_keys.is_empty());
        assert!(analysis.relationships.is_empty());
        assert!(analysis.all_relationships.is_empty());
    }

    #[tokio::test]
    async fn fixture_driver_is_reusable() {
        let first = {
            let mut session = Session::new(shop_driver());
            Inspector::new(&mut session, None).analyze().await.unwrap()
        };
        let second = {
            let mut session = Session::new(shop_driver());
            Inspector::new(&mut session, None).analyze().await.unwrap()
        };
        assert_eq!(first.tables, second.tables);
        assert_eq!(first.all_relationships, second.all_relationships);
    }
}
