//! Connection facade over MySQL, PostgreSQL and Snowflake.
//!
//! Each backend supplies a [`Driver`] with the engine-specific primitives
//! (open, session limits, fetch, write-and-commit, close). [`Session`] wraps a
//! driver with the behaviour shared by all of them: lazy connect, statement
//! classification, logging and the [`QueryOutcome`] contract.

mod decode;
pub mod mysql;
pub mod postgres;
pub mod snowflake;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::app::config::Settings;
use crate::app::error::DbError;
use crate::app::models::Table;

use self::mysql::MySqlDriver;
use self::postgres::PgDriver;
use self::snowflake::SnowflakeDriver;

pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_MAX_ROWS: usize = 1000;

const READ_PREFIXES: [&str; 5] = ["select", "show", "describe", "explain", "with"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    MySql,
    Postgres,
    Snowflake,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::MySql, Backend::Postgres, Backend::Snowflake];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::MySql => "mysql",
            Backend::Postgres => "postgres",
            Backend::Snowflake => "snowflake",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported database type: {tag}. Supported types: mysql, postgres, snowflake")]
pub struct ParseBackendError {
    pub tag: String,
}

impl FromStr for Backend {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Backend::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseBackendError { tag: s.to_string() })
    }
}

/// Positional statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        SqlParam::Text(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        SqlParam::Text(v)
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::Int(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Result of a read-style statement; may hold zero rows.
    Rows(Table),
    /// A write-style statement ran and was committed.
    Committed { rows_affected: u64 },
}

impl QueryOutcome {
    pub fn into_table(self) -> Option<Table> {
        match self {
            QueryOutcome::Rows(table) => Some(table),
            QueryOutcome::Committed { .. } => None,
        }
    }

    pub fn table(&self) -> Option<&Table> {
        match self {
            QueryOutcome::Rows(table) => Some(table),
            QueryOutcome::Committed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

impl StatementKind {
    /// Read-style when the statement, after leading comments and whitespace,
    /// starts with one of `select`, `show`, `describe`, `explain`, `with`.
    pub fn classify(sql: &str) -> Self {
        let head = strip_leading_comments(sql).to_ascii_lowercase();
        if READ_PREFIXES.iter().any(|p| head.starts_with(p)) {
            StatementKind::Read
        } else {
            StatementKind::Write
        }
    }
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = match after.find('\n') {
                Some(pos) => after[pos + 1..].trim_start(),
                None => "",
            };
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = match after.find("*/") {
                Some(pos) => after[pos + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest;
        }
    }
}

/// Engine-specific primitives composed by [`Session`].
#[allow(async_fn_in_trait)]
pub trait Driver {
    fn backend(&self) -> Backend;

    /// Whether `use_database` can change the database of an open connection.
    const SWITCHES_DATABASE: bool = false;

    fn is_open(&self) -> bool;

    async fn open(&mut self) -> Result<(), DbError>;

    async fn use_database(&mut self, _database: &str) -> Result<(), DbError> {
        Err(DbError::Unsupported {
            backend: self.backend(),
            operation: "switching databases",
        })
    }

    /// Applies the statement timeout and, where the engine has one, the
    /// server-side row cap for the next statement.
    async fn apply_limits(&mut self, timeout_ms: u64, max_rows: usize) -> Result<(), DbError>;

    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        max_rows: usize,
    ) -> Result<Table, DbError>;

    /// Runs the statement and commits it, returning the affected row count.
    async fn write_and_commit(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError>;

    async fn close(&mut self) -> Result<(), DbError>;
}

/// Connect / execute / disconnect capability shared by every backend.
#[allow(async_fn_in_trait)]
pub trait SqlExecutor {
    fn backend(&self) -> Backend;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), DbError>;

    async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        timeout_ms: u64,
        max_rows: usize,
    ) -> Result<QueryOutcome, DbError>;

    /// Points the open connection at another database.
    async fn switch_database(&mut self, database: &str) -> Result<(), DbError>;

    async fn disconnect(&mut self);
}

pub struct Session<D> {
    driver: D,
}

impl<D: Driver> Session<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    async fn ensure_open(&mut self) -> Result<(), DbError> {
        if self.driver.is_open() {
            return Ok(());
        }
        self.connect().await
    }
}

impl<D: Driver> SqlExecutor for Session<D> {
    fn backend(&self) -> Backend {
        self.driver.backend()
    }

    fn is_connected(&self) -> bool {
        self.driver.is_open()
    }

    async fn connect(&mut self) -> Result<(), DbError> {
        let backend = self.driver.backend();
        match self.driver.open().await {
            Ok(()) => {
                info!(%backend, "database connection opened");
                Ok(())
            }
            Err(err) => {
                error!(%backend, error = %err, "failed to connect");
                Err(err)
            }
        }
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        timeout_ms: u64,
        max_rows: usize,
    ) -> Result<QueryOutcome, DbError> {
        self.ensure_open().await?;
        let backend = self.driver.backend();

        if let Err(err) = self.driver.apply_limits(timeout_ms, max_rows).await {
            warn!(%backend, error = %err, "failed to set execution parameters");
        }

        let kind = StatementKind::classify(sql);
        debug!(%backend, ?kind, params = params.len(), "executing statement");

        let outcome = match kind {
            StatementKind::Read => self
                .driver
                .fetch(sql, params, max_rows)
                .await
                .map(QueryOutcome::Rows),
            StatementKind::Write => self
                .driver
                .write_and_commit(sql, params)
                .await
                .map(|rows_affected| QueryOutcome::Committed { rows_affected }),
        };

        if let Err(err) = &outcome {
            error!(%backend, error = %err, "query execution failed");
        }
        outcome
    }

    async fn switch_database(&mut self, database: &str) -> Result<(), DbError> {
        if !D::SWITCHES_DATABASE {
            return Err(DbError::Unsupported {
                backend: self.driver.backend(),
                operation: "switching databases",
            });
        }
        self.ensure_open().await?;
        self.driver.use_database(database).await.inspect_err(|err| {
            error!(database, error = %err, "failed to switch database");
        })
    }

    async fn disconnect(&mut self) {
        if !self.driver.is_open() {
            return;
        }
        let backend = self.driver.backend();
        match self.driver.close().await {
            Ok(()) => info!(%backend, "database connection closed"),
            Err(err) => error!(%backend, error = %err, "error closing connection"),
        }
    }
}

/// A connection to one of the supported backends.
pub enum Connection {
    MySql(Session<MySqlDriver>),
    Postgres(Session<PgDriver>),
    Snowflake(Session<SnowflakeDriver>),
}

impl Connection {
    /// Builds a connection without opening it; the first `execute` connects.
    pub fn new(backend: Backend, settings: &Settings) -> Self {
        match backend {
            Backend::MySql => Connection::MySql(Session::new(MySqlDriver::new(
                settings.mysql.clone(),
            ))),
            Backend::Postgres => Connection::Postgres(Session::new(PgDriver::new(
                settings.postgres.clone(),
            ))),
            Backend::Snowflake => Connection::Snowflake(Session::new(SnowflakeDriver::new(
                settings.snowflake.clone(),
            ))),
        }
    }

    /// Builds and eagerly opens a connection.
    pub async fn open(backend: Backend, settings: &Settings) -> Result<Self, DbError> {
        info!(%backend, "getting connection");
        let mut conn = Self::new(backend, settings);
        conn.connect().await?;
        Ok(conn)
    }
}

impl SqlExecutor for Connection {
    fn backend(&self) -> Backend {
        match self {
            Connection::MySql(s) => s.backend(),
            Connection::Postgres(s) => s.backend(),
            Connection::Snowflake(s) => s.backend(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Connection::MySql(s) => s.is_connected(),
            Connection::Postgres(s) => s.is_connected(),
            Connection::Snowflake(s) => s.is_connected(),
        }
    }

    async fn connect(&mut self) -> Result<(), DbError> {
        match self {
            Connection::MySql(s) => s.connect().await,
            Connection::Postgres(s) => s.connect().await,
            Connection::Snowflake(s) => s.connect().await,
        }
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        timeout_ms: u64,
        max_rows: usize,
    ) -> Result<QueryOutcome, DbError> {
        match self {
            Connection::MySql(s) => s.execute(sql, params, timeout_ms, max_rows).await,
            Connection::Postgres(s) => s.execute(sql, params, timeout_ms, max_rows).await,
            Connection::Snowflake(s) => s.execute(sql, params, timeout_ms, max_rows).await,
        }
    }

    async fn switch_database(&mut self, database: &str) -> Result<(), DbError> {
        match self {
            Connection::MySql(s) => s.switch_database(database).await,
            Connection::Postgres(s) => s.switch_database(database).await,
            Connection::Snowflake(s) => s.switch_database(database).await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Connection::MySql(s) => s.disconnect().await,
            Connection::Postgres(s) => s.disconnect().await,
            Connection::Snowflake(s) => s.disconnect().await,
        }
    }
}

/// Runs the same statement against each database in turn, in the given order.
/// A failed switch or execution is recorded for that database and the run
/// moves on to the next one.
pub async fn execute_on_databases<E: SqlExecutor>(
    conn: &mut E,
    sql: &str,
    databases: &[String],
    params: &[SqlParam],
    timeout_ms: u64,
    max_rows: usize,
) -> Vec<(String, Result<QueryOutcome, DbError>)> {
    let mut results = Vec::with_capacity(databases.len());
    for database in databases {
        info!(database = %database, "executing query on database");
        let outcome = match conn.switch_database(database).await {
            Ok(()) => conn.execute(sql, params, timeout_ms, max_rows).await,
            Err(err) => Err(err),
        };
        results.push((database.clone(), outcome));
    }
    results
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedDriver;
    use super::*;
    use crate::app::models::Value;

    #[test]
    fn classifies_read_prefixes() {
        for sql in [
            "SELECT 1",
            "  show tables",
            "Describe users",
            "EXPLAIN SELECT * FROM t",
            "WITH x AS (SELECT 1) SELECT * FROM x",
        ] {
            assert_eq!(StatementKind::classify(sql), StatementKind::Read, "{sql}");
        }
        for sql in [
            "INSERT INTO t VALUES (1)",
            "update t set a = 1",
            "CREATE TABLE t (a int)",
            "",
        ] {
            assert_eq!(StatementKind::classify(sql), StatementKind::Write, "{sql}");
        }
    }

    #[test]
    fn classification_skips_leading_comments() {
        assert_eq!(
            StatementKind::classify("-- monthly totals\n-- owner: finance\nSELECT 1"),
            StatementKind::Read
        );
        assert_eq!(
            StatementKind::classify("/* header */\n  select 1"),
            StatementKind::Read
        );
        assert_eq!(
            StatementKind::classify("-- cleanup\nDELETE FROM t"),
            StatementKind::Write
        );
        assert_eq!(StatementKind::classify("-- only a comment"), StatementKind::Write);
    }

    #[test]
    fn backend_tags_parse_case_insensitively() {
        assert_eq!("MySQL".parse::<Backend>(), Ok(Backend::MySql));
        assert_eq!("postgres".parse::<Backend>(), Ok(Backend::Postgres));
        assert_eq!(" Snowflake ".parse::<Backend>(), Ok(Backend::Snowflake));
        let err = "oracle".parse::<Backend>().unwrap_err();
        assert!(err.to_string().contains("mysql, postgres, snowflake"));
    }

    #[tokio::test]
    async fn write_statements_commit_and_return_no_table() {
        let mut session = Session::new(ScriptedDriver::default());
        let outcome = session
            .execute("UPDATE users SET active = 0", &[], DEFAULT_TIMEOUT_MS, DEFAULT_MAX_ROWS)
            .await
            .unwrap();

        assert_eq!(outcome, QueryOutcome::Committed { rows_affected: 1 });
        assert!(outcome.into_table().is_none());
        let calls = &session.driver().calls;
        assert!(calls.iter().any(|c| c == "commit"));
        assert!(!calls.iter().any(|c| c.starts_with("fetch")));
    }

    #[tokio::test]
    async fn read_with_no_rows_returns_empty_table() {
        let driver = ScriptedDriver::default().answer("FROM users", Some(Table::empty()));
        let mut session = Session::new(driver);
        let outcome = session
            .execute("SELECT * FROM users WHERE 1 = 0", &[], 3000, 10)
            .await
            .unwrap();

        let table = outcome.into_table().expect("read must yield a table");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn connects_lazily_and_once() {
        let driver = ScriptedDriver::default().answer(
            "SELECT 1",
            Some(Table::with_rows(vec!["1".into()], vec![vec![Value::Int(1)]])),
        );
        let mut session = Session::new(driver);
        assert!(!session.is_connected());

        session.execute("SELECT 1", &[], 3000, 10).await.unwrap();
        session.execute("SELECT 1", &[], 3000, 10).await.unwrap();

        assert!(session.is_connected());
        let opens = session.driver().calls.iter().filter(|c| *c == "open").count();
        assert_eq!(opens, 1);
    }

    #[tokio::test]
    async fn failed_open_is_an_error_not_a_panic() {
        let driver = ScriptedDriver {
            fail_open: true,
            ..Default::default()
        };
        let mut session = Session::new(driver);
        let err = session.execute("SELECT 1", &[], 3000, 10).await.unwrap_err();
        assert!(matches!(err, DbError::Connect { .. }));
    }

    #[tokio::test]
    async fn limit_failures_do_not_block_execution() {
        let driver = ScriptedDriver {
            fail_limits: true,
            ..Default::default()
        }
        .answer("SELECT", Some(Table::empty()));
        let mut session = Session::new(driver);
        let outcome = session.execute("SELECT 2", &[], 1500, 5).await.unwrap();
        assert!(outcome.table().is_some());
        assert!(session.driver().calls.contains(&"limits 1500 5".to_string()));
    }

    #[tokio::test]
    async fn execution_failure_is_reported_as_error() {
        let mut session = Session::new(ScriptedDriver::default());
        let err = session.execute("SELECT * FROM missing", &[], 3000, 10).await.unwrap_err();
        assert!(matches!(err, DbError::Execute { .. }));
    }

    fn regional_driver() -> ScriptedDriver {
        ScriptedDriver::default().answer(
            "FROM orders",
            Some(Table::with_rows(vec!["n".into()], vec![vec![Value::Int(3)]])),
        )
    }

    #[tokio::test]
    async fn databases_run_in_order_each_after_use() {
        let mut session = Session::new(regional_driver());
        let databases = vec!["eu".to_string(), "us".to_string()];
        let results = execute_on_databases(
            &mut session,
            "SELECT COUNT(*) AS n FROM orders",
            &databases,
            &[],
            3000,
            10,
        )
        .await;

        let labels: Vec<&str> = results.iter().map(|(db, _)| db.as_str()).collect();
        assert_eq!(labels, ["eu", "us"]);
        assert!(results.iter().all(|(_, outcome)| outcome.is_ok()));

        let calls: Vec<&str> = session
            .driver()
            .calls
            .iter()
            .map(String::as_str)
            .filter(|c| c.starts_with("use") || c.starts_with("fetch"))
            .collect();
        assert_eq!(
            calls,
            [
                "use eu",
                "fetch SELECT COUNT(*) AS n FROM orders",
                "use us",
                "fetch SELECT COUNT(*) AS n FROM orders",
            ]
        );
    }

    #[tokio::test]
    async fn failed_switch_only_fails_that_database() {
        let driver = ScriptedDriver {
            missing_databases: vec!["apac".to_string()],
            ..regional_driver()
        };
        let mut session = Session::new(driver);
        let databases = vec!["eu".to_string(), "apac".to_string(), "us".to_string()];
        let results =
            execute_on_databases(&mut session, "SELECT * FROM orders", &databases, &[], 3000, 10)
                .await;

        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(DbError::Execute { .. })));
        assert!(results[2].1.is_ok());
        let fetches = session
            .driver()
            .calls
            .iter()
            .filter(|c| c.starts_with("fetch"))
            .count();
        assert_eq!(fetches, 2);
    }

    #[tokio::test]
    async fn switching_is_mysql_only() {
        let settings = Settings::from_lookup(|_| None).unwrap();
        for backend in [Backend::Postgres, Backend::Snowflake] {
            let mut conn = Connection::new(backend, &settings);
            let err = conn.switch_database("analytics").await.unwrap_err();
            assert!(
                matches!(err, DbError::Unsupported { backend: b, .. } if b == backend),
                "{backend}"
            );
            assert!(!conn.is_connected());
        }
    }

    #[tokio::test]
    async fn disconnect_swallows_close_errors() {
        let mut session = Session::new(ScriptedDriver::default());
        session.connect().await.unwrap();
        session.disconnect().await;
        assert!(!session.is_connected());
        assert!(session.driver().calls.contains(&"close".to_string()));
    }
}
