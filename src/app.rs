pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod formatter;
pub mod inspector;
pub mod models;
pub mod queries;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::Parser;
use tracing::{error, info, warn};

use self::cli::{Cli, Command, QueryArgs, SchemaArgs};
use self::config::{Settings, resolve_config};
use self::db::{
    Connection, QueryOutcome, Session, SqlExecutor, execute_on_databases, mysql::MySqlDriver,
};
use self::error::DbError;
use self::formatter::OutputGenerator;
use self::inspector::Inspector;
use self::models::{SchemaAnalysis, Table};
use self::queries::QueryLibrary;

#[derive(Debug, Clone, PartialEq)]
pub struct ReportPaths {
    pub schema: PathBuf,
    pub erd: PathBuf,
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();
}

/// Analyzes through an already-open executor and writes both report files.
pub async fn write_reports<E: SqlExecutor>(
    conn: &mut E,
    limit: Option<usize>,
    output_dir: &Path,
    schema_file: &str,
    erd_file: &str,
) -> Result<(SchemaAnalysis, ReportPaths)> {
    // 1. Scan (Inspector)
    let analysis = Inspector::new(conn, limit)
        .analyze()
        .await
        .context("Schema analysis failed")?;

    // 2. Format (OutputGenerator)
    let schema = OutputGenerator::generate_schema_listing(&analysis)?;
    let erd = OutputGenerator::generate_reference_diagram(&analysis)?;

    // 3. Write
    let paths = ReportPaths {
        schema: OutputGenerator::write_report(output_dir, schema_file, &schema)?,
        erd: OutputGenerator::write_report(output_dir, erd_file, &erd)?,
    };
    Ok((analysis, paths))
}

// Connects, Scans, Formats and Writes in one go.
pub async fn generate_report(settings: &Settings, args: &SchemaArgs) -> Result<ReportPaths> {
    // 1. Connect
    let mut session = Session::new(MySqlDriver::new(settings.mysql.for_schema_analysis()));
    session
        .connect()
        .await
        .context("Failed to connect to database")?;

    // 2. Scan, Format, Write
    let result = write_reports(
        &mut session,
        args.limit,
        &settings.output_dir,
        &args.schema_file,
        &args.erd_file,
    )
    .await;

    session.disconnect().await;
    let (analysis, paths) = result?;
    info!(
        database = %analysis.database,
        tables = analysis.tables_count(),
        schema = %paths.schema.display(),
        erd = %paths.erd.display(),
        "schema reports written"
    );
    Ok(paths)
}

/// Outcome per target database. `Ok(None)` means the statement was a write.
pub type QueryResults = Vec<(String, Result<Option<Table>, DbError>)>;

/// Runs `sql` once, or once per entry of `databases` after switching to it.
/// A failure on one database never discards the results of the others.
pub async fn run_query<E: SqlExecutor>(
    conn: &mut E,
    sql: &str,
    databases: &[String],
    timeout_ms: u64,
    max_rows: usize,
) -> QueryResults {
    let backend = conn.backend();
    info!(%backend, databases = databases.len(), "executing query");
    let outcomes = if databases.is_empty() {
        vec![(
            backend.to_string(),
            conn.execute(sql, &[], timeout_ms, max_rows).await,
        )]
    } else {
        execute_on_databases(conn, sql, databases, &[], timeout_ms, max_rows).await
    };

    outcomes
        .into_iter()
        .map(|(label, outcome)| {
            let table = outcome.map(|outcome| {
                if let QueryOutcome::Committed { rows_affected } = &outcome {
                    info!(target_db = %label, rows_affected, "statement committed");
                }
                outcome.into_table()
            });
            (label, table)
        })
        .collect()
}

/// Where `save_query_results` put each table, and which targets failed.
#[derive(Debug, Default, PartialEq)]
pub struct SavedResults {
    pub saved: Vec<PathBuf>,
    pub failed: Vec<String>,
}

/// Prints every table and saves it as JSON under `output_dir`, one
/// subdirectory per label when `per_database` is set.
pub fn save_query_results(
    results: QueryResults,
    query_name: &str,
    output_dir: &Path,
    per_database: bool,
    date: NaiveDate,
) -> Result<SavedResults> {
    let mut summary = SavedResults::default();
    for (label, outcome) in results {
        match outcome {
            Ok(Some(table)) if !table.is_empty() => {
                println!("\nQuery Results ({label}):");
                print!("{}", OutputGenerator::render_table(&table)?);
                let dir = if per_database {
                    output_dir.join(&label)
                } else {
                    output_dir.to_path_buf()
                };
                let path = export::save_results(&table, query_name, &dir, date)?;
                println!("Results saved to: {}", path.display());
                summary.saved.push(path);
            }
            Ok(Some(_)) => {
                warn!(target_db = %label, "query returned no results");
                println!("\nNo results returned from query on {label}.");
            }
            Ok(None) => println!("\nStatement committed on {label}."),
            Err(err) => {
                error!(target_db = %label, error = %err, "query failed");
                println!("\nQuery failed on {label}: {err}");
                summary.failed.push(label);
            }
        }
    }
    Ok(summary)
}

async fn query_command(settings: &Settings, args: &QueryArgs) -> Result<()> {
    let library = QueryLibrary::new(&settings.query_dir);

    if args.list {
        let available = library.list()?;
        if available.is_empty() {
            println!("No queries available in {}.", library.dir().display());
        } else {
            println!("Available queries:");
            for query in available {
                println!("  - {query}");
            }
        }
        return Ok(());
    }

    let Some(name) = args.query.as_deref() else {
        bail!("--query is required unless --list is given");
    };
    let sql = library.load(name).with_context(|| {
        format!("Could not load query: {name}. Use --list to see available queries")
    })?;

    println!("Executing query '{name}' against {} database...", args.db);
    let mut conn = Connection::open(args.db, settings)
        .await
        .with_context(|| format!("Failed to connect to {} database", args.db))?;
    let results = run_query(
        &mut conn,
        &sql,
        &args.databases,
        args.timeout_ms,
        args.max_rows,
    )
    .await;
    conn.disconnect().await;

    let today = chrono::Local::now().date_naive();
    let summary = save_query_results(
        results,
        name,
        &settings.output_dir,
        !args.databases.is_empty(),
        today,
    )?;
    if !summary.failed.is_empty() {
        bail!("Query failed on {}", summary.failed.join(", "));
    }
    Ok(())
}

pub async fn run() -> Result<()> {
    // 1. Parse Args
    let args = Cli::parse();
    init_tracing();

    // 2. Resolve Config
    let settings = resolve_config(&args)?;

    // 3. Dispatch
    match &args.command {
        Command::Query(query) => query_command(&settings, query).await,
        Command::Schema(schema) => {
            println!("Starting MySQL schema analysis...");
            let paths = generate_report(&settings, schema).await?;
            println!(
                "Schema analysis complete. Results saved to: {}",
                paths.schema.display()
            );
            println!("ERD generation complete. Saved to: {}", paths.erd.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::db::testing::ScriptedDriver;
    use crate::app::inspector::fixtures::shop_session;
    use crate::app::models::Value;

    fn region_session() -> Session<ScriptedDriver> {
        let driver = ScriptedDriver {
            missing_databases: vec!["apac".to_string()],
            ..ScriptedDriver::default()
        }
        .answer(
            "FROM orders",
            Some(Table::with_rows(
                vec!["status".into(), "n".into()],
                vec![vec![Value::Text("paid".into()), Value::Int(7)]],
            )),
        );
        Session::new(driver)
    }

    fn regions(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn writes_both_reports_into_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = shop_session();
        let (analysis, paths) =
            write_reports(&mut session, None, dir.path(), "schema.txt", "erd.txt")
                .await
                .unwrap();

        assert_eq!(analysis.tables_count(), 2);
        assert_eq!(paths.schema, dir.path().join("schema.txt"));
        let schema = std::fs::read_to_string(&paths.schema).unwrap();
        let erd = std::fs::read_to_string(&paths.erd).unwrap();
        assert!(schema.contains("TABLE: orders"));
        assert!(erd.contains("Table 'users' is referenced by:"));
    }

    #[tokio::test]
    async fn failed_analysis_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(ScriptedDriver::default());
        let err = write_reports(&mut session, None, dir.path(), "schema.txt", "erd.txt")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Schema analysis failed"));
        assert!(!dir.path().join("schema.txt").exists());
    }

    #[tokio::test]
    async fn one_failed_database_keeps_the_others() {
        let mut session = region_session();
        let sql = "SELECT status, COUNT(*) AS n FROM orders GROUP BY status";
        let targets = regions(&["eu", "apac", "us"]);
        let results = run_query(&mut session, sql, &targets, 3000, 100).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "eu");
        assert_eq!(results[0].1.as_ref().unwrap().as_ref().unwrap().len(), 1);
        assert!(matches!(results[1].1, Err(DbError::Execute { .. })));
        assert!(results[2].1.as_ref().unwrap().is_some());
    }

    #[tokio::test]
    async fn successful_tables_are_saved_next_to_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = region_session();
        let results = run_query(
            &mut session,
            "SELECT * FROM orders",
            &regions(&["eu", "apac"]),
            3000,
            100,
        )
        .await;
        let date = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let summary =
            save_query_results(results, "orders_by_status", dir.path(), true, date).unwrap();

        assert_eq!(summary.failed, vec!["apac"]);
        assert_eq!(
            summary.saved,
            vec![dir.path().join("eu").join("orders_by_status_2024-06-30.json")]
        );
        assert!(summary.saved[0].exists());
        assert!(!dir.path().join("apac").exists());
    }

    #[tokio::test]
    async fn single_target_is_labelled_by_backend() {
        let mut session = region_session();
        let results = run_query(&mut session, "UPDATE orders SET n = 0", &[], 3000, 100).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "mysql");
        assert!(matches!(results[0].1, Ok(None)));
    }
}
