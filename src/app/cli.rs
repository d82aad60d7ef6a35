use crate::app::db::{Backend, DEFAULT_MAX_ROWS, DEFAULT_TIMEOUT_MS};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory for reports and saved results. Falls back to OUTPUT_DIR.
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Directory of named .sql files. Falls back to QUERY_DIR.
    #[arg(long, global = true)]
    pub query_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a saved or ad hoc query and print the result.
    Query(QueryArgs),
    /// Analyze the MySQL schema and write the schema and reference reports.
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Database type to connect to: mysql, postgres or snowflake.
    #[arg(short, long, default_value = "mysql")]
    pub db: Backend,

    /// Name of a query in the query directory, or a path to a .sql file.
    #[arg(short, long, required_unless_present = "list")]
    pub query: Option<String>,

    /// List the queries available in the query directory.
    #[arg(short, long)]
    pub list: bool,

    /// MySQL database(s) to switch to before running; repeat for several.
    #[arg(long = "database")]
    pub databases: Vec<String>,

    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_ROWS)]
    pub max_rows: usize,
}

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Only analyze the first N tables.
    #[arg(short, long)]
    pub limit: Option<usize>,

    #[arg(long, default_value = "mysql_data_schema.txt")]
    pub schema_file: String,

    #[arg(long, default_value = "mysql_data_erd.txt")]
    pub erd_file: String,
}
