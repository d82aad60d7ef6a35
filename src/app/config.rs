use crate::app::cli::Cli;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const SCHEMA_ANALYSIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_OUTPUT_DIR: &str = "output";
const DEFAULT_QUERY_DIR: &str = "queries";

#[derive(Debug, Clone, PartialEq)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub connect_timeout: Duration,
}

impl MySqlSettings {
    /// Metadata queries get the longer connect timeout.
    pub fn for_schema_analysis(&self) -> Self {
        Self {
            connect_timeout: SCHEMA_ANALYSIS_CONNECT_TIMEOUT,
            ..self.clone()
        }
    }

    pub fn url(&self) -> String {
        format!(
            "mysql://{}@{}:{}/{}",
            self.user,
            self.host,
            self.port,
            self.database.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnowflakeSettings {
    pub account: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub request_timeout: Duration,
}

/// Process-wide settings, built once and passed by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub mysql: MySqlSettings,
    pub postgres: PgSettings,
    pub snowflake: SnowflakeSettings,
    pub output_dir: PathBuf,
    pub query_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let port = |key: &str, default: u16| -> Result<u16> {
            match get(key) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{key} must be a port number, got {raw:?}")),
                None => Ok(default),
            }
        };

        Ok(Self {
            mysql: MySqlSettings {
                host: get("MYSQL_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: port("MYSQL_PORT", 3306)?,
                user: get("MYSQL_USER").unwrap_or_else(|| "root".to_string()),
                password: get("MYSQL_PASSWORD").unwrap_or_default(),
                database: get("MYSQL_DATABASE"),
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            },
            postgres: PgSettings {
                host: get("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: port("POSTGRES_PORT", 5432)?,
                user: get("POSTGRES_USER"),
                password: get("POSTGRES_PASSWORD"),
                database: get("POSTGRES_DATABASE"),
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            },
            snowflake: SnowflakeSettings {
                account: get("SNOWFLAKE_ACCOUNT"),
                user: get("SNOWFLAKE_USER"),
                password: get("SNOWFLAKE_PASSWORD"),
                warehouse: get("SNOWFLAKE_WAREHOUSE"),
                database: get("SNOWFLAKE_DATABASE"),
                schema: get("SNOWFLAKE_SCHEMA"),
                request_timeout: SCHEMA_ANALYSIS_CONNECT_TIMEOUT,
            },
            output_dir: get("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            query_dir: get("QUERY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_QUERY_DIR)),
        })
    }
}

pub fn resolve_config(cli: &Cli) -> Result<Settings> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let mut settings = Settings::from_env().context("Invalid database settings in environment")?;

    if let Some(dir) = &cli.output_dir {
        settings.output_dir = dir.clone();
    }
    if let Some(dir) = &cli.query_dir {
        settings.query_dir = dir.clone();
    }

    Ok(settings)
}
