use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection};
use sqlx::query::Query;
use sqlx::{ConnectOptions, Connection as _, MySql};
use tracing::debug;

use crate::app::config::MySqlSettings;
use crate::app::db::decode::{collect_table, mysql_cell};
use crate::app::db::{Backend, Driver, SqlParam};
use crate::app::error::DbError;
use crate::app::models::Table;

const BACKEND: Backend = Backend::MySql;

pub struct MySqlDriver {
    settings: MySqlSettings,
    conn: Option<MySqlConnection>,
}

impl MySqlDriver {
    pub fn new(settings: MySqlSettings) -> Self {
        Self {
            settings,
            conn: None,
        }
    }

    fn conn(&mut self) -> Result<&mut MySqlConnection, DbError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::connect(BACKEND, "connection is not open"))
    }
}

/// Back-quotes an identifier, doubling embedded back-quotes.
fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn bind_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [SqlParam],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Float(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

impl Driver for MySqlDriver {
    const SWITCHES_DATABASE: bool = true;

    fn backend(&self) -> Backend {
        BACKEND
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn open(&mut self) -> Result<(), DbError> {
        let mut options = MySqlConnectOptions::new()
            .host(&self.settings.host)
            .port(self.settings.port)
            .username(&self.settings.user)
            .password(&self.settings.password);
        if let Some(database) = &self.settings.database {
            options = options.database(database);
        }

        debug!(url = %self.settings.url(), "connecting");
        let conn = tokio::time::timeout(self.settings.connect_timeout, options.connect())
            .await
            .map_err(|_| {
                DbError::connect(
                    BACKEND,
                    format!("timed out after {:?}", self.settings.connect_timeout),
                )
            })?
            .map_err(|e| DbError::connect(BACKEND, e))?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn use_database(&mut self, database: &str) -> Result<(), DbError> {
        let sql = format!("USE {}", quote_identifier(database));
        sqlx::raw_sql(&sql)
            .execute(self.conn()?)
            .await
            .map_err(|e| DbError::execute(BACKEND, e))?;
        self.settings.database = Some(database.to_string());
        Ok(())
    }

    async fn apply_limits(&mut self, timeout_ms: u64, max_rows: usize) -> Result<(), DbError> {
        for sql in [
            format!("SET SESSION MAX_EXECUTION_TIME={timeout_ms}"),
            format!("SET SESSION SQL_SELECT_LIMIT={max_rows}"),
        ] {
            sqlx::raw_sql(&sql)
                .execute(self.conn()?)
                .await
                .map_err(|e| DbError::execute(BACKEND, e))?;
        }
        Ok(())
    }

    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        max_rows: usize,
    ) -> Result<Table, DbError> {
        let conn = self.conn()?;
        if params.is_empty() {
            let rows = sqlx::raw_sql(sql).fetch(conn);
            collect_table(BACKEND, rows, max_rows, mysql_cell).await
        } else {
            let rows = bind_params(sqlx::query(sql), params).fetch(conn);
            collect_table(BACKEND, rows, max_rows, mysql_cell).await
        }
    }

    async fn write_and_commit(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError> {
        let mut tx = self
            .conn()?
            .begin()
            .await
            .map_err(|e| DbError::execute(BACKEND, e))?;
        let executed = if params.is_empty() {
            sqlx::raw_sql(sql).execute(&mut *tx).await
        } else {
            bind_params(sqlx::query(sql), params).execute(&mut *tx).await
        };
        let result = executed.map_err(|e| DbError::execute(BACKEND, e))?;
        tx.commit().await.map_err(|e| DbError::execute(BACKEND, e))?;
        Ok(result.rows_affected())
    }

    async fn close(&mut self) -> Result<(), DbError> {
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(|e| DbError::execute(BACKEND, e)),
            None => Ok(()),
        }
    }
}
