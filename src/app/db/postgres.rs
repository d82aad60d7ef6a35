use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection};
use sqlx::query::Query;
use sqlx::{ConnectOptions, Connection as _, Postgres};

use crate::app::config::PgSettings;
use crate::app::db::decode::{collect_table, pg_cell};
use crate::app::db::{Backend, Driver, SqlParam};
use crate::app::error::DbError;
use crate::app::models::Table;

const BACKEND: Backend = Backend::Postgres;

pub struct PgDriver {
    settings: PgSettings,
    conn: Option<PgConnection>,
}

impl PgDriver {
    pub fn new(settings: PgSettings) -> Self {
        Self {
            settings,
            conn: None,
        }
    }

    fn conn(&mut self) -> Result<&mut PgConnection, DbError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::connect(BACKEND, "connection is not open"))
    }

    fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.settings.host)
            .port(self.settings.port);
        if let Some(user) = &self.settings.user {
            options = options.username(user);
        }
        if let Some(password) = &self.settings.password {
            options = options.password(password);
        }
        if let Some(database) = &self.settings.database {
            options = options.database(database);
        }
        options
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
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

impl Driver for PgDriver {
    fn backend(&self) -> Backend {
        BACKEND
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn open(&mut self) -> Result<(), DbError> {
        let options = self.connect_options();
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

    // No server-side row cap; `fetch` stops reading after `max_rows`.
    async fn apply_limits(&mut self, timeout_ms: u64, _max_rows: usize) -> Result<(), DbError> {
        let sql = format!("SET statement_timeout = {timeout_ms}");
        sqlx::raw_sql(&sql)
            .execute(self.conn()?)
            .await
            .map_err(|e| DbError::execute(BACKEND, e))?;
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
            collect_table(BACKEND, rows, max_rows, pg_cell).await
        } else {
            let rows = bind_params(sqlx::query(sql), params).fetch(conn);
            collect_table(BACKEND, rows, max_rows, pg_cell).await
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
