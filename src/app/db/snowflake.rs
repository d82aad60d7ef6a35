//! Snowflake over its session REST endpoints (`login-request`,
//! `query-request`), asking for JSON row sets.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta};
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::config::SnowflakeSettings;
use crate::app::db::{Backend, Driver, SqlParam};
use crate::app::error::DbError;
use crate::app::models::{Table, Value};

const BACKEND: Backend = Backend::Snowflake;
const CLIENT_APP_ID: &str = "sql-analytics";
const SNOWFLAKE_ACCEPT: &str = "application/snowflake";

pub struct SnowflakeDriver {
    settings: SnowflakeSettings,
    session: Option<RestSession>,
}

struct RestSession {
    client: Client,
    base_url: String,
    token: String,
    sequence_id: u64,
}

#[derive(Deserialize, Debug)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    success: bool,
    message: Option<String>,
    code: Option<String>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, DbError> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(DbError::execute(
                BACKEND,
                format!(
                    "{} (code {})",
                    self.message.unwrap_or_else(|| "request failed".to_string()),
                    self.code.unwrap_or_else(|| "none".to_string())
                ),
            )),
        }
    }
}

#[derive(Deserialize, Debug)]
struct LoginData {
    token: String,
}

#[derive(Deserialize, Debug, Clone)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    scale: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct QueryStats {
    #[serde(default)]
    num_rows_inserted: u64,
    #[serde(default)]
    num_rows_updated: u64,
    #[serde(default)]
    num_rows_deleted: u64,
}

/// A further slice of a large result, stored behind a presigned URL.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Chunk {
    url: String,
    #[serde(default)]
    row_count: usize,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    #[serde(default)]
    rowtype: Vec<RowType>,
    rowset: Option<Vec<Vec<JsonValue>>>,
    rowset_base64: Option<String>,
    #[serde(default)]
    chunks: Vec<Chunk>,
    chunk_headers: Option<BTreeMap<String, String>>,
    qrmk: Option<String>,
    total: Option<u64>,
    stats: Option<QueryStats>,
}

impl QueryData {
    /// Headers the chunk store expects: explicit ones when the server sends
    /// them, otherwise the SSE-C key derived from `qrmk`.
    fn chunk_headers(&self) -> Vec<(String, String)> {
        if let Some(headers) = &self.chunk_headers {
            return headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        match &self.qrmk {
            Some(key) => vec![
                (
                    "x-amz-server-side-encryption-customer-algorithm".to_string(),
                    "AES256".to_string(),
                ),
                (
                    "x-amz-server-side-encryption-customer-key".to_string(),
                    key.clone(),
                ),
            ],
            None => Vec::new(),
        }
    }
}

#[derive(Serialize, Debug)]
struct Binding {
    #[serde(rename = "type")]
    kind: &'static str,
    value: Option<String>,
}

fn bindings(params: &[SqlParam]) -> BTreeMap<String, Binding> {
    params
        .iter()
        .enumerate()
        .map(|(idx, param)| {
            let binding = match param {
                SqlParam::Null => Binding {
                    kind: "ANY",
                    value: None,
                },
                SqlParam::Bool(v) => Binding {
                    kind: "BOOLEAN",
                    value: Some(v.to_string()),
                },
                SqlParam::Int(v) => Binding {
                    kind: "FIXED",
                    value: Some(v.to_string()),
                },
                SqlParam::Float(v) => Binding {
                    kind: "REAL",
                    value: Some(v.to_string()),
                },
                SqlParam::Text(v) => Binding {
                    kind: "TEXT",
                    value: Some(v.clone()),
                },
            };
            ((idx + 1).to_string(), binding)
        })
        .collect()
}

/// Converts one JSON row-set cell using the column's declared type.
fn cell(raw: &JsonValue, column: &RowType) -> Value {
    let text = match raw {
        JsonValue::Null => return Value::Null,
        JsonValue::String(s) => s.as_str(),
        other => return Value::Json(other.clone()),
    };

    let parsed = match column.kind.to_ascii_lowercase().as_str() {
        "fixed" if column.scale.unwrap_or(0) == 0 => text.parse().ok().map(Value::Int),
        "real" => text.parse().ok().map(Value::Float),
        "boolean" => Some(Value::Bool(matches!(text, "1" | "true" | "TRUE"))),
        "date" => text
            .parse::<i64>()
            .ok()
            .and_then(|days| {
                NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(TimeDelta::try_days(days)?)
            })
            .map(Value::Date),
        "timestamp_ntz" | "timestamp_ltz" => epoch_seconds(text).map(Value::Timestamp),
        "variant" | "object" | "array" => serde_json::from_str(text).ok().map(Value::Json),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::Text(text.to_string()))
}

fn epoch_seconds(text: &str) -> Option<NaiveDateTime> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, "0"));
    let secs: i64 = secs.parse().ok()?;
    let nanos: u32 = format!("{frac:0<9}").get(..9)?.parse().ok()?;
    DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

/// The inline part of a result. Rows held in `chunks` are appended by the
/// driver with [`append_rows`].
fn table_from_query(data: &QueryData, max_rows: usize) -> Result<Table, DbError> {
    if data.rowset.is_none() && data.rowset_base64.is_some() {
        return Err(DbError::materialize(
            BACKEND,
            "server returned an Arrow row set; only JSON results are supported",
        ));
    }

    let mut table = Table::new(data.rowtype.iter().map(|c| c.name.clone()).collect());
    append_rows(
        &mut table,
        data.rowset.as_deref().unwrap_or_default(),
        &data.rowtype,
        max_rows,
    );
    Ok(table)
}

fn append_rows(table: &mut Table, rows: &[Vec<JsonValue>], rowtype: &[RowType], max_rows: usize) {
    let room = max_rows.saturating_sub(table.len());
    table.rows.extend(rows.iter().take(room).map(|raw| {
        raw.iter()
            .zip(rowtype)
            .map(|(value, column)| cell(value, column))
            .collect()
    }));
}

/// A JSON chunk body is a comma-separated run of row arrays with no
/// enclosing brackets.
fn parse_chunk(body: &str) -> Result<Vec<Vec<JsonValue>>, DbError> {
    serde_json::from_str(&format!("[{}]", body.trim()))
        .map_err(|e| DbError::materialize(BACKEND, format!("invalid result chunk: {e}")))
}

impl SnowflakeDriver {
    pub fn new(settings: SnowflakeSettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut RestSession, DbError> {
        self.session
            .as_mut()
            .ok_or_else(|| DbError::connect(BACKEND, "session is not open"))
    }

    fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, DbError> {
        value.as_deref().ok_or_else(|| DbError::Config {
            backend: BACKEND,
            message: format!("{name} is not set"),
        })
    }

    async fn run(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryData, DbError> {
        let session = self.session()?;
        session.sequence_id += 1;
        let mut body = json!({
            "sqlText": sql,
            "asyncExec": false,
            "sequenceId": session.sequence_id,
            "isInternal": false,
        });
        if !params.is_empty() {
            body["bindings"] = serde_json::to_value(bindings(params))
                .map_err(|e| DbError::execute(BACKEND, e))?;
        }

        let request_id = Uuid::new_v4().to_string();
        session
            .post::<QueryData>(
                "/queries/v1/query-request",
                &[("requestId", request_id.as_str())],
                &body,
            )
            .await
    }
}

impl RestSession {
    async fn download_chunk(
        &self,
        chunk: &Chunk,
        headers: &[(String, String)],
    ) -> Result<Vec<Vec<JsonValue>>, DbError> {
        let mut request = self.client.get(&chunk.url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let body = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DbError::materialize(BACKEND, e))?
            .text()
            .await
            .map_err(|e| DbError::materialize(BACKEND, e))?;
        parse_chunk(&body)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: &JsonValue,
    ) -> Result<T, DbError> {
        let envelope: Envelope<T> = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .query(query)
            .header(reqwest::header::ACCEPT, SNOWFLAKE_ACCEPT)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Snowflake Token=\"{}\"", self.token),
            )
            .json(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DbError::execute(BACKEND, e))?
            .json()
            .await
            .map_err(|e| DbError::materialize(BACKEND, e))?;
        envelope.into_data()
    }
}

impl Driver for SnowflakeDriver {
    fn backend(&self) -> Backend {
        BACKEND
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    async fn open(&mut self) -> Result<(), DbError> {
        let account = Self::required(&self.settings.account, "SNOWFLAKE_ACCOUNT")?;
        let user = Self::required(&self.settings.user, "SNOWFLAKE_USER")?;
        let password = Self::required(&self.settings.password, "SNOWFLAKE_PASSWORD")?;

        let client = Client::builder()
            .timeout(self.settings.request_timeout)
            .build()
            .map_err(|e| DbError::connect(BACKEND, e))?;
        let base_url = format!("https://{account}.snowflakecomputing.com");

        let mut query = vec![("requestId", Uuid::new_v4().to_string())];
        for (key, value) in [
            ("warehouse", &self.settings.warehouse),
            ("databaseName", &self.settings.database),
            ("schemaName", &self.settings.schema),
        ] {
            if let Some(value) = value {
                query.push((key, value.clone()));
            }
        }

        let account_name = account.split('.').next().unwrap_or(account);
        let body = json!({
            "data": {
                "CLIENT_APP_ID": CLIENT_APP_ID,
                "CLIENT_APP_VERSION": env!("CARGO_PKG_VERSION"),
                "ACCOUNT_NAME": account_name,
                "LOGIN_NAME": user,
                "PASSWORD": password,
            }
        });

        debug!(account = account_name, user, "logging in");
        let envelope: Envelope<LoginData> = client
            .post(format!("{base_url}/session/v1/login-request"))
            .query(&query)
            .header(reqwest::header::ACCEPT, SNOWFLAKE_ACCEPT)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DbError::connect(BACKEND, e))?
            .json()
            .await
            .map_err(|e| DbError::connect(BACKEND, e))?;
        let login = envelope
            .into_data()
            .map_err(|e| DbError::connect(BACKEND, e))?;

        self.session = Some(RestSession {
            client,
            base_url,
            token: login.token,
            sequence_id: 0,
        });
        Ok(())
    }

    // Row capping happens client-side in `fetch`.
    async fn apply_limits(&mut self, timeout_ms: u64, _max_rows: usize) -> Result<(), DbError> {
        let sql = format!(
            "ALTER SESSION SET STATEMENT_TIMEOUT_IN_SECONDS = {}",
            timeout_ms / 1000
        );
        self.run(&sql, &[]).await.map(|_| ())
    }

    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        max_rows: usize,
    ) -> Result<Table, DbError> {
        let data = self.run(sql, params).await?;
        let mut table = table_from_query(&data, max_rows)?;

        let headers = data.chunk_headers();
        let session = self.session()?;
        for chunk in &data.chunks {
            if table.len() >= max_rows {
                break;
            }
            debug!(rows = chunk.row_count, "downloading result chunk");
            let rows = session.download_chunk(chunk, &headers).await?;
            append_rows(&mut table, &rows, &data.rowtype, max_rows);
        }

        let expected = data.total.unwrap_or(0).min(max_rows as u64);
        if (table.len() as u64) < expected {
            warn!(
                rows = table.len(),
                expected,
                "result has fewer rows than the server reported"
            );
        }
        Ok(table)
    }

    async fn write_and_commit(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, DbError> {
        let data = self.run(sql, params).await?;
        self.run("COMMIT", &[]).await?;
        let stats = data.stats.unwrap_or_default();
        Ok(stats.num_rows_inserted + stats.num_rows_updated + stats.num_rows_deleted)
    }

    async fn close(&mut self) -> Result<(), DbError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        session
            .client
            .post(format!("{}/session", session.base_url))
            .query(&[("delete", "true")])
            .header(reqwest::header::ACCEPT, SNOWFLAKE_ACCEPT)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Snowflake Token=\"{}\"", session.token),
            )
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(|e| DbError::execute(BACKEND, e))
    }
}
