//! Client query execution
//!
//! One client query runs inside one short-lived transaction on one pooled
//! connection: install identity, execute, commit. The statement text is
//! bound with native positional placeholders only; parameter values arrive
//! as JSON and map onto the closest Postgres types.

use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};
use uuid::Uuid;

use crate::client::Store;
use crate::error::StoreError;

impl Store {
    /// Execute one client-supplied statement under the session's identity.
    ///
    /// Rows come back as JSON objects keyed by column name. The deployment
    /// row cap and query timeout both apply; hitting either fails the query
    /// without touching the connection's health.
    pub async fn execute_as(
        &self,
        session_id: Uuid,
        token: &str,
        statement: &str,
        parameters: &[Value],
    ) -> Result<Vec<Value>, StoreError> {
        let work = async {
            let mut tx = self.pool().begin().await?;

            self.install_agent_context(&mut tx, session_id, token)
                .await?;

            let rows = bind_parameters(sqlx::query(statement), parameters)
                .fetch_all(&mut *tx)
                .await?;

            if rows.len() > self.max_result_rows() {
                return Err(StoreError::ResultTooLarge {
                    cap: self.max_result_rows(),
                });
            }

            let result: Vec<Value> = rows.iter().map(row_to_json).collect();

            self.clear_agent_context(&mut tx).await?;
            tx.commit().await?;

            Ok(result)
        };

        match tokio::time::timeout(self.query_timeout(), work).await {
            Ok(result) => result,
            // The dropped transaction rolls back on its way out
            Err(_) => Err(StoreError::QueryTimeout),
        }
    }
}

/// Bind JSON parameter values positionally.
pub(crate) fn bind_parameters<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    parameters: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for value in parameters {
        query = match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            // Arrays and objects travel as jsonb
            composite => query.bind(composite),
        };
    }
    query
}

/// Decode one row into a JSON object keyed by column name.
///
/// Column types outside the supported set decode to null rather than
/// failing the whole result; clients asked for opaque data get opaque data.
pub(crate) fn row_to_json(row: &PgRow) -> Value {
    let mut object = Map::with_capacity(row.columns().len());

    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(index)
                .map(|v| v.map_or(Value::Null, Value::Bool)),
            "INT2" => row
                .try_get::<Option<i16>, _>(index)
                .map(|v| v.map_or(Value::Null, |v| Value::from(v))),
            "INT4" => row
                .try_get::<Option<i32>, _>(index)
                .map(|v| v.map_or(Value::Null, |v| Value::from(v))),
            "INT8" => row
                .try_get::<Option<i64>, _>(index)
                .map(|v| v.map_or(Value::Null, |v| Value::from(v))),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)
                .map(|v| v.map_or(Value::Null, |v| Value::from(v))),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(index)
                .map(|v| v.map_or(Value::Null, |v| Value::from(v))),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(index)
                .map(|v| v.map_or(Value::Null, Value::String)),
            "UUID" => row
                .try_get::<Option<Uuid>, _>(index)
                .map(|v| v.map_or(Value::Null, |v| Value::String(v.to_string()))),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
                .map(|v| v.map_or(Value::Null, |v| Value::String(v.to_rfc3339()))),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(index)
                .map(|v| v.map_or(Value::Null, |v| Value::String(v.to_string()))),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(index)
                .map(|v| v.map_or(Value::Null, |v| Value::String(v.to_string()))),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(index)
                .map(|v| v.unwrap_or(Value::Null)),
            other => {
                tracing::debug!(column = column.name(), pg_type = other, "Unmapped column type");
                Ok(Value::Null)
            }
        };

        object.insert(
            column.name().to_string(),
            value.unwrap_or_else(|_| Value::Null),
        );
    }

    Value::Object(object)
}
