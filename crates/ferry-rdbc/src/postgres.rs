//! PostgreSQL emitter
//!
//! One [`PgTableEmitter`] owns one `tokio-postgres` connection:
//! - Table introspection through `information_schema` (plus `pg_dist_partition`
//!   when Citus is enabled)
//! - DDL for tables, indexes, columns and distribution
//! - Bulk loads through `COPY ... FROM STDIN`
//! - Upserts and deletes with typed parameters

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::SinkExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tracing::{debug, info, warn};

use crate::connection::ConnectionConfig;
use crate::copy::encode_rows;
use crate::dialect::{PostgresDialect, SqlDialect};
use crate::emitter::TableEmitter;
use crate::error::{Error, Result};
use crate::schema::{PrimaryKeyValue, TableColumn, TableRow, TableSchema};
use crate::security::validate_quoted_identifier;
use crate::types::{ColumnType, Numeric, Value};

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Convert a value to a tokio-postgres parameter for a column of `column_type`.
///
/// NULL must carry the column's type: the server rejects an untyped NULL
/// parameter bound against a column of a different type. Numbers are bound
/// as text and cast by the server, so they arrive exactly.
fn value_to_sql(value: &Value, column_type: ColumnType) -> SqlParam {
    match value {
        Value::Null => match column_type {
            ColumnType::Text => Box::new(Option::<String>::None),
            ColumnType::Integer => Box::new(Option::<i64>::None),
            ColumnType::Float => Box::new(Option::<String>::None),
            ColumnType::Boolean => Box::new(Option::<bool>::None),
            ColumnType::Binary => Box::new(Option::<Vec<u8>>::None),
            ColumnType::Timestamp => Box::new(Option::<DateTime<Utc>>::None),
            ColumnType::Document => Box::new(Option::<serde_json::Value>::None),
        },
        Value::Bool(b) => Box::new(*b),
        Value::Int64(n) => Box::new(*n),
        Value::Numeric(n) => Box::new(String::from(n.clone())),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Json(j) => Box::new(j.clone()),
    }
}

/// Convert a PostgreSQL value to a ferry Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    fn get<'a, T: tokio_postgres::types::FromSql<'a>>(
        row: &'a tokio_postgres::Row,
        idx: usize,
    ) -> Result<Option<T>> {
        row.try_get::<_, Option<T>>(idx)
            .map_err(|e| Error::type_conversion(e.to_string()))
    }

    let pg_type = row.columns()[idx].type_().clone();
    let value = match pg_type {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(|n| Value::Int64(n.into())),
        Type::INT4 => get::<i32>(row, idx)?.map(|n| Value::Int64(n.into())),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::Int64),
        Type::FLOAT4 => get::<f32>(row, idx)?
            .map(|f| float_value(f.is_finite(), f.to_string()))
            .transpose()?,
        Type::FLOAT8 => get::<f64>(row, idx)?
            .map(|f| float_value(f.is_finite(), f.to_string()))
            .transpose()?,
        Type::NUMERIC => get::<Numeric>(row, idx)?.map(Value::Numeric),
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(Value::Bytes),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx)?.map(Value::DateTimeTz),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|dt| Value::DateTimeTz(dt.and_utc())),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx)?.map(Value::Json),
        _ => get::<String>(row, idx)?.map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn float_value(finite: bool, text: String) -> Result<Value> {
    if !finite {
        return Err(Error::type_conversion(format!(
            "non-finite float {} has no exact value",
            text
        )));
    }
    Numeric::parse(&text).map(Value::Numeric)
}

/// Decode the binary `NUMERIC` wire format: digit count, weight, sign and
/// display scale, followed by base-10000 digits, most significant first.
fn decode_numeric(raw: &[u8]) -> Result<Numeric> {
    let word = |i: usize| {
        raw.get(2 * i..2 * i + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| Error::type_conversion("truncated NUMERIC value"))
    };
    let ndigits = word(0)? as usize;
    let weight = i64::from(word(1)? as i16);
    let sign = word(2)?;
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Result<Vec<u16>>>()?;

    let mut text = String::new();
    match sign {
        0x0000 => {}
        0x4000 => text.push('-'),
        _ => {
            return Err(Error::type_conversion(
                "NUMERIC NaN or infinity has no exact value",
            ))
        }
    }

    let digit = |position: i64| -> u16 {
        usize::try_from(position)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for position in 1..=weight {
            text.push_str(&format!("{:04}", digit(position)));
        }
    }
    if (weight + 1) < ndigits as i64 {
        text.push('.');
        for position in (weight + 1)..ndigits as i64 {
            text.push_str(&format!("{:04}", digit(position)));
        }
    }
    Numeric::parse(&text)
}

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(decode_numeric(raw)?)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Classify a driver error
fn map_pg_error(err: tokio_postgres::Error, sql: &str, table: &str) -> Error {
    if err.is_closed() {
        return Error::connection_with_source("connection closed", err);
    }
    let Some(code) = err.code().cloned() else {
        return Error::connection_with_source(err.to_string(), err);
    };

    if code == SqlState::DUPLICATE_TABLE {
        Error::table_exists(table)
    } else if code == SqlState::UNDEFINED_TABLE {
        Error::table_not_found(table)
    } else if code == SqlState::T_R_DEADLOCK_DETECTED {
        Error::Deadlock
    } else if code == SqlState::QUERY_CANCELED {
        Error::timeout(err.to_string())
    } else if code.code().starts_with("23") {
        let constraint = err
            .as_db_error()
            .and_then(|db| db.constraint())
            .unwrap_or("unknown")
            .to_string();
        Error::constraint(constraint, err.to_string())
    } else if code.code().starts_with("08") {
        Error::connection_with_source(err.to_string(), err)
    } else if code.code().starts_with("22") {
        Error::type_conversion(err.to_string())
    } else {
        let message = err
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| err.to_string());
        Error::query_with_sql(message, sql)
    }
}

fn param_refs(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Emitter writing to a PostgreSQL (or Citus coordinator) database
pub struct PgTableEmitter {
    client: Mutex<Option<Arc<tokio_postgres::Client>>>,
    dialect: PostgresDialect,
    citus: bool,
    citus_installed: OnceCell<bool>,
}

impl PgTableEmitter {
    /// Open a connection and spawn its I/O task
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::connection_with_source("invalid connection URL", e))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection error: {}", e);
            }
        });

        debug!(url = %config.redacted_url(), "Connected to PostgreSQL");

        Ok(Self {
            client: Mutex::new(Some(Arc::new(client))),
            dialect: PostgresDialect,
            citus: config.citus,
            citus_installed: OnceCell::new(),
        })
    }

    fn client(&self) -> Result<Arc<tokio_postgres::Client>> {
        self.client.lock().clone().ok_or(Error::Closed)
    }

    /// `$n::TYPE` placeholders so the server never has to infer parameter types
    fn typed_placeholders<'a>(&self, columns: impl Iterator<Item = &'a TableColumn>) -> Vec<String> {
        columns
            .enumerate()
            .map(|(i, c)| {
                let placeholder = self.dialect.placeholder(i + 1);
                let native = self.dialect.native_type(c.column_type);
                match c.column_type {
                    // numbers travel as exact decimal text
                    ColumnType::Float => format!("{}::text::{}", placeholder, native),
                    _ => format!("{}::{}", placeholder, native),
                }
            })
            .collect()
    }

    async fn execute(&self, sql: &str, params: &[SqlParam], table: &str) -> Result<u64> {
        let client = self.client()?;
        client
            .execute(sql, &param_refs(params))
            .await
            .map_err(|e| map_pg_error(e, sql, table))
    }

    async fn query(
        &self,
        sql: &str,
        params: &[SqlParam],
        table: &str,
    ) -> Result<Vec<tokio_postgres::Row>> {
        let client = self.client()?;
        client
            .query(sql, &param_refs(params))
            .await
            .map_err(|e| map_pg_error(e, sql, table))
    }

    fn validate_identifiers(schema: &TableSchema) -> Result<()> {
        validate_quoted_identifier(&schema.namespace)?;
        validate_quoted_identifier(&schema.name)?;
        for column in schema.columns() {
            validate_quoted_identifier(&column.name)?;
        }
        for index in &schema.indexes {
            validate_quoted_identifier(&index.name)?;
        }
        Ok(())
    }
}

#[async_trait]
impl TableEmitter for PgTableEmitter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn fetch_schema(&self, table: &str, namespace: &str) -> Result<Option<TableSchema>> {
        let sql = self.dialect.list_columns_sql(namespace, table);
        let qualified = format!("{}.{}", namespace, table);
        let rows = self.query(&sql, &[], &qualified).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut schema = TableSchema::new(namespace, table);
        let mut key: Vec<(i32, String)> = Vec::new();
        for row in &rows {
            let name: String = row
                .try_get("column_name")
                .map_err(|e| Error::type_conversion(e.to_string()))?;
            let data_type: String = row
                .try_get("data_type")
                .map_err(|e| Error::type_conversion(e.to_string()))?;
            let nullable: bool = row
                .try_get("nullable")
                .map_err(|e| Error::type_conversion(e.to_string()))?;
            let pk_ordinal: Option<i32> = row
                .try_get("pk_ordinal")
                .map_err(|e| Error::type_conversion(e.to_string()))?;

            let mut column = TableColumn::new(name.clone(), self.dialect.semantic_type(&data_type));
            column.nullable = nullable;
            schema = schema.with_column(column);
            if let Some(ordinal) = pk_ordinal {
                key.push((ordinal, name));
            }
        }
        key.sort();
        schema = schema.with_primary_key(key.into_iter().map(|(_, name)| name));

        if self.supports_distribution().await? {
            let quoted = self.dialect.qualified_name(&schema);
            let params: Vec<SqlParam> = vec![Box::new(quoted)];
            let rows = self
                .query(PostgresDialect::DISTRIBUTION_COLUMN_SQL, &params, &qualified)
                .await?;
            if let Some(row) = rows.first() {
                let column: Option<String> = row
                    .try_get(0)
                    .map_err(|e| Error::type_conversion(e.to_string()))?;
                if let Some(column) = column {
                    schema = schema.with_distribution_column(column);
                }
            }
        }

        Ok(Some(schema))
    }

    async fn supports_distribution(&self) -> Result<bool> {
        if !self.citus {
            return Ok(false);
        }
        let installed = self
            .citus_installed
            .get_or_try_init(|| async {
                let rows = self.query(PostgresDialect::HAS_CITUS_SQL, &[], "pg_extension").await?;
                if rows.is_empty() {
                    warn!("Citus requested but the extension is not installed");
                }
                Ok::<_, Error>(!rows.is_empty())
            })
            .await?;
        Ok(*installed)
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<()> {
        schema.validate()?;
        Self::validate_identifiers(schema)?;

        let qualified = schema.qualified_name();
        for sql in self.dialect.create_table_sql(schema) {
            self.execute(&sql, &[], &qualified).await?;
        }
        info!(table = %qualified, columns = schema.columns().len(), "Created table");
        Ok(())
    }

    async fn create_column(&self, schema: &TableSchema, column: &TableColumn) -> Result<()> {
        validate_quoted_identifier(&column.name)?;
        let sql = self.dialect.add_column_sql(schema, column);
        self.execute(&sql, &[], &schema.qualified_name()).await?;
        info!(table = %schema.qualified_name(), column = %column, "Added column");
        Ok(())
    }

    async fn bulk_load(&self, schema: &TableSchema, rows: &[TableRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let client = self.client()?;
        let sql = self.dialect.copy_from_stdin_sql(schema);
        let qualified = schema.qualified_name();
        let payload = Bytes::from(encode_rows(schema, rows));

        let sink = client
            .copy_in::<_, Bytes>(sql.as_str())
            .await
            .map_err(|e| map_pg_error(e, &sql, &qualified))?;
        futures::pin_mut!(sink);
        sink.send(payload)
            .await
            .map_err(|e| map_pg_error(e, &sql, &qualified))?;
        let written = sink
            .as_mut()
            .finish()
            .await
            .map_err(|e| map_pg_error(e, &sql, &qualified))?;

        debug!(table = %qualified, rows = written, "COPY finished");
        Ok(written)
    }

    async fn upsert(&self, row: &TableRow) -> Result<()> {
        let schema = row.schema();
        let sql = self
            .dialect
            .upsert_statement(schema, self.typed_placeholders(schema.columns().iter()));
        let params: Vec<SqlParam> = schema
            .columns()
            .iter()
            .map(|c| value_to_sql(&row.value_or_null(&c.name), c.column_type))
            .collect();
        self.execute(&sql, &params, &schema.qualified_name()).await?;
        Ok(())
    }

    async fn delete(&self, key: &PrimaryKeyValue) -> Result<()> {
        let schema = key.schema();
        let key_columns = schema.primary_key_columns();
        let sql = self
            .dialect
            .delete_statement(schema, self.typed_placeholders(key_columns.iter().copied()));
        let params: Vec<SqlParam> = key_columns
            .iter()
            .zip(key.values())
            .map(|(c, v)| value_to_sql(v, c.column_type))
            .collect();
        self.execute(&sql, &params, &schema.qualified_name()).await?;
        Ok(())
    }

    async fn max_primary_key(&self, schema: &TableSchema) -> Result<Option<PrimaryKeyValue>> {
        let sql = self.dialect.max_primary_key_sql(schema);
        let rows = self.query(&sql, &[], &schema.qualified_name()).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let values = (0..schema.primary_key().len())
            .map(|idx| pg_value_to_value(row, idx))
            .collect::<Result<Vec<_>>>()?;
        PrimaryKeyValue::new(Arc::new(schema.clone()), values).map(Some)
    }

    async fn close(&self) -> Result<()> {
        // Dropping the last client handle ends the connection task
        if self.client.lock().take().is_some() {
            debug!("Closed PostgreSQL emitter");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_nulls_per_column_type() {
        use tokio_postgres::types::IsNull;

        let mut buf = bytes::BytesMut::new();
        let p = value_to_sql(&Value::Null, ColumnType::Text);
        assert!(matches!(p.to_sql_checked(&Type::TEXT, &mut buf), Ok(IsNull::Yes)));
        assert!(p.to_sql_checked(&Type::INT8, &mut buf).is_err());

        let p = value_to_sql(&Value::Null, ColumnType::Document);
        assert!(matches!(p.to_sql_checked(&Type::JSONB, &mut buf), Ok(IsNull::Yes)));
    }

    #[test]
    fn test_value_params_keep_values() {
        let p = value_to_sql(&Value::Int64(42), ColumnType::Integer);
        assert_eq!(format!("{:?}", p), "42");

        let p = value_to_sql(&Value::from("x"), ColumnType::Text);
        assert_eq!(format!("{:?}", p), "\"x\"");
    }

    fn numeric_wire(weight: i16, sign: u16, scale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        for word in [digits.len() as u16, weight as u16, sign, scale]
            .into_iter()
            .chain(digits.iter().copied())
        {
            raw.extend_from_slice(&word.to_be_bytes());
        }
        raw
    }

    #[test]
    fn test_decode_numeric_wire_format() {
        let decode = |raw: Vec<u8>| decode_numeric(&raw).unwrap().as_str().to_string();

        assert_eq!(decode(numeric_wire(1, 0, 3, &[1, 2345, 6780])), "12345.678");
        assert_eq!(decode(numeric_wire(-1, 0x4000, 1, &[5000])), "-0.5");
        assert_eq!(decode(numeric_wire(0, 0, 0, &[])), "0");
        // 1E+30 is 100 * 10000^7
        assert_eq!(
            decode(numeric_wire(7, 0, 0, &[100])),
            "1000000000000000000000000000000"
        );
        // 38 significant digits
        assert_eq!(
            decode(numeric_wire(
                9,
                0,
                0,
                &[12, 3456, 7890, 1234, 5678, 9012, 3456, 7890, 1234, 5678]
            )),
            "12345678901234567890123456789012345678"
        );
        assert_eq!(decode(numeric_wire(-3, 0, 12, &[1])), "0.000000000001");
    }

    #[test]
    fn test_decode_numeric_rejects_nan_and_truncation() {
        assert!(decode_numeric(&numeric_wire(0, 0xC000, 0, &[])).is_err());
        let mut raw = numeric_wire(1, 0, 0, &[1, 2]);
        raw.truncate(raw.len() - 1);
        assert!(decode_numeric(&raw).is_err());
    }

    #[test]
    fn test_numbers_bind_as_exact_text() {
        use tokio_postgres::types::IsNull;

        let wide = Numeric::parse("12345678901234567890123456789012345678").unwrap();
        let p = value_to_sql(&Value::Numeric(wide), ColumnType::Float);
        let mut buf = bytes::BytesMut::new();
        assert!(matches!(p.to_sql_checked(&Type::TEXT, &mut buf), Ok(IsNull::No)));
        assert_eq!(&buf[..], b"12345678901234567890123456789012345678");

        let p = value_to_sql(&Value::Null, ColumnType::Float);
        assert!(matches!(p.to_sql_checked(&Type::TEXT, &mut buf), Ok(IsNull::Yes)));
    }
}
