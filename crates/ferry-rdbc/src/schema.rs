//! Table schema model
//!
//! - [`TableSchema`]: ordered columns, primary key, optional distribution
//!   column and secondary indexes
//! - [`TableRow`]: one row bound to the schema snapshot it was built against
//! - [`PrimaryKeyValue`]: the key columns of a row, used for deletes and routing
//!
//! Schemas only ever grow: [`TableSchema::add_column`] appends and refuses to
//! retype an existing column.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{ColumnType, Value};

/// A single column of a replicated table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    /// Column name
    pub name: String,
    /// Semantic type
    pub column_type: ColumnType,
    /// Whether NULL is allowed
    pub nullable: bool,
}

impl TableColumn {
    /// Create a nullable column
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    /// Mark the column NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

impl fmt::Display for TableColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.column_type)?;
        if !self.nullable {
            f.write_str(" not null")?;
        }
        Ok(())
    }
}

/// A secondary index on a replicated table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIndex {
    /// Index name
    pub name: String,
    /// Indexed columns, in order
    pub columns: Vec<String>,
}

impl TableIndex {
    /// Create an index definition
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }
}

/// Relational schema of one replicated table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Namespace (PostgreSQL schema)
    pub namespace: String,
    /// Table name
    pub name: String,
    columns: Vec<TableColumn>,
    primary_key: Vec<String>,
    /// Column used for native sharding, when the sink supports it
    pub distribution_column: Option<String>,
    /// Secondary indexes
    #[serde(default)]
    pub indexes: Vec<TableIndex>,
}

impl TableSchema {
    /// Create an empty schema
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            distribution_column: None,
            indexes: Vec::new(),
        }
    }

    /// Append a column (builder form; replaces a same-named column)
    pub fn with_column(mut self, mut column: TableColumn) -> Self {
        if self.is_primary_key(&column.name) {
            column.nullable = false;
        }
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        self
    }

    /// Set the primary key; key columns become NOT NULL
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        for column in &mut self.columns {
            if self.primary_key.contains(&column.name) {
                column.nullable = false;
            }
        }
        self
    }

    /// Set the distribution column
    pub fn with_distribution_column(mut self, column: impl Into<String>) -> Self {
        self.distribution_column = Some(column.into());
        self
    }

    /// Add a secondary index
    pub fn with_index(mut self, index: TableIndex) -> Self {
        self.indexes.push(index);
        self
    }

    /// `namespace.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Columns in declaration order
    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether a column exists
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Column names in declaration order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Primary key column names
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Whether `name` is part of the primary key
    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    /// Primary key columns, in key order
    pub fn primary_key_columns(&self) -> Vec<&TableColumn> {
        self.primary_key
            .iter()
            .filter_map(|k| self.column(k))
            .collect()
    }

    /// Columns outside the primary key
    pub fn value_columns(&self) -> impl Iterator<Item = &TableColumn> {
        self.columns.iter().filter(|c| !self.is_primary_key(&c.name))
    }

    /// Append a column.
    ///
    /// Returns `Ok(false)` when an identical column already exists and a
    /// schema error when the existing column has a different type.
    pub fn add_column(&mut self, column: TableColumn) -> Result<bool> {
        match self.column(&column.name) {
            Some(existing) if existing.column_type == column.column_type => Ok(false),
            Some(existing) => Err(Error::schema(format!(
                "column {}.{} is {} but {} was requested",
                self.qualified_name(),
                existing.name,
                existing.column_type,
                column.column_type
            ))),
            None => {
                self.columns.push(column);
                Ok(true)
            }
        }
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::schema("table name cannot be empty"));
        }
        if self.primary_key.is_empty() {
            return Err(Error::schema(format!(
                "table {} has no primary key",
                self.qualified_name()
            )));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(Error::schema(format!(
                    "duplicate column {} in {}",
                    column.name,
                    self.qualified_name()
                )));
            }
        }
        for key in &self.primary_key {
            match self.column(key) {
                Some(c) if c.nullable => {
                    return Err(Error::schema(format!(
                        "primary key column {} must be NOT NULL",
                        key
                    )))
                }
                Some(_) => {}
                None => {
                    return Err(Error::schema(format!(
                        "primary key column {} is not a column of {}",
                        key,
                        self.qualified_name()
                    )))
                }
            }
        }
        if let Some(dist) = &self.distribution_column {
            if !self.is_primary_key(dist) {
                return Err(Error::schema(format!(
                    "distribution column {} must be part of the primary key",
                    dist
                )));
            }
        }
        Ok(())
    }
}

/// The primary key of one row
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeyValue {
    schema: Arc<TableSchema>,
    values: Vec<Value>,
}

impl PrimaryKeyValue {
    /// Build a key; `values` must follow the schema's key column order
    pub fn new(schema: Arc<TableSchema>, values: Vec<Value>) -> Result<Self> {
        if values.len() != schema.primary_key().len() {
            return Err(Error::schema(format!(
                "{} expects {} key values, got {}",
                schema.qualified_name(),
                schema.primary_key().len(),
                values.len()
            )));
        }
        let mut coerced = Vec::with_capacity(values.len());
        for (column, value) in schema.primary_key_columns().into_iter().zip(values) {
            if value.is_null() {
                return Err(Error::schema(format!(
                    "primary key column {} cannot be null",
                    column.name
                )));
            }
            coerced.push(value.coerce(column.column_type)?);
        }
        Ok(Self {
            schema,
            values: coerced,
        })
    }

    /// Schema snapshot this key belongs to
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Key values in key column order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// `(column, value)` pairs in key order
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema
            .primary_key()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Stable byte encoding of table + key, used for routing and lookups
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        Value::String(self.schema.qualified_name()).write_key_bytes(&mut out);
        for value in &self.values {
            value.write_key_bytes(&mut out);
        }
        out
    }
}

impl fmt::Display for PrimaryKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.schema.qualified_name())?;
        for (i, (column, value)) in self.columns().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", column, value)?;
        }
        f.write_str(")")
    }
}

/// One row of a replicated table
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    key: PrimaryKeyValue,
    values: BTreeMap<String, Value>,
}

impl TableRow {
    /// Build a row from named values.
    ///
    /// Every value is coerced to its column type; names that are not columns
    /// of `schema` are rejected so callers add columns first.
    pub fn new(schema: Arc<TableSchema>, values: BTreeMap<String, Value>) -> Result<Self> {
        let mut coerced = BTreeMap::new();
        for (name, value) in values {
            let column = schema.column(&name).ok_or_else(|| {
                Error::schema(format!(
                    "{} has no column {}",
                    schema.qualified_name(),
                    name
                ))
            })?;
            coerced.insert(name, value.coerce(column.column_type)?);
        }

        let key_values = schema
            .primary_key()
            .iter()
            .map(|k| coerced.get(k).cloned().unwrap_or(Value::Null))
            .collect();
        let key = PrimaryKeyValue::new(schema, key_values)?;

        Ok(Self {
            key,
            values: coerced,
        })
    }

    /// Schema snapshot this row was built against
    pub fn schema(&self) -> &Arc<TableSchema> {
        self.key.schema()
    }

    /// Primary key of the row
    pub fn primary_key(&self) -> &PrimaryKeyValue {
        &self.key
    }

    /// Value of a column (`None` when the attribute was absent)
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Value of a column, NULL when absent
    pub fn value_or_null(&self, column: &str) -> Value {
        self.values.get(column).cloned().unwrap_or(Value::Null)
    }

    /// All present values by column name
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn orders() -> TableSchema {
        TableSchema::new("public", "orders")
            .with_column(TableColumn::new("id", ColumnType::Float))
            .with_column(TableColumn::new("name", ColumnType::Text))
            .with_primary_key(["id"])
    }

    #[test]
    fn test_primary_key_columns_become_not_null() {
        let schema = orders();
        assert!(!schema.column("id").unwrap().nullable);
        assert!(schema.column("name").unwrap().nullable);
        schema.validate().unwrap();
    }

    #[test]
    fn test_add_column_is_additive() {
        let mut schema = orders();
        assert!(schema
            .add_column(TableColumn::new("discount", ColumnType::Float))
            .unwrap());
        assert!(!schema
            .add_column(TableColumn::new("discount", ColumnType::Float))
            .unwrap());
        assert!(schema
            .add_column(TableColumn::new("discount", ColumnType::Text))
            .is_err());
        assert_eq!(schema.column_names(), vec!["id", "name", "discount"]);
    }

    #[test]
    fn test_validate_rejects_bad_keys() {
        let schema = TableSchema::new("public", "t")
            .with_column(TableColumn::new("a", ColumnType::Text));
        assert!(schema.validate().is_err());

        let schema = TableSchema::new("public", "t")
            .with_column(TableColumn::new("a", ColumnType::Text))
            .with_primary_key(["b"]);
        assert!(schema.validate().is_err());

        let schema = orders().with_distribution_column("name");
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_row_coerces_and_extracts_key() {
        let schema = Arc::new(orders());
        let mut values = BTreeMap::new();
        values.insert("id".to_string(), Value::Int64(1));
        values.insert("name".to_string(), Value::from("a"));

        let row = TableRow::new(schema, values).unwrap();
        assert_eq!(
            row.primary_key().values(),
            &[Value::Numeric(crate::types::Numeric::from(1i64))]
        );
        assert_eq!(row.get("name"), Some(&Value::from("a")));
        assert_eq!(row.value_or_null("missing"), Value::Null);
        assert_eq!(row.primary_key().to_string(), "public.orders(id=1)");
    }

    #[test]
    fn test_row_requires_key_and_known_columns() {
        let schema = Arc::new(orders());

        let mut values = BTreeMap::new();
        values.insert("name".to_string(), Value::from("a"));
        assert!(TableRow::new(schema.clone(), values).is_err());

        let mut values = BTreeMap::new();
        values.insert("id".to_string(), Value::Int64(1));
        values.insert("discount".to_string(), Value::Int64(5));
        assert!(TableRow::new(schema, values).is_err());
    }

    #[test]
    fn test_key_bytes_include_table() {
        let a = Arc::new(orders());
        let b = Arc::new(TableSchema {
            name: "other".into(),
            ..orders()
        });
        let ka = PrimaryKeyValue::new(a, vec![Value::Int64(1)]).unwrap();
        let kb = PrimaryKeyValue::new(b, vec![Value::Int64(1)]).unwrap();
        assert_ne!(ka.key_bytes(), kb.key_bytes());
    }
}
