//! Source items to relational rows
//!
//! [`SchemaTranslator`] derives a [`TableSchema`] from a source table's key
//! schema and declared attributes, reconciles it with what the sink already
//! has, and converts items into typed values.
//!
//! Two conversion modes are supported:
//! - [`ConversionMode::Columns`]: one column per attribute; attributes seen
//!   for the first time become new nullable columns
//! - [`ConversionMode::Document`]: key columns plus a single JSONB `data`
//!   column holding the whole item

use ferry_rdbc::security::MAX_IDENTIFIER_BYTES;
use ferry_rdbc::{ColumnType, Numeric, PrimaryKeyValue, TableColumn, TableSchema, Value};
use ferry_rdbc::schema::TableIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::error::{ReplicationError, Result, SchemaConflict};
use crate::source::{AttrValue, Item, ScalarType, SourceTableDescription};

/// Name of the document column in [`ConversionMode::Document`]
pub const DOCUMENT_COLUMN: &str = "data";

/// How item attributes map onto columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionMode {
    /// One column per attribute
    #[default]
    Columns,
    /// Key columns plus one document column
    Document,
}

impl FromStr for ConversionMode {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "columns" => Ok(Self::Columns),
            "document" | "jsonb" => Ok(Self::Document),
            other => Err(ReplicationError::argument(format!(
                "unknown conversion mode '{}' (expected columns or document)",
                other
            ))),
        }
    }
}

impl fmt::Display for ConversionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Columns => "columns",
            Self::Document => "document",
        })
    }
}

/// Values of one item, plus the columns it needs that the schema lacks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translation {
    /// Column name to value
    pub values: BTreeMap<String, Value>,
    /// Columns to create before the row can be written
    pub new_columns: Vec<TableColumn>,
}

/// Derives schemas and converts items
#[derive(Debug, Clone)]
pub struct SchemaTranslator {
    namespace: String,
    mode: ConversionMode,
    lower_case_names: bool,
}

impl SchemaTranslator {
    /// Create a translator writing into `namespace`
    pub fn new(namespace: impl Into<String>, mode: ConversionMode) -> Self {
        Self {
            namespace: namespace.into(),
            mode,
            lower_case_names: false,
        }
    }

    /// Lower-case every column name
    pub fn with_lower_case_names(mut self, enabled: bool) -> Self {
        self.lower_case_names = enabled;
        self
    }

    /// Target namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Conversion mode
    pub fn mode(&self) -> ConversionMode {
        self.mode
    }

    /// Column name for a source attribute
    pub fn column_name(&self, attribute: &str) -> String {
        if self.lower_case_names {
            attribute.to_lowercase()
        } else {
            attribute.to_string()
        }
    }

    /// Column type for a declared scalar type
    pub fn scalar_column_type(scalar: ScalarType) -> ColumnType {
        match scalar {
            ScalarType::String => ColumnType::Text,
            ScalarType::Number => ColumnType::Float,
            ScalarType::Binary => ColumnType::Binary,
        }
    }

    /// Derive the relational schema of a source table.
    ///
    /// The partition key becomes the distribution column when `distribute`
    /// is set.
    pub fn derive_schema(
        &self,
        description: &SourceTableDescription,
        distribute: bool,
    ) -> Result<TableSchema> {
        let mut schema = TableSchema::new(self.namespace.as_str(), description.name.as_str());
        let key_columns: Vec<String> = description
            .key_names()
            .into_iter()
            .map(|k| self.column_name(k))
            .collect();

        let key_defs = std::iter::once(&description.partition_key).chain(description.sort_key.as_ref());
        for def in key_defs {
            schema = schema.with_column(TableColumn::new(
                self.column_name(&def.name),
                Self::scalar_column_type(def.scalar_type),
            ));
        }

        match self.mode {
            ConversionMode::Columns => {
                for def in &description.attributes {
                    let name = self.column_name(&def.name);
                    if !schema.has_column(&name) {
                        schema = schema.with_column(TableColumn::new(
                            name,
                            Self::scalar_column_type(def.scalar_type),
                        ));
                    }
                }
                for index in &description.secondary_indexes {
                    let name = format!("{}_{}", description.name, index.name);
                    if name.len() > MAX_IDENTIFIER_BYTES {
                        warn!(index = %name, "Skipping secondary index: name too long");
                        continue;
                    }
                    let columns = std::iter::once(&index.partition_key)
                        .chain(index.sort_key.as_ref())
                        .map(|c| self.column_name(c))
                        .collect();
                    schema = schema.with_index(TableIndex::new(name, columns));
                }
            }
            ConversionMode::Document => {
                schema = schema.with_column(TableColumn::new(DOCUMENT_COLUMN, ColumnType::Document));
            }
        }

        schema = schema.with_primary_key(key_columns.clone());
        if distribute {
            schema = schema.with_distribution_column(key_columns[0].clone());
        }
        schema.validate()?;
        Ok(schema)
    }

    /// Columns of `desired` missing from `existing`.
    ///
    /// Never removes or retypes: a differently typed column or a different
    /// primary key is a conflict.
    pub fn reconcile(&self, existing: &TableSchema, desired: &TableSchema) -> Result<Vec<TableColumn>> {
        if existing.primary_key() != desired.primary_key() {
            return Err(SchemaConflict::PrimaryKeyMismatch {
                table: existing.qualified_name(),
                existing: existing.primary_key().to_vec(),
                desired: desired.primary_key().to_vec(),
            }
            .into());
        }

        let mut missing = Vec::new();
        for column in desired.columns() {
            match existing.column(&column.name) {
                Some(current) if current.column_type == column.column_type => {}
                Some(current) => {
                    return Err(SchemaConflict::ColumnTypeMismatch {
                        table: existing.qualified_name(),
                        column: column.name.clone(),
                        existing: current.column_type.to_string(),
                        desired: column.column_type.to_string(),
                    }
                    .into())
                }
                None => {
                    let mut column = column.clone();
                    column.nullable = true;
                    missing.push(column);
                }
            }
        }
        Ok(missing)
    }

    /// Convert an item against the current schema snapshot
    pub fn translate(&self, item: &Item, schema: &TableSchema) -> Result<Translation> {
        let mut translation = Translation::default();

        match self.mode {
            ConversionMode::Columns => {
                for (attribute, attr) in item {
                    let name = self.column_name(attribute);
                    let (column_type, value) = convert(attr)?;
                    if !schema.has_column(&name) {
                        let Some(column_type) = column_type else {
                            // a bare NULL carries no type to create a column from
                            continue;
                        };
                        if !translation.new_columns.iter().any(|c| c.name == name) {
                            translation
                                .new_columns
                                .push(TableColumn::new(name.clone(), column_type));
                        }
                    }
                    translation.values.insert(name, value);
                }
            }
            ConversionMode::Document => {
                for key in schema.primary_key() {
                    let attr = self.find_attribute(item, key).ok_or_else(|| {
                        ReplicationError::source(format!(
                            "item of {} lacks key attribute {}",
                            schema.qualified_name(),
                            key
                        ))
                    })?;
                    translation.values.insert(key.clone(), convert(attr)?.1);
                }
                let document = serde_json::Value::Object(
                    item.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
                );
                translation
                    .values
                    .insert(DOCUMENT_COLUMN.to_string(), Value::Json(document));
            }
        }

        Ok(translation)
    }

    /// Primary key of an item (or of a change record's key attributes)
    pub fn key_of(&self, keys: &Item, schema: Arc<TableSchema>) -> Result<PrimaryKeyValue> {
        let mut values = Vec::with_capacity(schema.primary_key().len());
        for key in schema.primary_key() {
            let attr = self.find_attribute(keys, key).ok_or_else(|| {
                ReplicationError::source(format!(
                    "key of {} lacks attribute {}",
                    schema.qualified_name(),
                    key
                ))
            })?;
            values.push(convert(attr)?.1);
        }
        Ok(PrimaryKeyValue::new(schema, values)?)
    }

    fn find_attribute<'a>(&self, item: &'a Item, column: &str) -> Option<&'a AttrValue> {
        if let Some(attr) = item.get(column) {
            return Some(attr);
        }
        item.iter()
            .find(|(name, _)| self.column_name(name) == column)
            .map(|(_, attr)| attr)
    }
}

/// Natural column type and value of an attribute (`None` type for NULL)
fn convert(attr: &AttrValue) -> Result<(Option<ColumnType>, Value)> {
    Ok(match attr {
        AttrValue::String(s) => (Some(ColumnType::Text), Value::String(s.clone())),
        AttrValue::Number(n) => (Some(ColumnType::Float), Value::Numeric(Numeric::parse(n)?)),
        AttrValue::Binary(b) => (Some(ColumnType::Binary), Value::Bytes(b.clone())),
        AttrValue::Bool(b) => (Some(ColumnType::Boolean), Value::Bool(*b)),
        AttrValue::Null => (None, Value::Null),
        other => (Some(ColumnType::Document), Value::Json(other.to_json())),
    })
}
