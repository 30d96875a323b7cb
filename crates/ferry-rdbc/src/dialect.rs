//! SQL dialect for the replicated tables
//!
//! Statement generation uses sea-query where it has a builder (upsert,
//! delete, select); DDL and COPY statements are assembled by hand.
//!
//! - Identifier quoting and type mapping
//! - `INSERT ... ON CONFLICT` upserts keyed by the primary key
//! - Citus distribution helpers
//! - SQL literals for script output

use crate::schema::{TableColumn, TableIndex, TableSchema};
use crate::security::escape_string_literal;
use crate::types::{ColumnType, Value};
use sea_query::{Alias, Expr, IntoIden, OnConflict, Order, PostgresQueryBuilder, Query, TableRef};

fn sea_table_ref(schema: &TableSchema) -> TableRef {
    TableRef::SchemaTable(
        Alias::new(schema.namespace.as_str()).into_iden(),
        Alias::new(schema.name.as_str()).into_iden(),
    )
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a parameter (e.g., $1)
    fn placeholder(&self, index: usize) -> String;

    /// Native type for a semantic column type
    fn native_type(&self, column_type: ColumnType) -> &'static str;

    /// Semantic type for a native type name reported by introspection
    fn semantic_type(&self, data_type: &str) -> ColumnType;

    /// Get the SQL for listing columns with their primary key position
    fn list_columns_sql(&self, namespace: &str, table: &str) -> String;

    /// `CREATE TABLE` followed by index and distribution statements
    fn create_table_sql(&self, schema: &TableSchema) -> Vec<String>;

    /// `ALTER TABLE ... ADD COLUMN`
    fn add_column_sql(&self, schema: &TableSchema, column: &TableColumn) -> String;

    /// Upsert with the given value expressions, one per schema column
    fn upsert_statement(&self, schema: &TableSchema, values: Vec<String>) -> String;

    /// Delete keyed by the primary key with the given value expressions
    fn delete_statement(&self, schema: &TableSchema, key_values: Vec<String>) -> String;

    /// Select the largest primary key
    fn max_primary_key_sql(&self, schema: &TableSchema) -> String;

    /// Bulk load statement
    fn copy_from_stdin_sql(&self, schema: &TableSchema) -> String;

    /// Render a value as a SQL literal
    fn literal(&self, value: &Value) -> String;

    /// Qualified `namespace.table`
    fn qualified_name(&self, schema: &TableSchema) -> String {
        format!(
            "{}.{}",
            self.quote_identifier(&schema.namespace),
            self.quote_identifier(&schema.name)
        )
    }

    /// Parameterized upsert (`$1..$n` in schema column order)
    fn upsert_sql(&self, schema: &TableSchema) -> String {
        let values = (1..=schema.columns().len())
            .map(|i| self.placeholder(i))
            .collect();
        self.upsert_statement(schema, values)
    }

    /// Parameterized delete (`$1..$n` in key order)
    fn delete_sql(&self, schema: &TableSchema) -> String {
        let values = (1..=schema.primary_key().len())
            .map(|i| self.placeholder(i))
            .collect();
        self.delete_statement(schema, values)
    }
}

/// PostgreSQL dialect (with Citus extensions)
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Query detecting the Citus extension
    pub const HAS_CITUS_SQL: &'static str = "SELECT 1 FROM pg_extension WHERE extname = 'citus'";

    /// Query returning the distribution column of `$1` (a qualified table name)
    pub const DISTRIBUTION_COLUMN_SQL: &'static str =
        "SELECT column_to_column_name(logicalrelid, partkey)::text FROM pg_dist_partition WHERE logicalrelid = $1::text::regclass";

    /// `CREATE INDEX` for a secondary index
    pub fn create_index_sql(&self, schema: &TableSchema, index: &TableIndex) -> String {
        let columns: Vec<_> = index
            .columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect();
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.quote_identifier(&index.name),
            self.qualified_name(schema),
            columns.join(", ")
        )
    }

    /// `create_distributed_table` call, when the schema has a distribution column
    pub fn distribute_table_sql(&self, schema: &TableSchema) -> Option<String> {
        schema.distribution_column.as_ref().map(|column| {
            format!(
                "SELECT create_distributed_table('{}', '{}')",
                escape_string_literal(&self.qualified_name(schema)),
                escape_string_literal(column)
            )
        })
    }

    fn column_definition(&self, column: &TableColumn) -> String {
        let mut def = format!(
            "{} {}",
            self.quote_identifier(&column.name),
            self.native_type(column.column_type)
        );
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn native_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            // source numbers carry up to 38 significant digits
            ColumnType::Float => "NUMERIC",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Binary => "BYTEA",
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::Document => "JSONB",
        }
    }

    fn semantic_type(&self, data_type: &str) -> ColumnType {
        match data_type.to_lowercase().as_str() {
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" => ColumnType::Integer,
            "numeric" | "decimal" | "real" | "double precision" | "float4" | "float8" => {
                ColumnType::Float
            }
            "boolean" | "bool" => ColumnType::Boolean,
            "bytea" => ColumnType::Binary,
            "timestamp with time zone"
            | "timestamp without time zone"
            | "timestamptz"
            | "timestamp"
            | "date" => ColumnType::Timestamp,
            "json" | "jsonb" => ColumnType::Document,
            _ => ColumnType::Text,
        }
    }

    fn list_columns_sql(&self, namespace: &str, table: &str) -> String {
        let namespace = escape_string_literal(namespace);
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                c.is_nullable = 'YES' AS nullable,
                pk.ordinal_position::int AS pk_ordinal
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT ku.column_name, ku.ordinal_position
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                    ON tc.constraint_name = ku.constraint_name
                    AND tc.table_schema = ku.table_schema
                    AND tc.table_name = ku.table_name
                WHERE tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema = '{}'
                    AND tc.table_name = '{}'
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_schema = '{}' AND c.table_name = '{}'
            ORDER BY c.ordinal_position"#,
            namespace, table, namespace, table
        )
    }

    fn create_table_sql(&self, schema: &TableSchema) -> Vec<String> {
        let mut definitions: Vec<_> = schema
            .columns()
            .iter()
            .map(|c| self.column_definition(c))
            .collect();
        let key: Vec<_> = schema
            .primary_key()
            .iter()
            .map(|k| self.quote_identifier(k))
            .collect();
        definitions.push(format!("PRIMARY KEY ({})", key.join(", ")));

        let mut statements = vec![format!(
            "CREATE TABLE {} ({})",
            self.qualified_name(schema),
            definitions.join(", ")
        )];
        statements.extend(
            schema
                .indexes
                .iter()
                .map(|index| self.create_index_sql(schema, index)),
        );
        statements.extend(self.distribute_table_sql(schema));
        statements
    }

    fn add_column_sql(&self, schema: &TableSchema, column: &TableColumn) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
            self.qualified_name(schema),
            self.column_definition(column)
        )
    }

    fn upsert_statement(&self, schema: &TableSchema, values: Vec<String>) -> String {
        let col_idens: Vec<_> = schema
            .columns()
            .iter()
            .map(|c| Alias::new(c.name.as_str()).into_iden())
            .collect();
        let update_cols: Vec<_> = schema
            .value_columns()
            .map(|c| Alias::new(c.name.as_str()).into_iden())
            .collect();
        let pk_idens: Vec<_> = schema
            .primary_key()
            .iter()
            .map(|c| Alias::new(c.as_str()).into_iden())
            .collect();

        let exprs: Vec<_> = values.into_iter().map(Expr::cust).collect();

        let mut on_conflict = OnConflict::columns(pk_idens);
        if update_cols.is_empty() {
            on_conflict.do_nothing();
        } else {
            on_conflict.update_columns(update_cols);
        }

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(schema))
            .columns(col_idens)
            .values_panic(exprs)
            .on_conflict(on_conflict.to_owned());

        stmt.to_string(PostgresQueryBuilder)
    }

    fn delete_statement(&self, schema: &TableSchema, key_values: Vec<String>) -> String {
        // one custom predicate: sea-query parenthesizes custom operands of `=`
        let predicate = schema
            .primary_key()
            .iter()
            .zip(key_values)
            .map(|(col, value)| format!("{} = {}", self.quote_identifier(col), value))
            .collect::<Vec<_>>()
            .join(" AND ");

        let mut stmt = Query::delete();
        stmt.from_table(sea_table_ref(schema))
            .and_where(Expr::cust(predicate));

        stmt.to_string(PostgresQueryBuilder)
    }

    fn max_primary_key_sql(&self, schema: &TableSchema) -> String {
        let mut stmt = Query::select();
        stmt.from(sea_table_ref(schema));
        for col in schema.primary_key() {
            stmt.column(Alias::new(col.as_str()));
        }
        for col in schema.primary_key() {
            stmt.order_by(Alias::new(col.as_str()), Order::Desc);
        }
        stmt.limit(1);

        stmt.to_string(PostgresQueryBuilder)
    }

    fn copy_from_stdin_sql(&self, schema: &TableSchema) -> String {
        let columns: Vec<_> = schema
            .columns()
            .iter()
            .map(|c| self.quote_identifier(&c.name))
            .collect();
        format!(
            "COPY {} ({}) FROM STDIN",
            self.qualified_name(schema),
            columns.join(", ")
        )
    }

    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
            Value::Int64(n) => n.to_string(),
            Value::Numeric(n) => n.to_string(),
            Value::String(s) => format!("'{}'", escape_string_literal(s)),
            Value::Bytes(b) => format!("'\\x{}'::bytea", hex::encode(b)),
            Value::DateTimeTz(dt) => format!("'{}'::timestamptz", dt.to_rfc3339()),
            Value::Json(j) => format!("'{}'::jsonb", escape_string_literal(&j.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Numeric;
    use pretty_assertions::assert_eq;

    fn orders() -> TableSchema {
        TableSchema::new("public", "Orders")
            .with_column(TableColumn::new("id", ColumnType::Float))
            .with_column(TableColumn::new("name", ColumnType::Text))
            .with_primary_key(["id"])
    }

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(PostgresDialect.quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_create_table_sql() {
        let schema = orders()
            .with_index(TableIndex::new("by_name", vec!["name".into()]))
            .with_distribution_column("id");
        let stmts = PostgresDialect.create_table_sql(&schema);

        assert_eq!(
            stmts[0],
            "CREATE TABLE \"public\".\"Orders\" (\"id\" NUMERIC NOT NULL, \"name\" TEXT, PRIMARY KEY (\"id\"))"
        );
        assert_eq!(
            stmts[1],
            "CREATE INDEX IF NOT EXISTS \"by_name\" ON \"public\".\"Orders\" (\"name\")"
        );
        assert_eq!(
            stmts[2],
            "SELECT create_distributed_table('\"public\".\"Orders\"', 'id')"
        );
    }

    #[test]
    fn test_upsert_updates_value_columns() {
        let sql = PostgresDialect.upsert_sql(&orders());
        assert!(sql.starts_with("INSERT INTO \"public\".\"Orders\" (\"id\", \"name\") VALUES ($1, $2)"));
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET \"name\" = \"excluded\".\"name\""));
    }

    #[test]
    fn test_upsert_key_only_table_does_nothing() {
        let schema = TableSchema::new("public", "keys")
            .with_column(TableColumn::new("k", ColumnType::Text))
            .with_primary_key(["k"]);
        let sql = PostgresDialect.upsert_sql(&schema);
        assert!(sql.contains("ON CONFLICT (\"k\") DO NOTHING"));
    }

    #[test]
    fn test_delete_and_max_key_sql() {
        let schema = orders();
        assert_eq!(
            PostgresDialect.delete_sql(&schema),
            "DELETE FROM \"public\".\"Orders\" WHERE \"id\" = $1"
        );
        assert_eq!(
            PostgresDialect.max_primary_key_sql(&schema),
            "SELECT \"id\" FROM \"public\".\"Orders\" ORDER BY \"id\" DESC LIMIT 1"
        );
    }

    #[test]
    fn test_delete_with_composite_key() {
        let schema = TableSchema::new("public", "lines")
            .with_column(TableColumn::new("order", ColumnType::Text))
            .with_column(TableColumn::new("line", ColumnType::Integer))
            .with_primary_key(["order", "line"]);
        assert_eq!(
            PostgresDialect.delete_sql(&schema),
            "DELETE FROM \"public\".\"lines\" WHERE \"order\" = $1 AND \"line\" = $2"
        );
    }

    #[test]
    fn test_copy_and_add_column_sql() {
        let schema = orders();
        assert_eq!(
            PostgresDialect.copy_from_stdin_sql(&schema),
            "COPY \"public\".\"Orders\" (\"id\", \"name\") FROM STDIN"
        );
        assert_eq!(
            PostgresDialect.add_column_sql(&schema, &TableColumn::new("discount", ColumnType::Float)),
            "ALTER TABLE \"public\".\"Orders\" ADD COLUMN IF NOT EXISTS \"discount\" NUMERIC"
        );
    }

    #[test]
    fn test_semantic_type_round_trip() {
        let d = PostgresDialect;
        for ty in [
            ColumnType::Text,
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::Boolean,
            ColumnType::Binary,
            ColumnType::Timestamp,
            ColumnType::Document,
        ] {
            assert_eq!(d.semantic_type(d.native_type(ty)), ty);
        }
        assert_eq!(d.semantic_type("character varying"), ColumnType::Text);
    }

    #[test]
    fn test_literals() {
        let d = PostgresDialect;
        assert_eq!(d.literal(&Value::from("it's")), "'it''s'");
        assert_eq!(d.literal(&Value::Null), "NULL");
        assert_eq!(d.literal(&Value::Bytes(vec![0xff])), "'\\xff'::bytea");
        assert_eq!(
            d.literal(&Value::Numeric(Numeric::parse("1E+30").unwrap())),
            "1000000000000000000000000000000"
        );
    }
}
