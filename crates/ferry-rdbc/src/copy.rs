//! Text encoding for `COPY ... FROM STDIN`
//!
//! One row per line, fields separated by a tab, `\N` for NULL. Backslash,
//! newline, carriage return and tab inside values are backslash-escaped so
//! an empty string stays distinct from NULL.

use crate::schema::{TableRow, TableSchema};
use crate::types::Value;

/// Field delimiter
pub const DELIMITER: char = '\t';

/// Literal written for NULL
pub const NULL_SENTINEL: &str = "\\N";

/// Marker terminating inline COPY data in a SQL script
pub const END_OF_DATA: &str = "\\.";

/// Escape `text` for the COPY text format and append it to `out`
pub fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
}

/// Append the COPY text form of a single value
pub fn encode_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str(NULL_SENTINEL),
        Value::Bool(b) => out.push(if *b { 't' } else { 'f' }),
        Value::Int64(n) => out.push_str(&n.to_string()),
        Value::Numeric(n) => out.push_str(n.as_str()),
        Value::String(s) => escape_into(s, out),
        // bytea hex form; the leading backslash itself must be escaped
        Value::Bytes(b) => {
            out.push_str("\\\\x");
            out.push_str(&hex::encode(b));
        }
        Value::DateTimeTz(dt) => out.push_str(&dt.to_rfc3339()),
        Value::Json(j) => escape_into(&j.to_string(), out),
    }
}

/// Append one row as a COPY line, columns in schema order.
///
/// Columns the row does not carry are written as NULL.
pub fn encode_row(schema: &TableSchema, row: &TableRow, out: &mut String) {
    for (i, column) in schema.columns().iter().enumerate() {
        if i > 0 {
            out.push(DELIMITER);
        }
        match row.get(&column.name) {
            Some(value) => encode_value(value, out),
            None => out.push_str(NULL_SENTINEL),
        }
    }
    out.push('\n');
}

/// Encode a batch of rows into one COPY payload
pub fn encode_rows(schema: &TableSchema, rows: &[TableRow]) -> String {
    let mut out = String::with_capacity(rows.len() * 64);
    for row in rows {
        encode_row(schema, row, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableColumn;
    use crate::types::ColumnType;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new("public", "t")
                .with_column(TableColumn::new("id", ColumnType::Text))
                .with_column(TableColumn::new("note", ColumnType::Text))
                .with_column(TableColumn::new("flag", ColumnType::Boolean))
                .with_column(TableColumn::new("blob", ColumnType::Binary))
                .with_column(TableColumn::new("doc", ColumnType::Document))
                .with_primary_key(["id"]),
        )
    }

    #[test]
    fn test_escaping() {
        let mut out = String::new();
        escape_into("a\tb\nc\\d\re", &mut out);
        assert_eq!(out, "a\\tb\\nc\\\\d\\re");
    }

    #[test]
    fn test_empty_string_differs_from_null() {
        let mut empty = String::new();
        encode_value(&Value::from(""), &mut empty);
        let mut null = String::new();
        encode_value(&Value::Null, &mut null);

        assert_eq!(empty, "");
        assert_eq!(null, "\\N");
        assert_ne!(empty, null);
    }

    #[test]
    fn test_numbers_written_verbatim() {
        let wide = "12345678901234567890123456789012345678";
        let mut out = String::new();
        encode_value(&Value::Numeric(wide.parse().unwrap()), &mut out);
        out.push('\t');
        encode_value(&Value::Numeric("1E+30".parse().unwrap()), &mut out);
        assert_eq!(out, format!("{}\t1{}", wide, "0".repeat(30)));
    }

    #[test]
    fn test_encode_row_in_schema_order() {
        let schema = schema();
        let mut values = BTreeMap::new();
        values.insert("id".to_string(), Value::from("k1"));
        values.insert("flag".to_string(), Value::Bool(true));
        values.insert("blob".to_string(), Value::Bytes(vec![0x01, 0xab]));
        values.insert("doc".to_string(), Value::Json(json!({"a": "x\ty"})));
        let row = TableRow::new(schema.clone(), values).unwrap();

        let mut out = String::new();
        encode_row(&schema, &row, &mut out);

        assert_eq!(out, "k1\t\\N\tt\t\\\\x01ab\t{\"a\":\"x\\\\ty\"}\n");
    }

    #[test]
    fn test_encode_rows_one_line_each() {
        let schema = schema();
        let rows: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| {
                let mut values = BTreeMap::new();
                values.insert("id".to_string(), Value::from(*id));
                TableRow::new(schema.clone(), values).unwrap()
            })
            .collect();

        let payload = encode_rows(&schema, &rows);
        assert_eq!(payload.lines().count(), 3);
        assert!(payload.ends_with('\n'));
    }
}
