//! SQL injection prevention helpers.
//!
//! Every identifier that reaches generated SQL is double-quoted, so source
//! table and attribute names may contain any character except NUL. What
//! PostgreSQL does not tolerate is silent truncation: identifiers longer than
//! 63 bytes are cut, which would map two different attributes onto one column.

use crate::error::Error;

/// Longest identifier PostgreSQL keeps without truncation
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Validate an identifier that will be emitted in quoted form.
///
/// # Examples
///
/// ```
/// use ferry_rdbc::security::validate_quoted_identifier;
///
/// assert!(validate_quoted_identifier("orders").is_ok());
/// assert!(validate_quoted_identifier("Order-Items.v2").is_ok());
///
/// assert!(validate_quoted_identifier("").is_err());
/// assert!(validate_quoted_identifier("bad\0name").is_err());
/// assert!(validate_quoted_identifier(&"x".repeat(64)).is_err());
/// ```
pub fn validate_quoted_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_BYTES {
        return Err(Error::config(format!(
            "SQL identifier '{}' is {} bytes (max {})",
            name,
            name.len(),
            MAX_IDENTIFIER_BYTES
        )));
    }

    if name.contains('\0') {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains NUL",
            name.escape_debug()
        )));
    }

    Ok(())
}

/// Escape a string value for safe interpolation into a SQL string literal context.
///
/// Replaces `'` with `''`. Used for catalog queries and script output where
/// the SQL must be returned as a complete string.
///
/// # Examples
///
/// ```
/// use ferry_rdbc::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("users"), "users");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// assert_eq!(escape_string_literal("x'; DROP TABLE users--"), "x''; DROP TABLE users--");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    // Fast path: no escaping needed (common case)
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}
