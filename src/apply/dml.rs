// ABOUTME: DML synthesis for the target database - parameterized INSERT/UPDATE/DELETE
// ABOUTME: Also renders statements with inlined literals for the apply audit trail

use serde_json::{json, Value};

/// A parameterized statement. Placeholders are `?`, bound in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// SQL text with every placeholder replaced by its literal.
    ///
    /// Strings are single-quoted, null renders as `NULL`, other scalars use
    /// their plain textual form. Placeholders inside quoted identifiers or
    /// string literals are left alone.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.sql.len() + self.params.len() * 8);
        let mut params = self.params.iter();
        let mut start = 0;
        for offset in placeholder_offsets(&self.sql) {
            out.push_str(&self.sql[start..offset]);
            match params.next() {
                Some(value) => out.push_str(&sql_literal(value)),
                None => out.push('?'),
            }
            start = offset + 1;
        }
        out.push_str(&self.sql[start..]);
        out
    }

    /// Bytes stored in the apply record: the rendered statement, or a JSON
    /// document `{"sql": ..., "params": [...]}` when `serialized` is set.
    pub fn audit_bytes(&self, serialized: bool) -> Vec<u8> {
        if serialized {
            json!({ "sql": self.sql, "params": self.params })
                .to_string()
                .into_bytes()
        } else {
            self.render().into_bytes()
        }
    }
}

/// Byte offsets of `?` placeholders outside quoted identifiers and string
/// literals.
fn placeholder_offsets(sql: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut quote: Option<char> = None;
    for (idx, ch) in sql.char_indices() {
        match (quote, ch) {
            (None, '`' | '\'' | '"') => quote = Some(ch),
            (Some(open), _) if ch == open => quote = None,
            (None, '?') => offsets.push(idx),
            _ => {}
        }
    }
    offsets
}

/// Number of `?` placeholders that bind a parameter.
pub fn count_placeholders(sql: &str) -> usize {
    placeholder_offsets(sql).len()
}

/// Quote a MySQL identifier (database, table, column)
///
/// Backticks are doubled inside the quoted name.
pub fn quote_mysql_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('`');
    for ch in identifier.chars() {
        if ch == '`' {
            quoted.push('`');
        }
        quoted.push(ch);
    }
    quoted.push('`');
    quoted
}

/// Render one value as a MySQL literal.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_mysql_string(s),
        other => quote_mysql_string(&other.to_string()),
    }
}

fn quote_mysql_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}

/// `INSERT INTO t (c1, c2) VALUES (?, ?)` with columns in the given order.
pub fn build_insert(table: &str, columns: &[(String, Value)]) -> Statement {
    let names: Vec<String> = columns
        .iter()
        .map(|(name, _)| quote_mysql_ident(name))
        .collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_mysql_ident(table),
        names.join(", "),
        placeholders
    );
    Statement::new(sql, columns.iter().map(|(_, v)| v.clone()).collect())
}

/// `UPDATE t SET c1 = ?, c2 = ? WHERE key = ?`.
pub fn build_update(
    table: &str,
    assignments: &[(String, Value)],
    key_column: &str,
    key_value: Value,
) -> Statement {
    let set_clause: Vec<String> = assignments
        .iter()
        .map(|(name, _)| format!("{} = ?", quote_mysql_ident(name)))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote_mysql_ident(table),
        set_clause.join(", "),
        quote_mysql_ident(key_column)
    );
    let mut params: Vec<Value> = assignments.iter().map(|(_, v)| v.clone()).collect();
    params.push(key_value);
    Statement::new(sql, params)
}

/// `DELETE FROM t WHERE key = ?`.
pub fn build_delete(table: &str, key_column: &str, key_value: Value) -> Statement {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_mysql_ident(table),
        quote_mysql_ident(key_column)
    );
    Statement::new(sql, vec![key_value])
}
