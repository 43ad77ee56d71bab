// ABOUTME: Ordinal column maps between source binlog rows and target tables
// ABOUTME: Names positional binlog values and translates source columns to target columns

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::apply::dml::count_placeholders;
use crate::config::TableConfig;
use crate::model::RowImage;

/// Validated replication rules for one source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub table: String,
    pub skip: bool,
    pub source_columns: Vec<String>,
    pub target_columns: Vec<String>,
    pub primary_key: String,
    pub identity_domain: String,
    pub foreign_keys: BTreeMap<String, String>,
    pub target_table: String,
    pub delete_statement: Option<String>,
}

impl TableMapping {
    fn from_config(table: &str, config: &TableConfig) -> Result<Self> {
        let mapping = Self {
            table: table.to_string(),
            skip: config.skip,
            source_columns: config.source_columns.clone(),
            target_columns: config.target_columns.clone(),
            primary_key: config.primary_key.clone(),
            identity_domain: config.identity_domain.clone(),
            foreign_keys: config.foreign_keys.clone(),
            target_table: config
                .target_table
                .clone()
                .unwrap_or_else(|| table.to_string()),
            delete_statement: config.delete_statement.clone(),
        };
        mapping.validate()?;
        Ok(mapping)
    }

    fn validate(&self) -> Result<()> {
        if self.source_columns.len() != self.target_columns.len() {
            bail!(
                "table {}: source_columns has {} entries but target_columns has {}",
                self.table,
                self.source_columns.len(),
                self.target_columns.len()
            );
        }
        for (idx, column) in self.source_columns.iter().enumerate() {
            if self.source_columns[..idx].contains(column) {
                bail!("table {}: source column {} listed twice", self.table, column);
            }
        }
        if self.skip {
            return Ok(());
        }
        if self.source_columns.is_empty() {
            bail!(
                "table {}: source_columns/target_columns are required unless skip = true",
                self.table
            );
        }
        if self.position(&self.primary_key).is_none() {
            bail!(
                "table {}: primary key {} is not in source_columns",
                self.table,
                self.primary_key
            );
        }
        for column in self.foreign_keys.keys() {
            if self.position(column).is_none() {
                bail!(
                    "table {}: foreign key column {} is not in source_columns",
                    self.table,
                    column
                );
            }
        }
        if let Some(statement) = &self.delete_statement {
            if count_placeholders(statement) != 1 {
                bail!(
                    "table {}: delete_statement must contain exactly one ? placeholder",
                    self.table
                );
            }
        }
        Ok(())
    }

    fn position(&self, source_column: &str) -> Option<usize> {
        self.source_columns.iter().position(|c| c == source_column)
    }

    /// Target column fed by the given source column.
    pub fn target_column(&self, source_column: &str) -> Option<&str> {
        self.position(source_column)
            .map(|idx| self.target_columns[idx].as_str())
    }

    pub fn target_primary_key(&self) -> &str {
        self.target_column(&self.primary_key)
            .unwrap_or(self.primary_key.as_str())
    }

    /// (source, target) column pairs written by an insert, in ordinal order.
    /// The primary key is left out so the target assigns its own.
    pub fn insert_columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.source_columns
            .iter()
            .zip(self.target_columns.iter())
            .filter(move |(source, _)| **source != self.primary_key)
            .map(|(source, target)| (source.as_str(), target.as_str()))
    }

    /// Source columns in ordinal order, for deterministic SET clauses.
    pub fn ordinal(&self, source_column: &str) -> usize {
        self.position(source_column).unwrap_or(usize::MAX)
    }

    pub fn foreign_key_domain(&self, source_column: &str) -> Option<&str> {
        self.foreign_keys.get(source_column).map(String::as_str)
    }
}

/// All configured tables, keyed by source table name.
#[derive(Debug, Clone, Default)]
pub struct TableMappings {
    tables: BTreeMap<String, TableMapping>,
}

impl TableMappings {
    pub fn from_config(tables: &BTreeMap<String, TableConfig>) -> Result<Self> {
        let mut out = BTreeMap::new();
        for (name, config) in tables {
            out.insert(name.clone(), TableMapping::from_config(name, config)?);
        }
        Ok(Self { tables: out })
    }

    pub fn get(&self, table: &str) -> Option<&TableMapping> {
        self.tables.get(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableMapping> {
        self.tables.values()
    }

    /// Name the positional values of one binlog row.
    ///
    /// Binlog rows expose columns by ordinal only. Ordinals without a
    /// configured name are keyed `col<N>`.
    pub fn name_row(&self, table: &str, values: Vec<Value>) -> RowImage {
        let names = self
            .get(table)
            .map(|m| m.source_columns.as_slice())
            .unwrap_or(&[]);
        values
            .into_iter()
            .enumerate()
            .map(|(idx, value)| {
                let name = names
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| format!("col{}", idx));
                (name, value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn example_config() -> TableConfig {
        TableConfig {
            source_columns: vec![
                "id".to_string(),
                "foreign_id".to_string(),
                "some_fields_change".to_string(),
            ],
            target_columns: vec![
                "id".to_string(),
                "foreign_id".to_string(),
                "some_fields".to_string(),
            ],
            primary_key: "id".to_string(),
            identity_domain: "primary_id".to_string(),
            foreign_keys: BTreeMap::from([("foreign_id".to_string(), "foreign_id".to_string())]),
            ..TableConfig::default()
        }
    }

    fn mappings() -> TableMappings {
        TableMappings::from_config(&BTreeMap::from([(
            "example_table".to_string(),
            example_config(),
        )]))
        .unwrap()
    }

    #[test]
    fn names_positional_values() {
        let row = mappings().name_row("example_table", vec![json!(7), json!(3), json!("x")]);
        assert_eq!(row["id"], json!(7));
        assert_eq!(row["foreign_id"], json!(3));
        assert_eq!(row["some_fields_change"], json!("x"));
    }

    #[test]
    fn unnamed_ordinals_get_placeholder_names() {
        let row = mappings().name_row("unknown_table", vec![json!(1), json!(null)]);
        assert_eq!(row["col0"], json!(1));
        assert_eq!(row["col1"], json!(null));
    }

    #[test]
    fn insert_columns_skip_primary_key_and_translate() {
        let mappings = mappings();
        let table = mappings.get("example_table").unwrap();
        let columns: Vec<_> = table.insert_columns().collect();
        assert_eq!(
            columns,
            vec![
                ("foreign_id", "foreign_id"),
                ("some_fields_change", "some_fields")
            ]
        );
        assert_eq!(table.target_primary_key(), "id");
        assert_eq!(table.target_table, "example_table");
    }

    #[test]
    fn rejects_mismatched_column_lists() {
        let mut config = example_config();
        config.target_columns.pop();
        let err = TableMapping::from_config("t", &config).unwrap_err();
        assert!(err.to_string().contains("target_columns"));
    }

    #[test]
    fn rejects_unknown_foreign_key_column() {
        let mut config = example_config();
        config
            .foreign_keys
            .insert("owner_id".to_string(), "owner".to_string());
        assert!(TableMapping::from_config("t", &config).is_err());
    }

    #[test]
    fn rejects_delete_statement_without_single_placeholder() {
        let mut config = example_config();
        config.delete_statement = Some("DELETE FROM t WHERE id = ? OR id = ?".to_string());
        assert!(TableMapping::from_config("t", &config).is_err());
    }

    #[test]
    fn quoted_question_marks_are_not_placeholders() {
        let mut config = example_config();
        config.delete_statement =
            Some("UPDATE t SET note = 'gone?' WHERE id = ?".to_string());
        let mapping = TableMapping::from_config("t", &config).unwrap();
        assert!(mapping.delete_statement.is_some());

        config.delete_statement = Some("UPDATE t SET note = 'gone?'".to_string());
        assert!(TableMapping::from_config("t", &config).is_err());
    }

    #[test]
    fn skip_tables_need_no_columns() {
        let config = TableConfig {
            skip: true,
            primary_key: "id".to_string(),
            ..TableConfig::default()
        };
        assert!(TableMapping::from_config("audit", &config).is_ok());
    }
}
