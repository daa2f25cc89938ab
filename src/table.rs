//! Outbox table naming and schema.
//!
//! The table name is interpolated into every statement the outbox issues, so it
//! is validated once up front and carried around as a [`Table`].

use std::fmt;

use crate::{error::Error, message::MessageState};

/// A validated outbox table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table(String);

impl Table {
    /// Validates `name` as a plain SQL identifier.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the name is empty or contains anything
    /// other than ASCII letters, digits and underscores (or starts with a digit).
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();

        let mut chars = name.chars();
        match chars.next() {
            None => return Err(Error::configuration("table not defined")),
            Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
                return Err(Error::configuration(format!(
                    "invalid table name {name:?}"
                )))
            }
            Some(_) => {}
        }

        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::configuration(format!("invalid table name {name:?}")));
        }

        Ok(Self(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// The name as a quoted identifier, safe to interpolate even when it is a
    /// keyword such as `order`.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// DDL for an outbox table: the base message columns plus application-defined
/// extension columns.
#[derive(Debug, Clone)]
pub struct Schema {
    table: Table,
    columns: Vec<(String, String)>,
}

impl Schema {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            columns: Vec::new(),
        }
    }

    /// Appends an extension column, e.g. `column("cpu", "INTEGER NOT NULL DEFAULT 0")`.
    ///
    /// Definitions are used verbatim.
    pub fn column(mut self, name: impl Into<String>, definition: impl Into<String>) -> Self {
        self.columns.push((name.into(), definition.into()));
        self
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Idempotent statements creating the table and its state index.
    pub fn create_statements(&self) -> Vec<String> {
        let table = self.table.quoted();
        let index = format!("\"{}_state_idx\"", self.table.name());

        let mut columns = vec![
            "message_id TEXT NOT NULL".to_owned(),
            "create_time INTEGER NOT NULL DEFAULT 0".to_owned(),
            "update_time INTEGER NOT NULL DEFAULT 0".to_owned(),
            "delete_time INTEGER NOT NULL DEFAULT 0".to_owned(),
            "try_times INTEGER NOT NULL DEFAULT 0".to_owned(),
            format!(
                "state TEXT NOT NULL DEFAULT '{}'",
                MessageState::Created.as_ref()
            ),
        ];
        columns.extend(
            self.columns
                .iter()
                .map(|(name, definition)| format!("{name} {definition}")),
        );
        columns.push("PRIMARY KEY (message_id)".to_owned());

        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)",
                columns.join(",\n    ")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {table} (state, create_time)"
            ),
        ]
    }

    /// Drops the table, then recreates it. Destroys every message.
    pub fn reset_statements(&self) -> Vec<String> {
        let mut statements = vec![format!("DROP TABLE IF EXISTS {}", self.table.quoted())];
        statements.extend(self.create_statements());
        statements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(Table::new("my_mq").is_ok());
        assert!(Table::new("_outbox2").is_ok());

        assert!(matches!(
            Table::new(""),
            Err(Error::Configuration { .. })
        ));
        assert!(Table::new("2fast").is_err());
        assert!(Table::new("outbox; DROP TABLE users").is_err());
        assert!(Table::new("my-mq").is_err());

        // keywords are fine, statements quote them
        assert!(Table::new("order").is_ok());
    }

    #[test]
    fn test_create_statements() {
        let schema = Schema::new(Table::new("my_mq").unwrap())
            .column("resource_id", "TEXT NOT NULL DEFAULT ''")
            .column("cpu", "INTEGER NOT NULL DEFAULT 0");

        let statements = schema.create_statements();
        assert_eq!(statements.len(), 2);

        let create = &statements[0];
        assert!(create.starts_with("CREATE TABLE IF NOT EXISTS \"my_mq\" ("));
        assert!(create.contains("message_id TEXT NOT NULL"));
        assert!(create.contains("state TEXT NOT NULL DEFAULT 'Created'"));
        assert!(create.contains("resource_id TEXT NOT NULL DEFAULT ''"));
        assert!(create.contains("PRIMARY KEY (message_id)"));

        // extension columns come after the base columns
        assert!(create.find("try_times").unwrap() < create.find("cpu").unwrap());

        assert_eq!(
            statements[1],
            "CREATE INDEX IF NOT EXISTS \"my_mq_state_idx\" ON \"my_mq\" (state, create_time)"
        );
    }

    #[test]
    fn test_reset_drops_first() {
        let schema = Schema::new(Table::new("my_mq").unwrap());
        let statements = schema.reset_statements();

        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "DROP TABLE IF EXISTS \"my_mq\"");
        assert_eq!(&statements[1..], schema.create_statements().as_slice());
    }
}
