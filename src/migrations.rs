//! Schema scripts, one ordered set per flavor.
//!
//! A script holds one or more statements separated by a line reading
//! `--statement`. Every occurrence of `VAR_LEDGER_NAME` is replaced with the
//! ledger name before the script is split.

use std::collections::BTreeMap;

use ledgerstore_core::{Flavor, StorageError};

pub const STATEMENT_DELIMITER: &str = "--statement";
pub const LEDGER_NAME_TOKEN: &str = "VAR_LEDGER_NAME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct Migrations {
    by_flavor: BTreeMap<Flavor, Vec<MigrationFile>>,
}

impl Migrations {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The scripts shipped with the crate.
    pub fn embedded() -> Self {
        Self::empty()
            .with_file(Flavor::Sqlite, "0-init-schema.sql", include_str!("../migrations/sqlite/0-init-schema.sql"))
            .with_file(Flavor::Sqlite, "1-indexes.sql", include_str!("../migrations/sqlite/1-indexes.sql"))
            .with_file(Flavor::PostgreSql, "0-init-schema.sql", include_str!("../migrations/postgres/0-init-schema.sql"))
            .with_file(Flavor::PostgreSql, "1-indexes.sql", include_str!("../migrations/postgres/1-indexes.sql"))
    }

    /// Adds a script. Scripts of one flavor run in file-name order.
    pub fn with_file(mut self, flavor: Flavor, name: &str, content: &str) -> Self {
        let files = self.by_flavor.entry(flavor).or_default();
        files.push(MigrationFile {
            name: name.to_string(),
            content: content.to_string(),
        });
        files.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }

    pub fn files(&self, flavor: Flavor) -> Option<&[MigrationFile]> {
        self.by_flavor.get(&flavor).map(Vec::as_slice)
    }

    /// Every statement for `flavor`, in execution order, with the ledger name substituted.
    pub fn statements(&self, flavor: Flavor, ledger: &str) -> Result<Vec<String>, StorageError> {
        let files = self
            .files(flavor)
            .ok_or_else(|| StorageError::NotFound(format!("no migrations for flavor {}", flavor)))?;

        let mut statements = Vec::new();
        for file in files {
            tracing::debug!(file = %file.name, "loading migration");
            let plain = file.content.replace(LEDGER_NAME_TOKEN, ledger);
            statements.extend(split_statements(&plain));
        }
        Ok(statements)
    }
}

fn split_statements(script: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in script.lines() {
        if line.trim() == STATEMENT_DELIMITER {
            out.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    out.push(current);
    out
}
