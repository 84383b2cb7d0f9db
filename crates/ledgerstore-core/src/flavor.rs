use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// A database engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Flavor {
    #[serde(rename = "sqlite")]
    Sqlite,
    #[serde(rename = "postgres")]
    PostgreSql,
    #[serde(rename = "mysql")]
    MySql,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Sqlite => "sqlite",
            Flavor::PostgreSql => "postgres",
            Flavor::MySql => "mysql",
        }
    }

    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Flavor::PostgreSql => format!("${}", n),
            Flavor::Sqlite | Flavor::MySql => "?".to_string(),
        }
    }

    /// Whether each ledger lives in its own schema.
    pub fn schema_per_ledger(&self) -> bool {
        matches!(self, Flavor::PostgreSql)
    }

    /// `"<ledger>"."<table>"` where ledgers get a schema, otherwise a table
    /// named `"<ledger>_<table>"` so ledgers sharing one database never
    /// share a table.
    pub fn table(&self, ledger: &str, name: &str) -> String {
        if self.schema_per_ledger() {
            format!("\"{}\".\"{}\"", ledger, name)
        } else {
            format!("\"{}_{}\"", ledger, name)
        }
    }
}

impl Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Flavor::Sqlite),
            "postgres" | "postgresql" => Ok(Flavor::PostgreSql),
            "mysql" => Ok(Flavor::MySql),
            other => Err(format!("unknown flavor: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_qualification() {
        assert_eq!(Flavor::PostgreSql.table("quickstart", "volumes"), "\"quickstart\".\"volumes\"");
        assert_eq!(Flavor::Sqlite.table("quickstart", "volumes"), "\"quickstart_volumes\"");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Flavor::PostgreSql.placeholder(3), "$3");
        assert_eq!(Flavor::Sqlite.placeholder(3), "?");
    }

    #[test]
    fn test_parse() {
        assert_eq!("PostgreSQL".parse::<Flavor>().unwrap(), Flavor::PostgreSql);
        assert!("oracle".parse::<Flavor>().is_err());
    }
}
