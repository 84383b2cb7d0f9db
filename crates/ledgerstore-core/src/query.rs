//! Read filters and the query specification they compile into.
//!
//! A [`QuerySpec`] is built from a filter with [`QuerySpec::filter`] and then
//! specialised with the free functions [`as_count`], [`as_count_subquery`],
//! [`as_aggregate`] and [`as_distinct`]. Those only touch projection,
//! grouping, ordering and paging, so a derived query matches exactly the rows
//! of its base. [`narrow`] is the one transform that adds a predicate; it is
//! used where a query must match a subset of its base, such as keyset paging.
//!
//! [`Predicate::MetadataEq`] compares the text form of a JSON value: strings
//! unquoted, `true`/`false` for booleans, integers in decimal. Other numbers
//! are compared in the engine's own text form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{flavor::Flavor, value::SqlValue};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_tx_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Matches either side of any posting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub page_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub page_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalancesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub page_size: u64,
}

/// Turns an address pattern into a `LIKE` pattern. `*` matches one or more
/// characters; `%`, `_` and `\` are matched literally.
pub fn address_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    for c in pattern.chars() {
        match c {
            '*' => out.push_str("_%"),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, SqlValue),
    Gt(String, SqlValue),
    Ge(String, SqlValue),
    Lt(String, SqlValue),
    Like(String, String),
    /// Text value of a top-level key in a JSON column.
    MetadataEq { column: String, key: String, value: String },
    In(String, Vec<SqlValue>),
    InSubquery(String, Box<QuerySpec>),
    Any(Vec<Predicate>),
}

impl Predicate {
    /// `column` matched against an address pattern; exact match when it has no wildcard.
    pub fn address(column: &str, pattern: &str) -> Predicate {
        if pattern.contains('*') {
            Predicate::Like(column.to_string(), address_pattern(pattern))
        } else {
            Predicate::Eq(column.to_string(), SqlValue::Text(pattern.to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Table(String),
    Subquery(Box<QuerySpec>),
}

/// An immutable `SELECT`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    source: Source,
    projection: Vec<String>,
    distinct: bool,
    predicates: Vec<Predicate>,
    group_by: Vec<String>,
    order_by: Vec<(String, Order)>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl QuerySpec {
    pub fn select(table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            source: Source::Table(table.into()),
            projection: columns.iter().map(|c| c.to_string()).collect(),
            distinct: false,
            predicates: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn filter_opt(self, predicate: Option<Predicate>) -> Self {
        match predicate {
            Some(p) => self.filter(p),
            None => self,
        }
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.order_by.push((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Renders the SQL text and its bind values for `flavor`.
    pub fn build(&self, flavor: Flavor) -> (String, Vec<SqlValue>) {
        let mut args = Vec::new();
        let sql = self.render(flavor, &mut args);
        (sql, args)
    }

    /// Renders only the `WHERE` clause (empty when unfiltered).
    pub fn where_clause(&self, flavor: Flavor) -> (String, Vec<SqlValue>) {
        let mut args = Vec::new();
        let sql = render_where(&self.predicates, flavor, &mut args);
        (sql, args)
    }

    fn render(&self, flavor: Flavor, args: &mut Vec<SqlValue>) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&self.projection.join(", "));
        sql.push_str(" FROM ");
        match &self.source {
            Source::Table(t) => sql.push_str(t),
            Source::Subquery(inner) => {
                sql.push('(');
                sql.push_str(&inner.render(flavor, args));
                sql.push_str(") AS t");
            }
        }
        sql.push_str(&render_where(&self.predicates, flavor, args));
        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }
        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|(c, o)| match o {
                    Order::Asc => format!("{} ASC", c),
                    Order::Desc => format!("{} DESC", c),
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        // saturating: no table holds more than i64::MAX rows
        if let Some(limit) = self.limit {
            let limit = SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX));
            sql.push_str(&format!(" LIMIT {}", bind(flavor, args, limit)));
        }
        if let Some(offset) = self.offset {
            if self.limit.is_none() && flavor == Flavor::Sqlite {
                sql.push_str(" LIMIT -1");
            }
            let offset = SqlValue::Integer(i64::try_from(offset).unwrap_or(i64::MAX));
            sql.push_str(&format!(" OFFSET {}", bind(flavor, args, offset)));
        }
        sql
    }

    fn without_paging(&self) -> Self {
        let mut spec = self.clone();
        spec.order_by.clear();
        spec.limit = None;
        spec.offset = None;
        spec
    }
}

/// `count(*)` over the same rows, ignoring ordering and paging.
pub fn as_count(spec: &QuerySpec) -> QuerySpec {
    let mut count = spec.without_paging();
    count.projection = vec!["count(*)".to_string()];
    count.distinct = false;
    count.group_by.clear();
    count
}

/// `SELECT count(*) FROM (<spec>) AS t`, for bases whose projection must be preserved.
pub fn as_count_subquery(spec: &QuerySpec) -> QuerySpec {
    QuerySpec {
        source: Source::Subquery(Box::new(spec.without_paging())),
        projection: vec!["count(*)".to_string()],
        distinct: false,
        predicates: Vec::new(),
        group_by: Vec::new(),
        order_by: Vec::new(),
        limit: None,
        offset: None,
    }
}

/// The base query restricted by one more predicate. Projection, grouping,
/// ordering and paging are kept.
pub fn narrow(spec: &QuerySpec, predicate: Predicate) -> QuerySpec {
    spec.clone().filter(predicate)
}

/// Groups the base rows by `group_by` and projects the group keys followed by `aggregates`.
pub fn as_aggregate(spec: &QuerySpec, group_by: &[&str], aggregates: &[&str]) -> QuerySpec {
    let mut agg = spec.without_paging();
    agg.distinct = false;
    agg.group_by = group_by.iter().map(|c| c.to_string()).collect();
    agg.projection = group_by.iter().chain(aggregates).map(|c| c.to_string()).collect();
    agg
}

/// Distinct values of `columns` over the base rows.
pub fn as_distinct(spec: &QuerySpec, columns: &[&str]) -> QuerySpec {
    let mut d = spec.without_paging();
    d.distinct = true;
    d.group_by.clear();
    d.projection = columns.iter().map(|c| c.to_string()).collect();
    d
}

fn bind(flavor: Flavor, args: &mut Vec<SqlValue>, value: SqlValue) -> String {
    args.push(value);
    flavor.placeholder(args.len())
}

fn render_where(predicates: &[Predicate], flavor: Flavor, args: &mut Vec<SqlValue>) -> String {
    if predicates.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = predicates
        .iter()
        .map(|p| render_predicate(p, flavor, args))
        .collect();
    format!(" WHERE {}", parts.join(" AND "))
}

fn render_predicate(p: &Predicate, flavor: Flavor, args: &mut Vec<SqlValue>) -> String {
    match p {
        Predicate::Eq(c, v) => format!("{} = {}", c, bind(flavor, args, v.clone())),
        Predicate::Gt(c, v) => format!("{} > {}", c, bind(flavor, args, v.clone())),
        Predicate::Ge(c, v) => format!("{} >= {}", c, bind(flavor, args, v.clone())),
        Predicate::Lt(c, v) => format!("{} < {}", c, bind(flavor, args, v.clone())),
        Predicate::Like(c, pattern) => format!(
            "{} LIKE {} ESCAPE '\\'",
            c,
            bind(flavor, args, SqlValue::Text(pattern.clone()))
        ),
        Predicate::MetadataEq { column, key, value } => match flavor {
            Flavor::PostgreSql => {
                let k = bind(flavor, args, SqlValue::Text(key.clone()));
                let v = bind(flavor, args, SqlValue::Text(value.clone()));
                format!("(CAST({} AS jsonb) ->> {}) = {}", column, k, v)
            }
            Flavor::Sqlite | Flavor::MySql => {
                // json_extract yields 1/0 for booleans where ->> yields true/false
                let path = format!("$.\"{}\"", key.replace('"', "\\\""));
                let t = bind(flavor, args, SqlValue::Text(path.clone()));
                let k = bind(flavor, args, SqlValue::Text(path));
                let v = bind(flavor, args, SqlValue::Text(value.clone()));
                format!(
                    "(CASE json_type({c}, {t}) WHEN 'true' THEN 'true' WHEN 'false' THEN 'false' \
                     ELSE CAST(json_extract({c}, {k}) AS TEXT) END) = {v}",
                    c = column,
                    t = t,
                    k = k,
                    v = v
                )
            }
        },
        Predicate::In(c, values) => {
            if values.is_empty() {
                return "1 = 0".to_string();
            }
            let holders: Vec<String> = values.iter().map(|v| bind(flavor, args, v.clone())).collect();
            format!("{} IN ({})", c, holders.join(", "))
        }
        Predicate::InSubquery(c, inner) => format!("{} IN ({})", c, inner.render(flavor, args)),
        Predicate::Any(options) => {
            if options.is_empty() {
                return "1 = 0".to_string();
            }
            let parts: Vec<String> = options.iter().map(|o| render_predicate(o, flavor, args)).collect();
            format!("({})", parts.join(" OR "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> QuerySpec {
        QuerySpec::select("volumes", &["account", "asset", "input", "output"])
            .filter(Predicate::address("account", "users:*"))
            .filter(Predicate::Eq("asset".into(), "USD".into()))
            .order_by("account", Order::Asc)
            .limit(10)
            .offset(20)
    }

    #[test]
    fn test_build_postgres() {
        let (sql, args) = base().build(Flavor::PostgreSql);
        assert_eq!(
            sql,
            "SELECT account, asset, input, output FROM volumes WHERE account LIKE $1 ESCAPE '\\' AND asset = $2 ORDER BY account ASC LIMIT $3 OFFSET $4"
        );
        assert_eq!(
            args,
            vec![SqlValue::Text("users:_%".into()), SqlValue::Text("USD".into()), SqlValue::Integer(10), SqlValue::Integer(20)]
        );
    }

    #[test]
    fn test_build_sqlite_placeholders() {
        let (sql, _) = base().build(Flavor::Sqlite);
        assert!(sql.contains("account LIKE ? ESCAPE"));
        assert!(sql.ends_with("LIMIT ? OFFSET ?"));
    }

    #[test]
    fn test_specializations_keep_predicates() {
        let b = base();
        let (where_sql, where_args) = b.where_clause(Flavor::PostgreSql);
        for derived in [
            as_count(&b),
            as_aggregate(&b, &["asset"], &["SUM(input - output)"]),
            as_distinct(&b, &["account"]),
        ] {
            assert_eq!(derived.predicates(), b.predicates());
            assert_eq!(derived.where_clause(Flavor::PostgreSql), (where_sql.clone(), where_args.clone()));
        }
    }

    #[test]
    fn test_count() {
        let (sql, args) = as_count(&base()).build(Flavor::Sqlite);
        assert_eq!(sql, "SELECT count(*) FROM volumes WHERE account LIKE ? ESCAPE '\\' AND asset = ?");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_count_subquery() {
        let (sql, args) = as_count_subquery(&base()).build(Flavor::PostgreSql);
        assert_eq!(
            sql,
            "SELECT count(*) FROM (SELECT account, asset, input, output FROM volumes WHERE account LIKE $1 ESCAPE '\\' AND asset = $2) AS t"
        );
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_aggregate() {
        let (sql, _) = as_aggregate(&base(), &["asset"], &["SUM(input - output)"]).build(Flavor::Sqlite);
        assert_eq!(
            sql,
            "SELECT asset, SUM(input - output) FROM volumes WHERE account LIKE ? ESCAPE '\\' AND asset = ? GROUP BY asset"
        );
    }

    #[test]
    fn test_in_subquery_numbers_placeholders_in_order() {
        let inner = QuerySpec::select("postings", &["txid"]).filter(Predicate::Eq("source".into(), "a".into()));
        let (sql, args) = QuerySpec::select("transactions", &["id"])
            .filter(Predicate::Eq("reference".into(), "r".into()))
            .filter(Predicate::InSubquery("id".into(), Box::new(inner)))
            .limit(5)
            .build(Flavor::PostgreSql);
        assert_eq!(
            sql,
            "SELECT id FROM transactions WHERE reference = $1 AND id IN (SELECT txid FROM postings WHERE source = $2) LIMIT $3"
        );
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let (sql, args) = QuerySpec::select("volumes", &["asset"])
            .filter(Predicate::In("account".into(), vec![]))
            .build(Flavor::Sqlite);
        assert_eq!(sql, "SELECT asset FROM volumes WHERE 1 = 0");
        assert!(args.is_empty());
    }

    #[test]
    fn test_address_pattern_escapes() {
        assert_eq!(address_pattern("a_b:*"), "a\\_b:_%");
        assert_eq!(Predicate::address("account", "bank"), Predicate::Eq("account".into(), "bank".into()));
    }

    #[test]
    fn test_metadata_predicate() {
        let spec = QuerySpec::select("accounts", &["address"]).filter(Predicate::MetadataEq {
            column: "metadata".into(),
            key: "role".into(),
            value: "admin".into(),
        });
        let (sql, args) = spec.build(Flavor::Sqlite);
        assert_eq!(
            sql,
            "SELECT address FROM accounts WHERE (CASE json_type(metadata, ?) WHEN 'true' THEN 'true' \
             WHEN 'false' THEN 'false' ELSE CAST(json_extract(metadata, ?) AS TEXT) END) = ?"
        );
        assert_eq!(args[0], SqlValue::Text("$.\"role\"".into()));
        assert_eq!(args[1], args[0]);
        assert_eq!(args[2], SqlValue::Text("admin".into()));
        let (sql, _) = spec.build(Flavor::PostgreSql);
        assert_eq!(sql, "SELECT address FROM accounts WHERE (CAST(metadata AS jsonb) ->> $1) = $2");
    }

    #[test]
    fn test_narrow_only_adds_a_predicate() {
        let base = QuerySpec::select("transactions", &["id"])
            .filter(Predicate::Eq("reference".into(), "r".into()))
            .order_by("id", Order::Asc)
            .limit(3);
        let narrowed = narrow(&base, Predicate::Gt("id".into(), SqlValue::Integer(7)));
        assert_eq!(narrowed.predicates()[..1], base.predicates()[..]);
        assert_eq!(narrowed.predicates().len(), 2);
        let (sql, _) = narrowed.build(Flavor::Sqlite);
        assert_eq!(sql, "SELECT id FROM transactions WHERE reference = ? AND id > ? ORDER BY id ASC LIMIT ?");
    }

    #[test]
    fn test_paging_values_saturate() {
        let (_, args) = QuerySpec::select("accounts", &["address"])
            .limit(u64::MAX)
            .offset(u64::MAX)
            .build(Flavor::Sqlite);
        assert_eq!(args, vec![SqlValue::Integer(i64::MAX), SqlValue::Integer(i64::MAX)]);
    }
}
