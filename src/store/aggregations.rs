use std::collections::BTreeMap;

use ledgerstore_core::{
    cursor::{check_offset, clamp_page_size, encode_token, next_offset, Cursor},
    query::{as_aggregate, as_distinct, Order, Predicate, QuerySpec},
    AggregatedBalances, BalancesQuery, Balances, Connection, Context, SqlValue, StorageError, TxMode, Volume, Volumes,
};

use super::Store;

const VOLUME_COLUMNS: &[&str] = &["account", "asset", "input", "output"];

impl Store {
    fn volumes_query(&self, address: Option<&str>) -> QuerySpec {
        QuerySpec::select(self.table("volumes"), VOLUME_COLUMNS)
            .filter_opt(address.map(|a| Predicate::address("account", a)))
    }

    pub(super) fn read_volume(
        &self,
        conn: &mut dyn Connection,
        ctx: &Context,
        account: &str,
        asset: &str,
    ) -> Result<Volume, StorageError> {
        let (sql, args) = QuerySpec::select(self.table("volumes"), &["input", "output"])
            .filter(Predicate::Eq("account".to_string(), account.into()))
            .filter(Predicate::Eq("asset".to_string(), asset.into()))
            .build(self.flavor);
        match conn.query_opt(ctx, &sql, &args)? {
            Some(row) => Ok(Volume::new(row.get_i64(0)?, row.get_i64(1)?)),
            None => Ok(Volume::default()),
        }
    }

    pub(super) fn read_account_volumes(
        &self,
        conn: &mut dyn Connection,
        ctx: &Context,
        account: &str,
    ) -> Result<Volumes, StorageError> {
        let (sql, args) = QuerySpec::select(self.table("volumes"), &["asset", "input", "output"])
            .filter(Predicate::Eq("account".to_string(), account.into()))
            .order_by("asset", Order::Asc)
            .build(self.flavor);
        let mut volumes = Volumes::new();
        for row in conn.query(ctx, &sql, &args)? {
            volumes.insert(row.get_string(0)?, Volume::new(row.get_i64(1)?, row.get_i64(2)?));
        }
        Ok(volumes)
    }

    /// Input/output per asset for one account. Assets without a row are absent.
    #[tracing::instrument(skip(self, ctx), fields(ledger = %self.ledger), err)]
    pub fn get_account_volumes(&self, ctx: &Context, address: &str) -> Result<Volumes, StorageError> {
        let mut conn = self.conn()?;
        self.read_account_volumes(&mut **conn, ctx, address)
    }

    /// Zero when the account never moved `asset`.
    #[tracing::instrument(skip(self, ctx), fields(ledger = %self.ledger), err)]
    pub fn get_account_volume(&self, ctx: &Context, address: &str, asset: &str) -> Result<Volume, StorageError> {
        let mut conn = self.conn()?;
        self.read_volume(&mut **conn, ctx, address, asset)
    }

    /// Per-asset balances summed over every account matching `q`, plus the
    /// per-account balances of one page of those accounts.
    ///
    /// Both halves are read inside one snapshot transaction. The page is
    /// counted in accounts, ordered by address.
    #[tracing::instrument(skip(self, ctx, q), fields(ledger = %self.ledger), err)]
    pub fn get_aggregated_balances(
        &self,
        ctx: &Context,
        q: &BalancesQuery,
    ) -> Result<Cursor<AggregatedBalances>, StorageError> {
        let page_size = clamp_page_size(q.page_size);
        let offset = check_offset(q.offset)?;
        let base = self.volumes_query(q.address.as_deref());

        self.in_tx(ctx, TxMode::ReadSnapshot, |conn| {
            let (sql, args) = as_aggregate(
                &base,
                &["asset"],
                &["CAST(SUM(input) AS BIGINT)", "CAST(SUM(output) AS BIGINT)"],
            )
            .build(self.flavor);
            let mut aggregated = Balances::new();
            for row in conn.query(ctx, &sql, &args)? {
                let volume = Volume::new(row.get_i64_or_zero(1)?, row.get_i64_or_zero(2)?);
                aggregated.insert(row.get_string(0)?, volume.balance());
            }

            let (sql, args) = as_distinct(&base, &["account"])
                .order_by("account", Order::Asc)
                .limit(page_size + 1)
                .offset(offset)
                .build(self.flavor);
            let mut page = conn
                .query(ctx, &sql, &args)?
                .iter()
                .map(|row| row.get_string(0))
                .collect::<Result<Vec<_>, _>>()?;
            let has_more = page.len() as u64 > page_size;
            page.truncate(page_size as usize);

            // restricted to the accounts of this page
            let (sql, args) = base
                .clone()
                .filter(Predicate::In(
                    "account".to_string(),
                    page.iter().map(|a| SqlValue::from(a.as_str())).collect(),
                ))
                .order_by("account", Order::Asc)
                .order_by("asset", Order::Asc)
                .build(self.flavor);
            let mut accounts: BTreeMap<String, Balances> =
                page.iter().map(|a| (a.clone(), Balances::new())).collect();
            for row in conn.query(ctx, &sql, &args)? {
                let volume = Volume::new(row.get_i64(2)?, row.get_i64(3)?);
                accounts
                    .entry(row.get_string(0)?)
                    .or_default()
                    .insert(row.get_string(1)?, volume.balance());
            }

            let next = if has_more {
                Some(encode_token(&BalancesQuery {
                    offset: next_offset(q.offset, page_size)?,
                    page_size,
                    ..q.clone()
                })?)
            } else {
                None
            };
            let previous = if q.offset > 0 {
                Some(encode_token(&BalancesQuery {
                    offset: q.offset.saturating_sub(page_size),
                    page_size,
                    ..q.clone()
                })?)
            } else {
                None
            };

            Ok(Cursor {
                page_size: accounts.len(),
                has_more,
                previous,
                next,
                data: vec![AggregatedBalances { aggregated, accounts }],
            })
        })
    }
}
