use ledgerstore_core::{
    cursor::{check_offset, clamp_page_size, encode_token, next_offset, Cursor},
    query::{as_count, Order, Predicate, QuerySpec},
    Account, AccountsQuery, Connection, Context, Metadata, StorageError, TxMode,
};

use super::Store;

const ACCOUNT_COLUMNS: &[&str] = &["address", "metadata"];

impl Store {
    fn accounts_query(&self, q: &AccountsQuery) -> QuerySpec {
        let mut spec = QuerySpec::select(self.table("accounts"), ACCOUNT_COLUMNS)
            .filter_opt(q.address.as_deref().map(|a| Predicate::address("address", a)));
        for (key, value) in &q.metadata {
            spec = spec.filter(Predicate::MetadataEq {
                column: "metadata".to_string(),
                key: key.clone(),
                value: value.clone(),
            });
        }
        spec
    }

    pub(super) fn ensure_account(&self, conn: &mut dyn Connection, ctx: &Context, address: &str) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {} (address, metadata) VALUES (?, ?) ON CONFLICT (address) DO NOTHING",
            self.table("accounts")
        );
        conn.execute(ctx, &self.rebind(&sql), &[address.into(), "{}".into()])?;
        Ok(())
    }

    /// The account with its metadata and volumes. An address that never saw
    /// any activity yields an empty account.
    #[tracing::instrument(skip(self, ctx), fields(ledger = %self.ledger), err)]
    pub fn get_account(&self, ctx: &Context, address: &str) -> Result<Account, StorageError> {
        let (sql, args) = QuerySpec::select(self.table("accounts"), ACCOUNT_COLUMNS)
            .filter(Predicate::Eq("address".to_string(), address.into()))
            .build(self.flavor);
        self.in_tx(ctx, TxMode::ReadSnapshot, |conn| {
            let metadata = match conn.query_opt(ctx, &sql, &args)? {
                Some(row) => Metadata::from_stored(row.value(1)?)?,
                None => Metadata::new(),
            };
            let volumes = self.read_account_volumes(conn, ctx, address)?;
            let mut account = Account::new(address).with_volumes(volumes);
            account.metadata = metadata;
            Ok(account)
        })
    }

    /// Accounts in address order, without volumes.
    #[tracing::instrument(skip(self, ctx, q), fields(ledger = %self.ledger), err)]
    pub fn get_accounts(&self, ctx: &Context, q: &AccountsQuery) -> Result<Cursor<Account>, StorageError> {
        let page_size = clamp_page_size(q.page_size);
        let (sql, args) = self
            .accounts_query(q)
            .order_by("address", Order::Asc)
            .limit(page_size + 1)
            .offset(check_offset(q.offset)?)
            .build(self.flavor);

        let rows = self.conn()?.query(ctx, &sql, &args)?;
        let mut data = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut account = Account::new(&row.get_string(0)?);
            account.metadata = Metadata::from_stored(row.value(1)?)?;
            data.push(account);
        }
        let has_more = data.len() as u64 > page_size;
        data.truncate(page_size as usize);

        let next = if has_more {
            Some(encode_token(&AccountsQuery {
                offset: next_offset(q.offset, page_size)?,
                page_size,
                ..q.clone()
            })?)
        } else {
            None
        };
        let previous = if q.offset > 0 {
            Some(encode_token(&AccountsQuery {
                offset: q.offset.saturating_sub(page_size),
                page_size,
                ..q.clone()
            })?)
        } else {
            None
        };

        Ok(Cursor {
            page_size: page_size as usize,
            has_more,
            previous,
            next,
            data,
        })
    }

    /// Number of accounts matching `q`; paging is ignored.
    #[tracing::instrument(skip(self, ctx, q), fields(ledger = %self.ledger), err)]
    pub fn count_accounts(&self, ctx: &Context, q: &AccountsQuery) -> Result<u64, StorageError> {
        let (sql, args) = as_count(&self.accounts_query(q)).build(self.flavor);
        let row = self.conn()?.query_opt(ctx, &sql, &args)?;
        Ok(row.map(|r| r.get_i64_or_zero(0)).transpose()?.unwrap_or(0) as u64)
    }

    /// Merges `metadata` into the account's metadata, creating the account if needed.
    #[tracing::instrument(skip(self, ctx, metadata), fields(ledger = %self.ledger), err)]
    pub fn save_account_metadata(&self, ctx: &Context, address: &str, metadata: Metadata) -> Result<(), StorageError> {
        let (select, args) = QuerySpec::select(self.table("accounts"), &["metadata"])
            .filter(Predicate::Eq("address".to_string(), address.into()))
            .build(self.flavor);
        let update = self.rebind(&format!("UPDATE {} SET metadata = ? WHERE address = ?", self.table("accounts")));

        self.in_tx(ctx, TxMode::ReadWrite, |conn| {
            self.ensure_account(conn, ctx, address)?;
            let mut current = match conn.query_opt(ctx, &select, &args)? {
                Some(row) => Metadata::from_stored(row.value(0)?)?,
                None => Metadata::new(),
            };
            current.merge(metadata);
            conn.execute(ctx, &update, &[current.to_stored()?, address.into()])?;
            Ok(())
        })
    }
}
