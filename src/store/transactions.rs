use ledgerstore_core::{
    cursor::{clamp_page_size, encode_token, Cursor},
    metadata::{reverted_by_key, reverted_key, reverted_metadata, revert_metadata},
    query::{as_count_subquery, as_distinct, narrow, Order, Predicate, QuerySpec},
    value::{decode_json, decode_timestamp, encode_json, encode_timestamp, Row},
    AggregatedVolumes, Connection, Context, Metadata, SqlValue, StorageError, Transaction, TransactionsQuery, TxMode,
};

use super::Store;

const TX_COLUMNS: &[&str] = &[
    "id",
    "timestamp",
    "reference",
    "postings",
    "metadata",
    "pre_commit_volumes",
    "post_commit_volumes",
];

fn decode_transaction(row: &Row) -> Result<Transaction, StorageError> {
    Ok(Transaction {
        id: row.get_i64(0)? as u64,
        timestamp: decode_timestamp(&row.get_string(1)?)?,
        reference: row.get_opt_string(2)?,
        postings: decode_json(row.value(3)?)?.unwrap_or_default(),
        metadata: Metadata::from_stored(row.value(4)?)?,
        pre_commit_volumes: AggregatedVolumes::from_stored(row.value(5)?)?,
        post_commit_volumes: AggregatedVolumes::from_stored(row.value(6)?)?,
    })
}

/// The revert markers of a reverted transaction can not be rewritten.
fn check_revert_state(id: u64, current: &Metadata, incoming: &Metadata) -> Result<(), StorageError> {
    if !current.is_reverted() {
        return Ok(());
    }
    for key in [reverted_key(), reverted_by_key()] {
        if let Some(value) = incoming.get(&key) {
            if current.get(&key) != Some(value) {
                return Err(StorageError::RevertIsFinal(id));
            }
        }
    }
    Ok(())
}

impl Store {
    fn transactions_query(&self, q: &TransactionsQuery) -> Result<QuerySpec, StorageError> {
        let postings = self.table("postings");
        let by_posting = |predicate: Predicate| {
            Predicate::InSubquery(
                "id".to_string(),
                Box::new(QuerySpec::select(postings.clone(), &["txid"]).filter(predicate)),
            )
        };

        let after = q.after_tx_id.map(SqlValue::try_from).transpose()?;
        let mut spec = QuerySpec::select(self.table("transactions"), TX_COLUMNS)
            .filter_opt(after.map(|id| Predicate::Lt("id".to_string(), id)))
            .filter_opt(q.reference.as_deref().map(|r| Predicate::Eq("reference".to_string(), r.into())))
            .filter_opt(q.account.as_deref().map(|a| {
                by_posting(Predicate::Any(vec![
                    Predicate::address("source", a),
                    Predicate::address("destination", a),
                ]))
            }))
            .filter_opt(q.source.as_deref().map(|a| by_posting(Predicate::address("source", a))))
            .filter_opt(q.destination.as_deref().map(|a| by_posting(Predicate::address("destination", a))));

        if let Some(start) = q.start_time {
            spec = spec.filter(Predicate::Ge("timestamp".to_string(), encode_timestamp(start)?.into()));
        }
        if let Some(end) = q.end_time {
            spec = spec.filter(Predicate::Lt("timestamp".to_string(), encode_timestamp(end)?.into()));
        }
        for (key, value) in &q.metadata {
            spec = spec.filter(Predicate::MetadataEq {
                column: "metadata".to_string(),
                key: key.clone(),
                value: value.clone(),
            });
        }
        Ok(spec)
    }

    /// Writes one transaction, its postings and the volume changes it causes.
    ///
    /// Missing pre/post-commit volumes are filled in from the stored volumes.
    fn insert_one(&self, conn: &mut dyn Connection, ctx: &Context, tx: &Transaction) -> Result<Transaction, StorageError> {
        let mut tx = tx.clone();
        if tx.pre_commit_volumes.is_empty() {
            let mut pre = AggregatedVolumes::new();
            for (account, asset) in tx.touched() {
                pre.set_volume(account, asset, self.read_volume(conn, ctx, account, asset)?);
            }
            tx.post_commit_volumes = tx.compute_volumes(&pre);
            tx.pre_commit_volumes = pre;
        }

        let sql = format!(
            "INSERT INTO {} (id, timestamp, reference, postings, metadata, pre_commit_volumes, post_commit_volumes) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.table("transactions")
        );
        conn.execute(
            ctx,
            &self.rebind(&sql),
            &[
                SqlValue::try_from(tx.id)?,
                encode_timestamp(tx.timestamp)?.into(),
                tx.reference.clone().into(),
                encode_json(&tx.postings)?,
                tx.metadata.to_stored()?,
                tx.pre_commit_volumes.to_stored()?,
                tx.post_commit_volumes.to_stored()?,
            ],
        )?;

        let posting_sql = self.rebind(&format!(
            "INSERT INTO {} (txid, posting_index, source, destination, amount, asset) VALUES (?, ?, ?, ?, ?, ?)",
            self.table("postings")
        ));
        let volume_sql = self.rebind(&format!(
            "INSERT INTO {} AS v (account, asset, input, output) VALUES (?, ?, ?, ?) \
             ON CONFLICT (account, asset) DO UPDATE SET input = v.input + excluded.input, output = v.output + excluded.output",
            self.table("volumes")
        ));
        for (index, posting) in tx.postings.iter().enumerate() {
            conn.execute(
                ctx,
                &posting_sql,
                &[
                    SqlValue::try_from(tx.id)?,
                    (index as i64).into(),
                    posting.source.as_str().into(),
                    posting.destination.as_str().into(),
                    posting.amount.into(),
                    posting.asset.as_str().into(),
                ],
            )?;
            self.ensure_account(conn, ctx, &posting.source)?;
            self.ensure_account(conn, ctx, &posting.destination)?;
            conn.execute(
                ctx,
                &volume_sql,
                &[posting.source.as_str().into(), posting.asset.as_str().into(), 0i64.into(), posting.amount.into()],
            )?;
            conn.execute(
                ctx,
                &volume_sql,
                &[posting.destination.as_str().into(), posting.asset.as_str().into(), posting.amount.into(), 0i64.into()],
            )?;
        }
        Ok(tx)
    }

    /// Persists a batch of transactions atomically and returns them with
    /// their pre/post-commit volumes.
    #[tracing::instrument(skip(self, ctx, txs), fields(ledger = %self.ledger, count = txs.len()), err)]
    pub fn insert_transactions(&self, ctx: &Context, txs: &[Transaction]) -> Result<Vec<Transaction>, StorageError> {
        self.in_tx(ctx, TxMode::ReadWrite, |conn| {
            txs.iter().map(|tx| self.insert_one(conn, ctx, tx)).collect()
        })
    }

    fn load_transaction_metadata(&self, conn: &mut dyn Connection, ctx: &Context, id: u64) -> Result<Metadata, StorageError> {
        let (sql, args) = QuerySpec::select(self.table("transactions"), &["metadata"])
            .filter(Predicate::Eq("id".to_string(), SqlValue::try_from(id)?))
            .build(self.flavor);
        match conn.query_opt(ctx, &sql, &args)? {
            Some(row) => Ok(Metadata::from_stored(row.value(0)?)?),
            None => Err(StorageError::NotFound(format!("transaction {}", id))),
        }
    }

    fn store_transaction_metadata(
        &self,
        conn: &mut dyn Connection,
        ctx: &Context,
        id: u64,
        metadata: &Metadata,
    ) -> Result<(), StorageError> {
        let sql = format!("UPDATE {} SET metadata = ? WHERE id = ?", self.table("transactions"));
        conn.execute(ctx, &self.rebind(&sql), &[metadata.to_stored()?, SqlValue::try_from(id)?])?;
        Ok(())
    }

    /// Merges `metadata` into the stored metadata of transaction `id`, new keys winning.
    #[tracing::instrument(skip(self, ctx, metadata), fields(ledger = %self.ledger), err)]
    pub fn save_transaction_metadata(&self, ctx: &Context, id: u64, metadata: Metadata) -> Result<(), StorageError> {
        self.in_tx(ctx, TxMode::ReadWrite, |conn| {
            let mut current = self.load_transaction_metadata(conn, ctx, id)?;
            check_revert_state(id, &current, &metadata)?;
            current.merge(metadata);
            self.store_transaction_metadata(conn, ctx, id, &current)
        })
    }

    /// Flags transaction `id` as reverted by transaction `by`.
    #[tracing::instrument(skip(self, ctx), fields(ledger = %self.ledger), err)]
    pub fn mark_reverted(&self, ctx: &Context, id: u64, by: u64) -> Result<(), StorageError> {
        self.in_tx(ctx, TxMode::ReadWrite, |conn| self.mark_reverted_in(conn, ctx, id, by))
    }

    fn mark_reverted_in(&self, conn: &mut dyn Connection, ctx: &Context, id: u64, by: u64) -> Result<(), StorageError> {
        let mut current = self.load_transaction_metadata(conn, ctx, id)?;
        if current.is_reverted() {
            return Err(StorageError::RevertIsFinal(id));
        }
        current.merge(reverted_metadata(by));
        self.store_transaction_metadata(conn, ctx, id, &current)
    }

    /// Writes `revert` with a reference to transaction `id` and flags `id` as
    /// reverted, in one database transaction.
    ///
    /// Returns the reverted transaction and the stored revert transaction.
    #[tracing::instrument(skip(self, ctx, revert), fields(ledger = %self.ledger, revert_id = revert.id), err)]
    pub fn revert_transaction(
        &self,
        ctx: &Context,
        id: u64,
        revert: &Transaction,
    ) -> Result<(Transaction, Transaction), StorageError> {
        self.in_tx(ctx, TxMode::ReadWrite, |conn| {
            let mut revert = revert.clone();
            revert.metadata.merge(revert_metadata(id));
            let revert = self.insert_one(conn, ctx, &revert)?;
            self.mark_reverted_in(conn, ctx, id, revert.id)?;
            let (sql, args) = QuerySpec::select(self.table("transactions"), TX_COLUMNS)
                .filter(Predicate::Eq("id".to_string(), SqlValue::try_from(id)?))
                .build(self.flavor);
            let row = conn
                .query_opt(ctx, &sql, &args)?
                .ok_or_else(|| StorageError::NotFound(format!("transaction {}", id)))?;
            Ok((decode_transaction(&row)?, revert))
        })
    }

    pub fn get_transaction(&self, ctx: &Context, id: u64) -> Result<Option<Transaction>, StorageError> {
        let (sql, args) = QuerySpec::select(self.table("transactions"), TX_COLUMNS)
            .filter(Predicate::Eq("id".to_string(), SqlValue::try_from(id)?))
            .build(self.flavor);
        self.conn()?
            .query_opt(ctx, &sql, &args)?
            .map(|row| decode_transaction(&row))
            .transpose()
    }

    pub fn get_last_transaction(&self, ctx: &Context) -> Result<Option<Transaction>, StorageError> {
        let (sql, args) = QuerySpec::select(self.table("transactions"), TX_COLUMNS)
            .order_by("id", Order::Desc)
            .limit(1)
            .build(self.flavor);
        self.conn()?
            .query_opt(ctx, &sql, &args)?
            .map(|row| decode_transaction(&row))
            .transpose()
    }

    /// Newest first. Pages are keyed on the transaction id, so a page stays
    /// stable while new transactions are written.
    #[tracing::instrument(skip(self, ctx, q), fields(ledger = %self.ledger), err)]
    pub fn get_transactions(&self, ctx: &Context, q: &TransactionsQuery) -> Result<Cursor<Transaction>, StorageError> {
        let page_size = clamp_page_size(q.page_size);
        let spec = self.transactions_query(q)?;
        let unbounded = self.transactions_query(&TransactionsQuery {
            after_tx_id: None,
            ..q.clone()
        })?;

        self.in_tx(ctx, TxMode::ReadSnapshot, |conn| {
            let (sql, args) = spec.order_by("id", Order::Desc).limit(page_size + 1).build(self.flavor);
            let mut data = conn
                .query(ctx, &sql, &args)?
                .iter()
                .map(decode_transaction)
                .collect::<Result<Vec<_>, _>>()?;
            let has_more = data.len() as u64 > page_size;
            data.truncate(page_size as usize);

            let next = match (has_more, data.last()) {
                (true, Some(last)) => Some(encode_token(&TransactionsQuery {
                    after_tx_id: Some(last.id),
                    page_size,
                    ..q.clone()
                })?),
                _ => None,
            };

            let previous = match (q.after_tx_id, data.first()) {
                (Some(_), Some(first)) => {
                    // the page_size transactions just above this page, oldest first
                    let above = Predicate::Gt("id".to_string(), SqlValue::try_from(first.id)?);
                    let (sql, args) = narrow(&as_distinct(&unbounded, &["id"]), above)
                        .order_by("id", Order::Asc)
                        .limit(page_size)
                        .build(self.flavor);
                    let newer = conn.query(ctx, &sql, &args)?;
                    match newer.last() {
                        None => None,
                        Some(_) if (newer.len() as u64) < page_size => Some(encode_token(&TransactionsQuery {
                            after_tx_id: None,
                            page_size,
                            ..q.clone()
                        })?),
                        Some(row) => Some(encode_token(&TransactionsQuery {
                            after_tx_id: Some(row.get_i64(0)? as u64 + 1),
                            page_size,
                            ..q.clone()
                        })?),
                    }
                }
                _ => None,
            };

            Ok(Cursor {
                page_size: page_size as usize,
                has_more,
                previous,
                next,
                data,
            })
        })
    }

    /// Number of transactions matching `q`; paging is ignored.
    #[tracing::instrument(skip(self, ctx, q), fields(ledger = %self.ledger), err)]
    pub fn count_transactions(&self, ctx: &Context, q: &TransactionsQuery) -> Result<u64, StorageError> {
        let (sql, args) = as_count_subquery(&self.transactions_query(q)?).build(self.flavor);
        let row = self.conn()?.query_opt(ctx, &sql, &args)?;
        Ok(row.map(|r| r.get_i64_or_zero(0)).transpose()?.unwrap_or(0) as u64)
    }
}
