//! Runs against a live server when `LEDGERSTORE_POSTGRES_URL` is set, e.g.
//! `host=localhost user=postgres password=postgres dbname=ledger`.

use std::{sync::Arc, time::Duration};

use ledgerstore::{Driver, DriverRegistry, Migrations, SharedDriver};
use ledgerstore_core::{
    metadata::compute_metadata, BalancesQuery, Connection, Connector, Context, Flavor, Posting, StorageError, Transaction,
    TransactionsQuery, Volume,
};
use ledgerstore_postgres::PostgresConnector;
use time::OffsetDateTime;

fn url() -> Option<String> {
    std::env::var("LEDGERSTORE_POSTGRES_URL").ok()
}

fn ledger_name() -> String {
    format!("ledger_test_{}", OffsetDateTime::now_utc().unix_timestamp_nanos())
}

fn drop_schema(url: &str, ledger: &str) {
    let ctx = Context::with_timeout(Duration::from_secs(30));
    let mut conn = PostgresConnector.open(&ctx, url).unwrap();
    conn.execute_batch(&ctx, &format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", ledger))
        .unwrap();
    conn.close().unwrap();
}

#[test]
fn test_postgres_store_round_trip() {
    let Some(url) = url() else {
        return;
    };
    let ctx = Context::with_timeout(Duration::from_secs(30));
    let ledger = ledger_name();
    let driver = SharedDriver::new(
        "postgres-shared",
        Flavor::PostgreSql,
        &url,
        Arc::new(DriverRegistry::with_defaults()),
        Arc::new(Migrations::embedded()),
    );
    driver.initialize(&ctx).unwrap();
    let store = driver.new_store(&ctx, &ledger).unwrap();
    store.initialize(&ctx).unwrap();
    // the schema scripts are repeatable
    store.initialize(&ctx).unwrap();

    let mut first = Transaction::new(
        0,
        OffsetDateTime::now_utc(),
        vec![Posting::new("world", "acc:1", 100, "USD")],
    );
    first.metadata = compute_metadata("category", "salary");
    let second = Transaction::new(
        1,
        OffsetDateTime::now_utc(),
        vec![Posting::new("acc:1", "world", 40, "USD")],
    );
    store.insert_transactions(&ctx, &[first, second]).unwrap();

    assert_eq!(store.get_account_volume(&ctx, "acc:1", "USD").unwrap(), Volume::new(100, 40));
    assert_eq!(store.get_account_volume(&ctx, "acc:1", "EUR").unwrap(), Volume::new(0, 0));
    assert_eq!(store.get_account_volumes(&ctx, "acc:1").unwrap().balances()["USD"], 60);

    let tagged = TransactionsQuery {
        metadata: [("category".to_string(), "salary".to_string())].into_iter().collect(),
        ..Default::default()
    };
    assert_eq!(store.count_transactions(&ctx, &tagged).unwrap(), 1);
    assert_eq!(store.get_transactions(&ctx, &TransactionsQuery::default()).unwrap().data.len(), 2);

    let balances = store
        .get_aggregated_balances(&ctx, &BalancesQuery { address: Some("acc:*".into()), ..Default::default() })
        .unwrap();
    assert_eq!(balances.data[0].aggregated["USD"], 60);
    assert_eq!(balances.data[0].accounts["acc:1"]["USD"], 60);

    let err = store
        .insert_transactions(&ctx, &[Transaction::new(0, OffsetDateTime::now_utc(), vec![])])
        .unwrap_err();
    assert!(matches!(err, StorageError::ConstraintViolation(_)), "{:?}", err);

    // the shared connection is out of the failed transaction
    assert_eq!(store.get_account_volume(&ctx, "acc:1", "USD").unwrap(), Volume::new(100, 40));
    let other = driver.new_store(&ctx, &ledger).unwrap();
    assert_eq!(other.count_transactions(&ctx, &TransactionsQuery::default()).unwrap(), 2);
    let unbounded = Context::background();
    assert_eq!(store.get_account_volume(&unbounded, "acc:1", "USD").unwrap(), Volume::new(100, 40));

    store.close(&ctx).unwrap();
    driver.close(&ctx).unwrap();
    drop_schema(&url, &ledger);
}
