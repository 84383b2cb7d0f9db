//! PostgreSQL backend for ledgerstore.
//!
//! Built on the synchronous `postgres` client. A caller's deadline is pushed
//! to the server as `statement_timeout`; rows are streamed through a portal
//! and the context is checked between rows, so dropping out early closes the
//! server-side cursor.

use std::error::Error;

use bytes::BytesMut;
use ledgerstore_core::{
    storage::{Connection, Connector, StorageError, TxMode},
    Context, Flavor, Row, SqlValue,
};
use postgres::{
    fallible_iterator::FallibleIterator,
    types::{IsNull, ToSql, Type},
    Client, NoTls,
};

pub const BACKEND_NAME: &str = "postgres";

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

impl Connector for PostgresConnector {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn flavor(&self) -> Flavor {
        Flavor::PostgreSql
    }

    fn open(&self, ctx: &Context, conn_string: &str) -> Result<Box<dyn Connection>, StorageError> {
        Ok(Box::new(PostgresConnection::connect(ctx, conn_string)?))
    }
}

pub struct PostgresConnection {
    client: Option<Client>,
    /// `statement_timeout` currently set on the session, in milliseconds.
    statement_timeout: Option<u64>,
}

impl PostgresConnection {
    pub fn connect(ctx: &Context, conn_string: &str) -> Result<Self, StorageError> {
        ctx.check()?;
        let mut config: postgres::Config = conn_string
            .parse()
            .map_err(|e: postgres::Error| StorageError::Connectivity(format!("invalid connection string: {}", e)))?;
        if let Some(remaining) = ctx.remaining() {
            config.connect_timeout(remaining);
        }
        let client = config
            .connect(NoTls)
            .map_err(|e| StorageError::Connectivity(format!("PostgreSQL connection failed: {}", e)))?;

        tracing::debug!("PostgreSQL connection opened");
        Ok(Self {
            client: Some(client),
            statement_timeout: None,
        })
    }

    /// Returns the client after syncing the session timeout with the context's deadline.
    fn prepare(&mut self, ctx: &Context) -> Result<&mut Client, StorageError> {
        ctx.check()?;
        let client = self.client.as_mut().ok_or(StorageError::Closed)?;
        let wanted = ctx.remaining().map(|d| (d.as_millis() as u64).max(1));
        if wanted != self.statement_timeout {
            client
                .batch_execute(&format!("SET statement_timeout = {}", wanted.unwrap_or(0)))
                .map_err(|e| map_error(ctx, e))?;
            self.statement_timeout = wanted;
        }
        Ok(client)
    }
}

#[derive(Debug)]
struct PgParam<'a>(&'a SqlValue);

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self.0 {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Integer(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    i.to_string().to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            SqlValue::Real(r) => {
                if *ty == Type::FLOAT4 {
                    (*r as f32).to_sql(ty, out)
                } else {
                    r.to_sql(ty, out)
                }
            }
            SqlValue::Text(s) => s.as_str().to_sql(ty, out),
            SqlValue::Blob(b) => b.as_slice().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn to_sql_checked(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

fn from_postgres(row: &postgres::Row, index: usize) -> Result<SqlValue, StorageError> {
    let ty = row.columns()[index].type_();
    let decode = |e: postgres::Error| StorageError::Backend(e.to_string());

    let value = if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(index).map_err(decode)?.map(SqlValue::Integer)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(index).map_err(decode)?.map(|v| SqlValue::Integer(v as i64))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(index).map_err(decode)?.map(|v| SqlValue::Integer(v as i64))
    } else if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(index).map_err(decode)?.map(|v| SqlValue::Integer(v as i64))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(index).map_err(decode)?.map(SqlValue::Real)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(index).map_err(decode)?.map(|v| SqlValue::Real(v as f64))
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(index).map_err(decode)?.map(SqlValue::Blob)
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
        row.try_get::<_, Option<String>>(index).map_err(decode)?.map(SqlValue::Text)
    } else {
        return Err(StorageError::Backend(format!("unsupported column type: {}", ty)));
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Maps an SQLSTATE code onto the flavor-independent error kinds.
fn map_sqlstate(ctx: &Context, code: &str, message: String) -> StorageError {
    match code {
        "57014" => {
            if ctx.is_cancelled() || ctx.deadline().is_none() {
                StorageError::Cancelled
            } else {
                StorageError::DeadlineExceeded
            }
        }
        c if c.starts_with("23") => StorageError::ConstraintViolation(message),
        c if c.starts_with("08") || c.starts_with("57P") => StorageError::Connectivity(message),
        _ => StorageError::Backend(message),
    }
}

fn map_error(ctx: &Context, e: postgres::Error) -> StorageError {
    if e.is_closed() {
        return StorageError::Connectivity(e.to_string());
    }
    match e.code() {
        Some(state) => {
            let message = e
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| e.to_string());
            map_sqlstate(ctx, state.code(), message)
        }
        None => StorageError::Backend(e.to_string()),
    }
}

impl Connection for PostgresConnection {
    fn flavor(&self) -> Flavor {
        Flavor::PostgreSql
    }

    fn execute(&mut self, ctx: &Context, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError> {
        let client = self.prepare(ctx)?;
        let params: Vec<PgParam> = params.iter().map(PgParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        client.execute(sql, &refs).map_err(|e| map_error(ctx, e))
    }

    fn execute_batch(&mut self, ctx: &Context, sql: &str) -> Result<(), StorageError> {
        let client = self.prepare(ctx)?;
        client.batch_execute(sql).map_err(|e| map_error(ctx, e))
    }

    fn query(&mut self, ctx: &Context, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        let client = self.prepare(ctx)?;
        let params: Vec<PgParam> = params.iter().map(PgParam).collect();
        let mut rows = client
            .query_raw(sql, params.iter().map(|p| p as &dyn ToSql))
            .map_err(|e| map_error(ctx, e))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| map_error(ctx, e))? {
            ctx.check()?;
            let mut values = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                values.push(from_postgres(&row, i)?);
            }
            out.push(Row(values));
        }
        Ok(out)
    }

    fn begin(&mut self, ctx: &Context, mode: TxMode) -> Result<(), StorageError> {
        let sql = match mode {
            TxMode::ReadWrite => "BEGIN",
            TxMode::ReadSnapshot => "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY",
        };
        self.execute_batch(ctx, sql)?;
        tracing::debug!(?mode, "PostgreSQL transaction started");
        Ok(())
    }

    fn commit(&mut self, ctx: &Context) -> Result<(), StorageError> {
        self.execute_batch(ctx, "COMMIT")?;
        tracing::debug!("PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        // no timeout sync: an aborted transaction rejects everything but ROLLBACK
        let ctx = Context::background();
        let client = self.client.as_mut().ok_or(StorageError::Closed)?;
        client.batch_execute("ROLLBACK").map_err(|e| map_error(&ctx, e))?;
        // a SET issued inside the transaction was undone with it
        client
            .batch_execute("SET statement_timeout = 0")
            .map_err(|e| map_error(&ctx, e))?;
        self.statement_timeout = None;
        tracing::debug!("PostgreSQL transaction rolled back");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        match self.client.take() {
            Some(client) => client.close().map_err(|e| StorageError::Connectivity(e.to_string())),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.client.as_ref().map(|c| c.is_closed()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        let ctx = Context::background();
        assert!(matches!(map_sqlstate(&ctx, "23505", "dup".into()), StorageError::ConstraintViolation(m) if m == "dup"));
        assert!(matches!(map_sqlstate(&ctx, "08006", "gone".into()), StorageError::Connectivity(_)));
        assert!(matches!(map_sqlstate(&ctx, "42P01", "missing".into()), StorageError::Backend(_)));
        assert!(matches!(map_sqlstate(&ctx, "57014", "stop".into()), StorageError::Cancelled));

        let timed = Context::with_timeout(Duration::from_secs(60));
        assert!(matches!(map_sqlstate(&timed, "57014", "stop".into()), StorageError::DeadlineExceeded));
    }

    #[test]
    fn test_param_encoding_follows_column_type() {
        let mut buf = BytesMut::new();
        PgParam(&SqlValue::Integer(5)).to_sql(&Type::INT4, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);

        let mut buf = BytesMut::new();
        PgParam(&SqlValue::Integer(5)).to_sql(&Type::INT8, &mut buf).unwrap();
        assert_eq!(buf.len(), 8);

        let mut buf = BytesMut::new();
        let null = PgParam(&SqlValue::Null).to_sql(&Type::TEXT, &mut buf).unwrap();
        assert!(matches!(null, IsNull::Yes));
    }

    #[test]
    fn test_out_of_range_integer_is_an_error() {
        let mut buf = BytesMut::new();
        assert!(PgParam(&SqlValue::Integer(i64::MAX)).to_sql(&Type::INT4, &mut buf).is_err());
    }

    #[test]
    fn test_connect_rejects_bad_conn_string() {
        let err = PostgresConnection::connect(&Context::background(), "host=localhost port=notaport").err().unwrap();
        assert!(matches!(err, StorageError::Connectivity(_)));
    }

    #[test]
    fn test_live_round_trip() {
        let url = match std::env::var("LEDGERSTORE_POSTGRES_URL") {
            Ok(url) => url,
            Err(_) => return,
        };
        let ctx = Context::with_timeout(Duration::from_secs(30));
        let mut conn = PostgresConnector.open(&ctx, &url).unwrap();
        let rows = conn
            .query(&ctx, "SELECT $1::BIGINT, $2::TEXT, NULL::TEXT", &[7i64.into(), "x".into()])
            .unwrap();
        assert_eq!(rows[0], Row(vec![SqlValue::Integer(7), SqlValue::Text("x".into()), SqlValue::Null]));
        conn.close().unwrap();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_live_rollback_after_failed_statement() {
        let url = match std::env::var("LEDGERSTORE_POSTGRES_URL") {
            Ok(url) => url,
            Err(_) => return,
        };
        let ctx = Context::with_timeout(Duration::from_secs(30));
        let mut conn = PostgresConnector.open(&ctx, &url).unwrap();
        conn.begin(&ctx, TxMode::ReadWrite).unwrap();
        assert!(conn.execute_batch(&ctx, "SELECT 1/0").is_err());
        conn.rollback().unwrap();

        let rows = conn.query(&ctx, "SELECT 1::BIGINT", &[]).unwrap();
        assert_eq!(rows[0], Row(vec![SqlValue::Integer(1)]));
        let rows = conn.query(&Context::background(), "SHOW statement_timeout", &[]).unwrap();
        assert_eq!(rows[0], Row(vec![SqlValue::Text("0".into())]));
        conn.close().unwrap();
    }

    #[test]
    fn test_live_statement_timeout_keeps_connection_usable() {
        let url = match std::env::var("LEDGERSTORE_POSTGRES_URL") {
            Ok(url) => url,
            Err(_) => return,
        };
        let mut conn = PostgresConnector.open(&Context::background(), &url).unwrap();
        let short = Context::with_timeout(Duration::from_millis(200));
        conn.begin(&short, TxMode::ReadSnapshot).unwrap();
        let err = conn.query(&short, "SELECT pg_sleep(5)::TEXT", &[]).unwrap_err();
        assert!(matches!(err, StorageError::DeadlineExceeded), "{:?}", err);
        conn.rollback().unwrap();

        let rows = conn.query(&Context::background(), "SELECT 2::BIGINT", &[]).unwrap();
        assert_eq!(rows[0], Row(vec![SqlValue::Integer(2)]));
        conn.close().unwrap();
    }
}
