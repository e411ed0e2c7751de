//! Physical connections and the process-wide, per-URI pools above them.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use postgres::types::ToSql;
use url::Url;

use crate::backend::Flavor;
use crate::context::Config;
use crate::value::Value;
use crate::{Error, Result};

/// One live backend connection.
pub(crate) enum Connection {
    Sqlite(rusqlite::Connection),
    Pg(postgres::Client),
}

impl Connection {
    pub(crate) fn batch(&mut self, sql: &str) -> Result<()> {
        match self {
            Connection::Sqlite(conn) => conn.execute_batch(sql)?,
            Connection::Pg(client) => client.batch_execute(sql)?,
        }
        Ok(())
    }

    pub(crate) fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        match self {
            Connection::Sqlite(conn) => {
                Ok(conn.execute(sql, rusqlite::params_from_iter(params.iter()))?)
            }
            Connection::Pg(client) => {
                let refs: Vec<&(dyn ToSql + Sync)> =
                    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
                Ok(client.execute(sql, &refs)? as usize)
            }
        }
    }

    pub(crate) fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        match self {
            Connection::Sqlite(conn) => {
                let mut stmt = conn.prepare(sql)?;
                let nb_cols = stmt.column_count();
                let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut values = Vec::with_capacity(nb_cols);
                    for i in 0..nb_cols {
                        values.push(sqlite_value(row.get_ref(i)?));
                    }
                    out.push(values);
                }
                Ok(out)
            }
            Connection::Pg(client) => {
                let refs: Vec<&(dyn ToSql + Sync)> =
                    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
                let rows = client.query(sql, &refs)?;
                rows.iter().map(pg_row_values).collect()
            }
        }
    }

    pub(crate) fn executemany(
        &mut self,
        sql: &str,
        rows: impl Iterator<Item = Vec<Value>>,
    ) -> Result<()> {
        match self {
            Connection::Sqlite(conn) => {
                let mut stmt = conn.prepare(sql)?;
                for row in rows {
                    stmt.execute(rusqlite::params_from_iter(row.iter()))?;
                }
                Ok(())
            }
            Connection::Pg(client) => {
                let stmt = client.prepare(sql)?;
                for row in rows {
                    let refs: Vec<&(dyn ToSql + Sync)> =
                        row.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
                    client.execute(&stmt, &refs)?;
                }
                Ok(())
            }
        }
    }

    /// Bulk-load rows through the copy channel (client-server backend
    /// only).
    pub(crate) fn copy_load(
        &mut self,
        table: &str,
        columns: &[String],
        rows: impl Iterator<Item = Vec<Value>>,
    ) -> Result<()> {
        match self {
            Connection::Sqlite(_) => Err(Error::usage("copy channel is not available")),
            Connection::Pg(client) => {
                let sql = format!(
                    "COPY {} ({}) FROM STDIN",
                    crate::quote_ident(table),
                    columns.join(", ")
                );
                let mut writer = client.copy_in(&sql)?;
                for row in rows {
                    let cells: Vec<String> = row
                        .iter()
                        .map(|v| v.copy_text().unwrap_or_else(|| "\\N".to_string()))
                        .collect();
                    writer.write_all(cells.join("\t").as_bytes())?;
                    writer.write_all(b"\n")?;
                }
                writer.finish()?;
                Ok(())
            }
        }
    }
}

fn sqlite_value(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Str(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn pg_row_values(row: &postgres::Row) -> Result<Vec<Value>> {
    use postgres::types::Type;
    let mut values = Vec::with_capacity(row.len());
    for (i, col) in row.columns().iter().enumerate() {
        let ty = col.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(i)?.map(Value::Bool)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(i)?.map(|v| Value::Int(v as i64))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(i)?.map(|v| Value::Int(v as i64))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(i)?.map(Value::Int)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(i)?.map(|v| Value::Float(v as f64))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(i)?.map(Value::Float)
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(i)?.map(Value::Bytes)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<chrono::NaiveDateTime>>(i)?
                .map(Value::Timestamp)
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)?
                .map(Value::Timestamptz)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<chrono::NaiveDate>>(i)?.map(Value::Date)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<serde_json::Value>>(i)?.map(Value::Json)
        } else if *ty == Type::BOOL_ARRAY {
            row.try_get::<_, Option<Vec<bool>>>(i)?
                .map(|v| Value::Array(v.into_iter().map(Value::Bool).collect()))
        } else if *ty == Type::INT4_ARRAY {
            row.try_get::<_, Option<Vec<i32>>>(i)?
                .map(|v| Value::Array(v.into_iter().map(|x| Value::Int(x as i64)).collect()))
        } else if *ty == Type::INT8_ARRAY {
            row.try_get::<_, Option<Vec<i64>>>(i)?
                .map(|v| Value::Array(v.into_iter().map(Value::Int).collect()))
        } else if *ty == Type::FLOAT8_ARRAY {
            row.try_get::<_, Option<Vec<f64>>>(i)?
                .map(|v| Value::Array(v.into_iter().map(Value::Float).collect()))
        } else if *ty == Type::TEXT_ARRAY || *ty == Type::VARCHAR_ARRAY {
            row.try_get::<_, Option<Vec<String>>>(i)?
                .map(|v| Value::Array(v.into_iter().map(Value::Str).collect()))
        } else {
            row.try_get::<_, Option<String>>(i).unwrap_or(None).map(Value::Str)
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(values)
}

struct PgState {
    idle: Vec<postgres::Client>,
    total: usize,
}

enum PoolKind {
    Sqlite {
        path: String,
    },
    /// Bounded pool of client-server connections.
    PgPool {
        config: postgres::Config,
        state: Mutex<PgState>,
        cond: Condvar,
        max: usize,
    },
    /// One fresh connection per context (distributed dialect).
    PgDirect {
        config: postgres::Config,
    },
}

/// Connection source for one database URI, shared process-wide.
pub struct Pool {
    pub flavor: Flavor,
    pub pg_schema: Option<String>,
    kind: PoolKind,
}

static POOLS: OnceLock<Mutex<HashMap<String, Arc<Pool>>>> = OnceLock::new();

fn pools() -> &'static Mutex<HashMap<String, Arc<Pool>>> {
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Pool {
    /// Get (or create) the pool for the configuration's URI.
    pub fn get(cfg: &Config) -> Result<Arc<Pool>> {
        let uri = cfg.effective_db_uri();
        let mut pools = pools().lock().expect("pool registry poisoned");
        if let Some(pool) = pools.get(&uri) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(Pool::new(&uri, cfg)?);
        pools.insert(uri, pool.clone());
        Ok(pool)
    }

    /// Drop every cached pool; mostly for tests and process teardown.
    pub fn clear() {
        pools().lock().expect("pool registry poisoned").clear();
    }

    fn new(db_uri: &str, cfg: &Config) -> Result<Pool> {
        let url = Url::parse(db_uri)
            .map_err(|e| Error::usage(format!("Invalid db uri \"{db_uri}\": {e}")))?;
        let flavor = Flavor::from_scheme(url.scheme(), db_uri)?;
        match flavor {
            Flavor::Sqlite => {
                // Exactly one leading slash belongs to the URI; the rest
                // is the (possibly absolute) file path.
                let path = url.path();
                let path = path.strip_prefix('/').unwrap_or(path);
                let path = if path.is_empty() { ":memory:" } else { path };
                Ok(Pool {
                    flavor,
                    pg_schema: None,
                    kind: PoolKind::Sqlite {
                        path: path.to_string(),
                    },
                })
            }
            Flavor::Postgresql | Flavor::Crdb => {
                let mut config = postgres::Config::new();
                let dbname = url.path().trim_start_matches('/');
                config.dbname(dbname);
                config.host(url.host_str().unwrap_or("localhost"));
                if let Some(port) = url.port() {
                    config.port(port);
                }
                if !url.username().is_empty() {
                    config.user(url.username());
                }
                if let Some(password) = url.password() {
                    config.password(password);
                }
                let pg_schema = url.fragment().map(str::to_string);
                let kind = if flavor == Flavor::Postgresql {
                    let state = Mutex::new(PgState {
                        idle: Vec::new(),
                        total: 0,
                    });
                    let pool = PoolKind::PgPool {
                        config,
                        state,
                        cond: Condvar::new(),
                        max: cfg.pg_max_pool_size.max(1),
                    };
                    // Establish the lower bound up front.
                    if let PoolKind::PgPool { config, state, .. } = &pool {
                        let mut state = state.lock().expect("pool state poisoned");
                        for _ in 0..cfg.pg_min_pool_size.min(cfg.pg_max_pool_size.max(1)) {
                            state.idle.push(config.connect(postgres::NoTls)?);
                            state.total += 1;
                        }
                    }
                    pool
                } else {
                    PoolKind::PgDirect { config }
                };
                Ok(Pool {
                    flavor,
                    pg_schema,
                    kind,
                })
            }
        }
    }

    /// Acquire a connection for one context.
    pub(crate) fn enter(&self) -> Result<Connection> {
        match &self.kind {
            PoolKind::Sqlite { path } => {
                let conn = rusqlite::Connection::open(path)?;
                conn.execute_batch("PRAGMA foreign_keys=ON")?;
                // journal_mode reports the resulting mode as a row.
                let _mode: String =
                    conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
                Ok(Connection::Sqlite(conn))
            }
            PoolKind::PgDirect { config } => {
                Ok(Connection::Pg(config.connect(postgres::NoTls)?))
            }
            PoolKind::PgPool {
                config,
                state,
                cond,
                max,
            } => {
                let mut state = state.lock().expect("pool state poisoned");
                loop {
                    if let Some(client) = state.idle.pop() {
                        drop(state);
                        let mut client = client;
                        self.set_search_path(&mut client)?;
                        return Ok(Connection::Pg(client));
                    }
                    if state.total < *max {
                        state.total += 1;
                        drop(state);
                        let mut client = match config.connect(postgres::NoTls) {
                            Ok(client) => client,
                            Err(e) => {
                                self.give_up_slot();
                                return Err(e.into());
                            }
                        };
                        self.set_search_path(&mut client)?;
                        return Ok(Connection::Pg(client));
                    }
                    state = cond.wait(state).expect("pool state poisoned");
                }
            }
        }
    }

    fn set_search_path(&self, client: &mut postgres::Client) -> Result<()> {
        if let Some(schema) = &self.pg_schema {
            client.batch_execute(&format!("SET search_path TO {schema}"))?;
        }
        Ok(())
    }

    fn give_up_slot(&self) {
        if let PoolKind::PgPool { state, cond, .. } = &self.kind {
            let mut state = state.lock().expect("pool state poisoned");
            state.total = state.total.saturating_sub(1);
            cond.notify_one();
        }
    }

    /// Commit or roll back, then return the connection to the pool.
    pub(crate) fn leave(&self, mut conn: Connection, err: bool) -> Result<()> {
        let end = if err {
            tracing::debug!("ROLLBACK");
            "ROLLBACK"
        } else {
            tracing::debug!("COMMIT");
            "COMMIT"
        };
        let end_result = conn.batch(end);
        match (&self.kind, conn) {
            (PoolKind::PgPool { state, cond, .. }, Connection::Pg(client)) => {
                if end_result.is_ok() {
                    let mut state = state.lock().expect("pool state poisoned");
                    state.idle.push(client);
                    drop(state);
                    cond.notify_one();
                } else {
                    self.give_up_slot();
                }
            }
            _ => {}
        }
        end_result
    }
}
