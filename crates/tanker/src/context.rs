//! Contexts: per-scope database handles with a thread-local stack.
//!
//! A context owns one pooled connection and one transaction. Contexts are
//! strictly nested per thread: `connect` scopes one, `enter`/`leave` are
//! the explicit variant for scripts. The registry built for a URI is
//! cached for the process lifetime.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use indexmap::IndexMap;

use crate::backend::Flavor;
use crate::cache::{FkKey, FkMap};
use crate::expr::Args;
use crate::introspect;
use crate::pool::{Connection, Pool};
use crate::schema::{ColType, Registry, Table, TableDef};
use crate::value::Value;
use crate::view::{Fields, View};
use crate::write::{WriteData, WriteOptions};
use crate::{Error, Result, quote_ident};

pub const DEFAULT_DB_URI: &str = "sqlite:///:memory:";

/// Connection and behavior settings for one database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection target; in-memory embedded database when empty
    pub db_uri: String,
    /// Pre-parsed schema entries; introspected from the database if absent
    pub schema: Option<Vec<TableDef>>,
    /// Text encoding for bytes coerced into varchar
    pub encoding: String,
    /// Filters implicitly ANDed into every read, per table
    pub acl_read: HashMap<String, Vec<String>>,
    /// Filters enforced on the pre- and post-image of writes, per table
    pub acl_write: HashMap<String, Vec<String>>,
    pub pg_min_pool_size: usize,
    pub pg_max_pool_size: usize,
    /// Free-form values exposed to `{name}` expression parameters
    pub vars: HashMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_uri: DEFAULT_DB_URI.to_string(),
            schema: None,
            encoding: "utf-8".to_string(),
            acl_read: HashMap::new(),
            acl_write: HashMap::new(),
            pg_min_pool_size: 1,
            pg_max_pool_size: 10,
            vars: HashMap::new(),
        }
    }
}

impl Config {
    pub fn new(db_uri: impl Into<String>) -> Config {
        Config {
            db_uri: db_uri.into(),
            ..Config::default()
        }
    }

    pub fn schema(mut self, defs: Vec<TableDef>) -> Self {
        self.schema = Some(defs);
        self
    }

    pub fn acl_read(mut self, table: impl Into<String>, filters: Vec<String>) -> Self {
        self.acl_read.insert(table.into(), filters);
        self
    }

    pub fn acl_write(mut self, table: impl Into<String>, filters: Vec<String>) -> Self {
        self.acl_write.insert(table.into(), filters);
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub(crate) fn effective_db_uri(&self) -> String {
        if self.db_uri.is_empty() {
            DEFAULT_DB_URI.to_string()
        } else {
            self.db_uri.clone()
        }
    }
}

static REGISTRIES: OnceLock<Mutex<HashMap<String, Registry>>> = OnceLock::new();

fn registries() -> &'static Mutex<HashMap<String, Registry>> {
    REGISTRIES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Forget every cached registry; used by tests and long-lived processes
/// that reconfigure their schema.
pub fn clear_registries() {
    registries().lock().expect("registry cache poisoned").clear();
}

/// A per-scope database handle: one connection, one transaction, and the
/// registry for its URI.
pub struct Context {
    cfg: Config,
    pool: Arc<Pool>,
    conn: RefCell<Option<Connection>>,
    flavor: Flavor,
    legacy_pg: bool,
    registry: Registry,
    referenced: HashSet<String>,
    aliases: RefCell<HashMap<String, Value>>,
    fk_cache: RefCell<HashMap<FkKey, FkMap>>,
    pub(crate) db_tables: RefCell<HashSet<String>>,
    pub(crate) db_columns: RefCell<HashMap<String, IndexMap<String, String>>>,
    pub(crate) db_indexes: RefCell<HashSet<String>>,
    pub(crate) db_constraints: RefCell<HashSet<String>>,
}

impl Context {
    /// Acquire a connection and load (or introspect) the registry.
    pub fn open(cfg: Config) -> Result<Context> {
        let pool = Pool::get(&cfg)?;
        let mut conn = pool.enter()?;
        conn.batch("BEGIN")?;

        let flavor = pool.flavor;
        let legacy_pg = if flavor == Flavor::Postgresql {
            match conn.query("SHOW server_version_num", &[]) {
                Ok(rows) => rows
                    .first()
                    .and_then(|r| r.first())
                    .map(|v| match v {
                        Value::Str(s) => s.parse::<i64>().unwrap_or(0) < 90500,
                        Value::Int(i) => *i < 90500,
                        _ => false,
                    })
                    .unwrap_or(false),
                Err(_) => false,
            }
        } else {
            false
        };

        let mut aliases = HashMap::new();
        aliases.insert("null".to_string(), Value::Null);

        let mut ctx = Context {
            pool,
            conn: RefCell::new(Some(conn)),
            flavor,
            legacy_pg,
            registry: Registry::empty(),
            referenced: HashSet::new(),
            aliases: RefCell::new(aliases),
            fk_cache: RefCell::new(HashMap::new()),
            db_tables: RefCell::new(HashSet::new()),
            db_columns: RefCell::new(HashMap::new()),
            db_indexes: RefCell::new(HashSet::new()),
            db_constraints: RefCell::new(HashSet::new()),
            cfg,
        };

        match Self::load_registry(&mut ctx) {
            Ok(()) => Ok(ctx),
            Err(e) => {
                let _ = ctx.close(true);
                Err(e)
            }
        }
    }

    fn load_registry(ctx: &mut Context) -> Result<()> {
        let key = ctx.cfg.effective_db_uri();
        let registry = {
            let mut cache = registries().lock().expect("registry cache poisoned");
            match cache.get(&key) {
                Some(registry) => registry.clone(),
                None => {
                    let registry = match &ctx.cfg.schema {
                        Some(defs) => Registry::from_defs(defs)?,
                        None => {
                            let defs = introspect::introspect_db(ctx, true)?
                                .expect("auto introspection yields a schema");
                            Registry::from_defs(&defs)?
                        }
                    };
                    cache.insert(key, registry.clone());
                    registry
                }
            }
        };
        ctx.referenced = registry.referenced();
        ctx.registry = registry;
        Ok(())
    }

    /// Commit (or roll back) and give the connection back.
    pub(crate) fn close(&self, err: bool) -> Result<()> {
        match self.conn.borrow_mut().take() {
            Some(conn) => self.pool.leave(conn, err),
            None => Ok(()),
        }
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn legacy_pg(&self) -> bool {
        self.legacy_pg
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn pg_schema(&self) -> Option<String> {
        self.pool.pg_schema.clone()
    }

    /// Bind a name usable as `{name}` in expressions.
    pub fn set_alias(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.aliases
            .borrow_mut()
            .insert(name.into(), value.into());
    }

    /// Named values visible to expression parameters: aliases, config
    /// vars, then call arguments.
    pub(crate) fn eval_named(&self, args: &Args) -> HashMap<String, Value> {
        let mut named = self.aliases.borrow().clone();
        named.extend(self.cfg.vars.clone());
        named.extend(args.named_map());
        named
    }

    pub(crate) fn fk_cache_take(&self, key: &FkKey) -> Option<FkMap> {
        self.fk_cache.borrow_mut().remove(key)
    }

    pub(crate) fn fk_cache_put(&self, key: FkKey, map: FkMap) {
        self.fk_cache.borrow_mut().insert(key, map);
    }

    /// Drop cached foreign-key lookups targeting `table`.
    pub(crate) fn invalidate_fk(&self, table: &str) {
        self.fk_cache.borrow_mut().retain(|key, _| key.0 != table);
    }

    fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
        let mut guard = self.conn.borrow_mut();
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::usage("Context is closed"))?;
        f(conn)
    }

    /// Run a statement, returning the affected row count.
    pub fn execute(&self, query: &str, params: &[Value]) -> Result<usize> {
        let prepared = self.flavor.prepare_sql(query);
        tracing::debug!(query = %prepared, params = ?params, "SQL query");
        self.with_conn(|conn| conn.execute(&prepared, params))
            .inspect_err(|_| {
                tracing::error!(query = %prepared, params = ?params, "SQL query failed");
            })
    }

    /// Run a query, returning raw rows.
    pub fn query(&self, query: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        let prepared = self.flavor.prepare_sql(query);
        tracing::debug!(query = %prepared, params = ?params, "SQL query");
        self.with_conn(|conn| conn.query(&prepared, params))
            .inspect_err(|_| {
                tracing::error!(query = %prepared, params = ?params, "SQL query failed");
            })
    }

    pub(crate) fn executemany(
        &self,
        query: &str,
        rows: impl Iterator<Item = Vec<Value>>,
    ) -> Result<()> {
        let prepared = self.flavor.prepare_sql(query);
        tracing::debug!(query = %prepared, "SQL query (many)");
        self.with_conn(|conn| conn.executemany(&prepared, rows))
            .inspect_err(|_| tracing::error!(query = %prepared, "SQL query failed"))
    }

    pub(crate) fn copy_load(
        &self,
        table: &str,
        columns: &[String],
        rows: impl Iterator<Item = Vec<Value>>,
    ) -> Result<()> {
        tracing::debug!(table = %table, "COPY load");
        self.with_conn(|conn| conn.copy_load(table, columns, rows))
    }

    /// Create the registered tables, add missing columns, indexes and
    /// constraints, then seed declared values. Idempotent.
    pub fn create_tables(&self) -> Result<()> {
        if let Some(schema) = self.pg_schema() {
            self.execute(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"), &[])?;
        }

        introspect::introspect_db(self, false)?;

        let registry = self.registry();
        for table in registry.tables() {
            self.create_table(table)?;
        }
        for table in registry.tables() {
            self.add_columns(table)?;
        }
        for table in registry.tables() {
            self.create_index(table)?;
        }
        if self.flavor == Flavor::Sqlite {
            for table in registry.tables() {
                self.create_triggers(table)?;
            }
        }
        for table in registry.tables() {
            self.sync_data(table)?;
        }
        Ok(())
    }

    fn create_table(&self, table: &Arc<Table>) -> Result<()> {
        if self.db_tables.borrow().contains(&table.name) {
            return Ok(());
        }
        self.db_tables.borrow_mut().insert(table.name.clone());

        let referenced = self.referenced.contains(&table.name);
        let mut col_defs = Vec::new();
        let mut created = IndexMap::new();
        for col in table.columns.values() {
            if col.ctype.is_relation() {
                continue;
            }
            let Some(mut def) = col.sql_definition(self.flavor, referenced) else {
                continue;
            };
            if table.key.contains(&col.name) {
                def.push_str(" NOT NULL");
            }
            col_defs.push(format!("{} {def}", quote_ident(&col.name)));
            created.insert(col.name.clone(), col.ctype.sql_name().to_string());
        }
        self.db_columns.borrow_mut().insert(table.name.clone(), created);

        self.execute(
            &format!(
                "CREATE TABLE {} ({})",
                quote_ident(&table.name),
                col_defs.join(", ")
            ),
            &[],
        )?;
        tracing::info!(table = %table.name, "table created");
        Ok(())
    }

    fn add_columns(&self, table: &Arc<Table>) -> Result<()> {
        let known: HashSet<String> = self
            .db_columns
            .borrow()
            .get(&table.name)
            .map(|cols| cols.keys().cloned().collect())
            .unwrap_or_default();
        let referenced = self.referenced.contains(&table.name);

        for col in table.own_columns() {
            if known.contains(&col.name) {
                continue;
            }
            let Some(mut def) = col.sql_definition(self.flavor, referenced) else {
                continue;
            };
            // The embedded engine refuses NOT NULL additions without a
            // default, even on empty tables.
            if table.key.contains(&col.name) && self.flavor != Flavor::Sqlite {
                def.push_str(" NOT NULL");
            }
            self.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} {def}",
                    quote_ident(&table.name),
                    quote_ident(&col.name)
                ),
                &[],
            )?;
            self.db_columns
                .borrow_mut()
                .entry(table.name.clone())
                .or_default()
                .insert(col.name.clone(), col.ctype.sql_name().to_string());
        }
        Ok(())
    }

    fn create_index(&self, table: &Arc<Table>) -> Result<()> {
        // Named unique constraints (no ALTER ADD CONSTRAINT on sqlite).
        if self.flavor != Flavor::Sqlite {
            for cols in &table.unique {
                let cons_name = format!("unique_{}", cols.join("_"));
                if cons_name.len() > 63 {
                    return Err(Error::schema(format!(
                        "Constraint name \"{cons_name}\" is too big"
                    )));
                }
                if self.db_constraints.borrow().contains(&cons_name) {
                    continue;
                }
                self.db_constraints.borrow_mut().insert(cons_name.clone());
                self.execute(
                    &format!(
                        "ALTER TABLE {} ADD CONSTRAINT {cons_name} UNIQUE ({})",
                        quote_ident(&table.name),
                        cols.join(", ")
                    ),
                    &[],
                )?;
            }
        }

        if table.key.is_empty() {
            return Ok(());
        }
        let use_brin = self.flavor == Flavor::Postgresql
            && !self.legacy_pg
            && table.use_index == crate::schema::IndexKind::Brin;
        let idx = if use_brin {
            format!("brin_index_{}", table.name)
        } else {
            format!("unique_index_{}", table.name)
        };
        if self.db_indexes.borrow().contains(&idx) {
            return Ok(());
        }
        self.db_indexes.borrow_mut().insert(idx.clone());

        let cols: Vec<String> = table.key.iter().map(|c| quote_ident(c)).collect();
        let sql = if use_brin {
            format!(
                "CREATE INDEX {} ON {} USING BRIN ({})",
                quote_ident(&idx),
                quote_ident(&table.name),
                cols.join(", ")
            )
        } else {
            format!(
                "CREATE UNIQUE INDEX {} ON {} ({})",
                quote_ident(&idx),
                quote_ident(&table.name),
                cols.join(", ")
            )
        };
        self.execute(&sql, &[])?;
        Ok(())
    }

    /// The embedded engine emulates `ON DELETE CASCADE` with triggers.
    fn create_triggers(&self, table: &Arc<Table>) -> Result<()> {
        for col in table.columns.values() {
            if col.ctype != ColType::M2O {
                continue;
            }
            let (Some(foreign_table), Some(foreign_col)) =
                (col.foreign_table.as_deref(), col.foreign_col.as_deref())
            else {
                continue;
            };
            let name = format!("on_delete_trigger_{}_{}", table.name, col.name);
            self.execute(
                &format!(
                    "CREATE TRIGGER IF NOT EXISTS {} AFTER DELETE ON {} \
                     BEGIN DELETE FROM {} WHERE {} = OLD.{}; END",
                    quote_ident(&name),
                    quote_ident(foreign_table),
                    quote_ident(&table.name),
                    quote_ident(&col.name),
                    quote_ident(foreign_col),
                ),
                &[],
            )?;
        }
        Ok(())
    }

    fn sync_data(&self, table: &Arc<Table>) -> Result<()> {
        if table.values.is_empty() {
            return Ok(());
        }
        tracing::info!(table = %table.name, "populating seed values");
        let fields: Vec<String> = table.values[0].iter().map(|(k, _)| k.clone()).collect();
        let rows: Vec<Vec<Value>> = table
            .values
            .iter()
            .map(|row| {
                fields
                    .iter()
                    .map(|f| {
                        row.iter()
                            .find(|(k, _)| k == f)
                            .map(|(_, v)| v.clone())
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect();
        let view = View::new(self, &table.name, Fields::List(fields))?;
        view.write(
            self,
            WriteData::Rows(rows),
            WriteOptions::new().disable_acl(),
        )?;
        Ok(())
    }
}

thread_local! {
    static CTX_STACK: RefCell<Vec<Rc<Context>>> = const { RefCell::new(Vec::new()) };
}

/// Open a context, run `f` inside it, then commit (or roll back when `f`
/// fails). The context is also pushed on the thread's stack for
/// [`current`].
pub fn connect<R>(cfg: &Config, f: impl FnOnce(&Context) -> Result<R>) -> Result<R> {
    let ctx = Rc::new(Context::open(cfg.clone())?);
    CTX_STACK.with(|stack| stack.borrow_mut().push(ctx.clone()));
    let result = f(&ctx);
    CTX_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
    let closed = ctx.close(result.is_err());
    match result {
        Ok(value) => closed.map(|_| value),
        Err(e) => Err(e),
    }
}

/// Explicitly open a context and push it on the thread's stack.
pub fn enter(cfg: &Config) -> Result<Rc<Context>> {
    let ctx = Rc::new(Context::open(cfg.clone())?);
    CTX_STACK.with(|stack| stack.borrow_mut().push(ctx.clone()));
    Ok(ctx)
}

/// Pop the innermost context and commit its transaction.
pub fn leave() -> Result<()> {
    let ctx = CTX_STACK
        .with(|stack| stack.borrow_mut().pop())
        .ok_or_else(|| Error::usage("No active context"))?;
    ctx.close(false)
}

/// The innermost context of the current thread, if any.
pub fn current() -> Option<Rc<Context>> {
    CTX_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Spawn a thread inheriting the current context's configuration and
/// registry. The child runs `f` inside its own context: same database,
/// own pooled connection, own transaction.
pub fn spawn_with_context<T, F>(f: F) -> JoinHandle<Result<T>>
where
    T: Send + 'static,
    F: FnOnce(&Context) -> Result<T> + Send + 'static,
{
    let captured = current().map(|ctx| (ctx.cfg.clone(), ctx.registry.clone()));
    std::thread::spawn(move || {
        let Some((cfg, registry)) = captured else {
            return Err(Error::usage("No active context to inherit"));
        };
        registries()
            .lock()
            .expect("registry cache poisoned")
            .entry(cfg.effective_db_uri())
            .or_insert(registry);
        connect(&cfg, f)
    })
}
