//! Bulk, idempotent, foreign-key-aware table synchronization.
//!
//! Tanker clients describe a schema once (tables, column types, keys,
//! relations, defaults, seed values) and then read and write through
//! *views*: projections of a table that may traverse relations by dotted
//! path names such as `team.country.name`. The core translates those
//! operations into SQL for an embedded file engine and a client-server
//! engine with a connection pool, guaranteeing that naturally-keyed
//! upserts, relation resolution and row-level filtering compose.
//!
//! # Example
//!
//! ```ignore
//! let cfg = Config::new("sqlite:///data.db").schema(defs);
//! connect(&cfg, |ctx| {
//!     ctx.create_tables()?;
//!     let view = View::new(ctx, "team", ["name", "country.name"])?;
//!     view.write(ctx, vec![
//!         vec![Value::from("Blue"), Value::from("Belgium")],
//!     ], WriteOptions::new())?;
//!     let rows = view.read(ctx, ReadOptions::new().order("name"))?.all()?;
//!     Ok(rows)
//! })?;
//! ```

pub mod backend;
pub mod cache;
mod context;
mod cursor;
mod error;
pub mod expr;
mod introspect;
mod pool;
pub mod schema;
mod value;
mod view;
mod write;

pub use backend::Flavor;
pub use cache::{LRU_PAGE_SIZE, LRU_SIZE};
pub use context::{
    clear_registries, connect, current, enter, leave, spawn_with_context, Config, Context,
    DEFAULT_DB_URI,
};
pub use cursor::{Cursor, Row};
pub use error::Error;
pub use expr::{Args, Ast, Expression, Filter, Reference, ReferenceSet, TableAliases};
pub use pool::Pool;
pub use schema::{ColType, Column, IndexKind, KeyDef, Registry, Table, TableDef};
pub use value::Value;
pub use view::{
    fetch, link, save, DeleteOptions, FieldKind, Fields, OrderItem, ReadOptions, View, ViewField,
};
pub use write::{WriteData, WriteOptions, WriteResult};

/// Result type for tanker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Quote an SQL identifier, doubling any embedded quotes.
///
/// Identifiers are always quoted so reserved words like `order` or
/// `group` stay usable as table and column names.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
