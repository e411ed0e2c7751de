//! Schema definition: column types, tables, and the per-URI registry.
//!
//! Tables are declared once (from config entries or introspection) and are
//! immutable after registration. Every table carries an implicit integer
//! `id` primary key unless one is declared; the *natural key* is the
//! ordered list of columns that identifies a row independently of `id`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::backend::Flavor;
use crate::value::{self, Value};
use crate::{Error, Result, quote_ident};

/// Column base types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColType {
    Integer,
    BigInt,
    Float,
    Bool,
    Varchar,
    Date,
    Timestamp,
    Timestamptz,
    Jsonb,
    Bytea,
    /// Forward relation, stored as an integer referencing the remote column.
    M2O,
    /// Reverse view of an `m2o` on the remote table; not stored.
    O2M,
}

impl ColType {
    pub fn parse(s: &str) -> Option<ColType> {
        Some(match s.to_ascii_lowercase().as_str() {
            "integer" => ColType::Integer,
            "bigint" => ColType::BigInt,
            "float" => ColType::Float,
            "bool" => ColType::Bool,
            "varchar" => ColType::Varchar,
            "date" => ColType::Date,
            "timestamp" => ColType::Timestamp,
            "timestamptz" => ColType::Timestamptz,
            "jsonb" => ColType::Jsonb,
            "bytea" => ColType::Bytea,
            "m2o" => ColType::M2O,
            "o2m" => ColType::O2M,
            _ => return None,
        })
    }

    pub fn sql_name(self) -> &'static str {
        match self {
            ColType::Integer => "INTEGER",
            ColType::BigInt => "BIGINT",
            ColType::Float => "FLOAT",
            ColType::Bool => "BOOL",
            ColType::Varchar => "VARCHAR",
            ColType::Date => "DATE",
            ColType::Timestamp => "TIMESTAMP",
            ColType::Timestamptz => "TIMESTAMPTZ",
            ColType::Jsonb => "JSONB",
            ColType::Bytea => "BYTEA",
            ColType::M2O => "M2O",
            ColType::O2M => "O2M",
        }
    }

    pub fn is_relation(self) -> bool {
        matches!(self, ColType::M2O | ColType::O2M)
    }
}

impl std::fmt::Display for ColType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sql_name())
    }
}

/// A column definition.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Base type, array dimensions excluded
    pub ctype: ColType,
    /// Number of `[]` suffixes on the declared type
    pub array_dim: usize,
    /// Owning table name, filled at registration
    pub table: String,
    /// Remote table for `m2o`/`o2m`
    pub foreign_table: Option<String>,
    /// Remote column for `m2o`/`o2m`
    pub foreign_col: Option<String>,
    /// Backend literal applied at table creation time
    pub default: Option<String>,
}

impl Column {
    /// Parse a type expression: `"varchar"`, `"integer[][]"`,
    /// `"m2o team.id"`, `"o2m member.team"`.
    pub fn new(name: &str, type_expr: &str, default: Option<String>) -> Result<Column> {
        let (head, fk) = match type_expr.split_once(char::is_whitespace) {
            Some((head, fk)) => {
                let fk = fk.trim();
                if !fk.contains('.') {
                    return Err(Error::schema(format!(
                        "Malformed column definition \"{type_expr}\" for {name}"
                    )));
                }
                (head, Some(fk))
            }
            None => (type_expr, None),
        };

        let mut base = head;
        let mut array_dim = 0;
        while let Some(stripped) = base.strip_suffix("[]") {
            base = stripped;
            array_dim += 1;
        }
        let ctype = ColType::parse(base).ok_or_else(|| {
            Error::schema(format!("Unexpected type {type_expr} for column {name}"))
        })?;
        if array_dim > 0 && ctype.is_relation() {
            return Err(Error::schema(format!(
                "Array type is not supported on \"{}\" (for column \"{name}\")",
                ctype.sql_name()
            )));
        }

        let (foreign_table, foreign_col) = match fk {
            Some(fk) => {
                let (t, c) = fk.split_once('.').expect("checked above");
                (Some(t.to_string()), Some(c.to_string()))
            }
            None => (None, None),
        };

        Ok(Column {
            name: name.to_string(),
            ctype,
            array_dim,
            table: String::new(),
            foreign_table,
            foreign_col,
            default,
        })
    }

    /// The declared SQL type, array dimensions included.
    pub fn sql_type(&self) -> String {
        let mut t = self.ctype.sql_name().to_string();
        for _ in 0..self.array_dim {
            t.push_str("[]");
        }
        t
    }

    /// Column clause for CREATE TABLE / ADD COLUMN. `None` for `o2m`
    /// columns, which are not stored.
    pub fn sql_definition(&self, flavor: Flavor, id_referenced: bool) -> Option<String> {
        if self.name == "id" {
            let bigint = self.ctype == ColType::BigInt;
            return Some(flavor.id_sql_definition(bigint, id_referenced));
        }
        match self.ctype {
            ColType::O2M => None,
            ColType::M2O => match flavor {
                // Cascade is emulated with triggers on the embedded engine
                // and skipped on the distributed dialect.
                Flavor::Sqlite | Flavor::Crdb => Some("INTEGER".to_string()),
                Flavor::Postgresql => Some(format!(
                    "INTEGER REFERENCES {} ({}) ON DELETE CASCADE",
                    quote_ident(self.foreign_table.as_deref().unwrap_or_default()),
                    quote_ident(self.foreign_col.as_deref().unwrap_or_default()),
                )),
            },
            _ => match &self.default {
                Some(d) => Some(format!("{} DEFAULT {}", self.sql_type(), d)),
                None => Some(self.sql_type()),
            },
        }
    }

    pub fn get_foreign_table(&self, registry: &Registry) -> Result<Arc<Table>> {
        let name = self.foreign_table.as_deref().ok_or_else(|| {
            Error::schema(format!(
                "The \"{}\" column of \"{}\" is not a foreign key",
                self.name, self.table
            ))
        })?;
        registry.get(name)
    }

    /// Coerce a column of values to backend-ready form.
    pub fn format(&self, values: Vec<Value>, encoding: &str) -> Result<Vec<Value>> {
        self.format_as(values, self.ctype, self.array_dim, encoding)
    }

    pub fn format_as(
        &self,
        values: Vec<Value>,
        astype: ColType,
        array_dim: usize,
        encoding: &str,
    ) -> Result<Vec<Value>> {
        if astype == ColType::O2M {
            return Err(Error::schema(format!(
                "o2m column \"{}\" cannot be written directly",
                self.name
            )));
        }
        values
            .into_iter()
            .map(|v| {
                if array_dim > 0 {
                    format_array(v, astype, array_dim, encoding)
                } else {
                    format_scalar(v, astype, encoding)
                }
            })
            .collect()
    }
}

fn coercion_err(v: &Value, astype: ColType) -> Error {
    Error::Coercion {
        value: v.literal_text(),
        ctype: astype.sql_name().to_lowercase(),
    }
}

fn format_array(v: Value, astype: ColType, array_dim: usize, encoding: &str) -> Result<Value> {
    let items = match v {
        Value::Null => return Ok(Value::Null),
        Value::Array(items) => items,
        other => return Err(coercion_err(&other, astype)),
    };
    let cells: Vec<String> = if array_dim == 1 {
        items
            .into_iter()
            .map(|cell| Ok(format_scalar(cell, astype, encoding)?.literal_text()))
            .collect::<Result<_>>()?
    } else {
        items
            .into_iter()
            .map(|cell| Ok(format_array(cell, astype, array_dim - 1, encoding)?.literal_text()))
            .collect::<Result<_>>()?
    };
    Ok(Value::Str(format!("{{{}}}", cells.join(","))))
}

fn nanos_to_utc(ns: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    let secs = ns.div_euclid(1_000_000_000);
    let nsec = ns.rem_euclid(1_000_000_000) as u32;
    chrono::DateTime::from_timestamp(secs, nsec)
}

fn format_scalar(v: Value, astype: ColType, encoding: &str) -> Result<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    match astype {
        ColType::Integer | ColType::BigInt | ColType::M2O => match v {
            Value::Int(_) => Ok(v),
            Value::Float(f) if f.fract() == 0.0 => Ok(Value::Int(f as i64)),
            Value::Str(ref s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| coercion_err(&v, astype)),
            _ => Err(coercion_err(&v, astype)),
        },
        ColType::Float => match v {
            Value::Float(_) => Ok(v),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::Str(ref s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| coercion_err(&v, astype)),
            _ => Err(coercion_err(&v, astype)),
        },
        ColType::Bool => match v {
            Value::Bool(_) => Ok(v),
            Value::Int(i) => Ok(Value::Bool(i != 0)),
            _ => Err(coercion_err(&v, astype)),
        },
        ColType::Varchar => match v {
            Value::Str(s) if s.is_empty() => Ok(Value::Null),
            Value::Str(_) => Ok(v),
            Value::Bytes(b) => {
                if !matches!(
                    encoding.to_ascii_lowercase().as_str(),
                    "utf-8" | "utf8" | "ascii"
                ) {
                    return Err(Error::usage(format!(
                        "Unsupported encoding \"{encoding}\""
                    )));
                }
                String::from_utf8(b.clone())
                    .map(Value::Str)
                    .map_err(|_| coercion_err(&Value::Bytes(b), astype))
            }
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
                Ok(Value::Str(v.literal_text()))
            }
            _ => Err(coercion_err(&v, astype)),
        },
        ColType::Date => match v {
            Value::Date(_) => Ok(v),
            Value::Timestamp(t) => Ok(Value::Date(t.date())),
            Value::Timestamptz(t) => Ok(Value::Date(t.naive_utc().date())),
            Value::Str(ref s) => value::parse_date(s).map(Value::Date),
            Value::Int(i) => nanos_to_utc(i)
                .map(|t| Value::Date(t.naive_utc().date()))
                .ok_or_else(|| coercion_err(&v, astype)),
            Value::Float(f) => nanos_to_utc(f as i64)
                .map(|t| Value::Date(t.naive_utc().date()))
                .ok_or_else(|| coercion_err(&v, astype)),
            _ => Err(coercion_err(&v, astype)),
        },
        ColType::Timestamp => match v {
            Value::Timestamp(_) => Ok(v),
            Value::Timestamptz(t) => Ok(Value::Timestamp(t.naive_utc())),
            Value::Date(d) => Ok(Value::Timestamp(
                d.and_hms_opt(0, 0, 0).expect("midnight is valid"),
            )),
            Value::Str(ref s) => value::parse_timestamp(s).map(Value::Timestamp),
            Value::Int(i) => nanos_to_utc(i)
                .map(|t| Value::Timestamp(t.naive_utc()))
                .ok_or_else(|| coercion_err(&v, astype)),
            Value::Float(f) => nanos_to_utc(f as i64)
                .map(|t| Value::Timestamp(t.naive_utc()))
                .ok_or_else(|| coercion_err(&v, astype)),
            _ => Err(coercion_err(&v, astype)),
        },
        ColType::Timestamptz => match v {
            Value::Timestamptz(_) => Ok(v),
            Value::Timestamp(t) => Ok(Value::Timestamptz(t.and_utc())),
            Value::Date(d) => Ok(Value::Timestamptz(
                d.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc(),
            )),
            Value::Str(ref s) => value::parse_timestamptz(s).map(Value::Timestamptz),
            Value::Int(i) => nanos_to_utc(i)
                .map(Value::Timestamptz)
                .ok_or_else(|| coercion_err(&v, astype)),
            Value::Float(f) => nanos_to_utc(f as i64)
                .map(Value::Timestamptz)
                .ok_or_else(|| coercion_err(&v, astype)),
            _ => Err(coercion_err(&v, astype)),
        },
        ColType::Jsonb => match v {
            Value::Str(_) => Ok(v),
            other => Ok(Value::Str(serde_json::to_string(&other.to_json())?)),
        },
        ColType::Bytea => match v {
            Value::Bytes(_) => Ok(v),
            Value::Str(s) => Ok(Value::Bytes(s.into_bytes())),
            _ => Err(coercion_err(&v, astype)),
        },
        ColType::O2M => Err(coercion_err(&v, astype)),
    }
}

/// Kind of index maintained over a table's natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Btree,
    Brin,
}

/// A table definition with its natural key and relations.
#[derive(Debug)]
pub struct Table {
    pub name: String,
    pub columns: IndexMap<String, Column>,
    /// Natural key: ordered column names forming a unique tuple
    pub key: Vec<String>,
    /// Additional unique constraints
    pub unique: Vec<Vec<String>>,
    pub use_index: IndexKind,
    /// Seed rows written on table creation
    pub values: Vec<Vec<(String, Value)>>,
}

impl Table {
    pub fn new(
        name: &str,
        mut columns: Vec<Column>,
        key: Option<Vec<String>>,
        unique: Vec<Vec<String>>,
        values: Vec<Vec<(String, Value)>>,
        use_index: Option<&str>,
    ) -> Result<Arc<Table>> {
        let use_index = match use_index {
            None => IndexKind::Btree,
            Some(s) => match s.to_ascii_lowercase().as_str() {
                "btree" => IndexKind::Btree,
                "brin" => IndexKind::Brin,
                other => {
                    return Err(Error::schema(format!(
                        "Value \"{other}\" not supported for use-index"
                    )));
                }
            },
        };

        if !columns.iter().any(|c| c.name == "id") {
            columns.insert(0, Column::new("id", "integer", None)?);
        }
        for col in &mut columns {
            col.table = name.to_string();
        }

        let key = match key {
            Some(key) => key,
            None => {
                // A single non-id column is its own natural key.
                if columns.len() == 2 {
                    columns
                        .iter()
                        .filter(|c| c.name != "id")
                        .map(|c| c.name.clone())
                        .collect()
                } else {
                    return Err(Error::schema(format!("No key defined on {name}")));
                }
            }
        };

        let columns: IndexMap<String, Column> =
            columns.into_iter().map(|c| (c.name.clone(), c)).collect();
        for k in &key {
            if !columns.contains_key(k) {
                return Err(Error::schema(format!("Key column \"{k}\" does not exist")));
            }
        }

        Ok(Arc::new(Table {
            name: name.to_string(),
            columns,
            key,
            unique,
            use_index,
            values,
        }))
    }

    pub fn get_column(&self, name: &str) -> Result<&Column> {
        self.columns.get(name).ok_or_else(|| Error::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }

    /// Stored columns, `id` excluded.
    pub fn own_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .values()
            .filter(|c| c.name != "id" && c.ctype != ColType::O2M)
    }

    /// Field list used when a view does not name its fields: every stored
    /// column, with `m2o` columns expanded to the remote natural key.
    pub fn default_fields(&self, registry: &Registry) -> Result<Vec<String>> {
        let mut fields = Vec::new();
        for col in self.own_columns() {
            if col.ctype == ColType::M2O {
                let ft = col.get_foreign_table(registry)?;
                for part in &ft.key {
                    fields.push(format!("{}.{}", col.name, part));
                }
            } else {
                fields.push(col.name.clone());
            }
        }
        Ok(fields)
    }

    /// All acyclic relation paths from this table to `dest`, shortest
    /// first. Walks both `m2o` and `o2m` edges, never reusing a column
    /// within one path.
    pub fn link(&self, registry: &Registry, dest: &str) -> Result<Vec<Vec<Column>>> {
        let mut wave = vec![self.name.clone()];
        let mut paths: HashMap<String, Vec<Vec<Column>>> = HashMap::new();

        loop {
            let mut new_wave = Vec::new();
            for tbl_name in &wave {
                let tbl = registry.get(tbl_name)?;
                let base = paths.get(tbl_name).cloned().unwrap_or_default();
                let visited: HashSet<(String, String)> = base
                    .iter()
                    .flatten()
                    .map(|c| (c.table.clone(), c.name.clone()))
                    .collect();
                for col in tbl.columns.values().filter(|c| c.ctype.is_relation()) {
                    if visited.contains(&(col.table.clone(), col.name.clone())) {
                        continue;
                    }
                    let ft = col.get_foreign_table(registry)?;
                    let entry = paths.entry(ft.name.clone()).or_default();
                    if base.is_empty() {
                        entry.push(vec![col.clone()]);
                    } else {
                        for p in &base {
                            let mut p = p.clone();
                            p.push(col.clone());
                            entry.push(p);
                        }
                    }
                    new_wave.push(ft.name.clone());
                }
            }
            if new_wave.is_empty() {
                break;
            }
            wave = new_wave;
        }

        let mut found = paths.remove(dest).unwrap_or_default();
        let mut seen = HashSet::new();
        found.retain(|p| {
            let sig: Vec<(String, String)> =
                p.iter().map(|c| (c.table.clone(), c.name.clone())).collect();
            seen.insert(sig)
        });
        found.sort_by_key(|p| p.len());
        Ok(found)
    }
}

/// Ordered map of registered tables, cached process-wide per database URI.
#[derive(Debug, Clone)]
pub struct Registry {
    tables: Arc<IndexMap<String, Arc<Table>>>,
}

impl Registry {
    pub fn empty() -> Registry {
        Registry {
            tables: Arc::new(IndexMap::new()),
        }
    }

    pub fn from_defs(defs: &[TableDef]) -> Result<Registry> {
        let mut tables = IndexMap::new();
        for def in defs {
            if tables.contains_key(&def.table) {
                continue;
            }
            let table = def.build()?;
            tables.insert(def.table.clone(), table);
        }
        Ok(Registry {
            tables: Arc::new(tables),
        })
    }

    pub fn get(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.tables.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Tables referenced as foreign table by some `m2o` column. Their `id`
    /// needs an explicit primary-key index.
    pub fn referenced(&self) -> HashSet<String> {
        self.tables
            .values()
            .flat_map(|t| t.columns.values())
            .filter(|c| c.ctype == ColType::M2O)
            .filter_map(|c| c.foreign_table.clone())
            .collect()
    }
}

/// Either a single key column or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeyDef {
    One(String),
    Many(Vec<String>),
}

impl KeyDef {
    fn into_vec(self) -> Vec<String> {
        match self {
            KeyDef::One(s) => vec![s],
            KeyDef::Many(v) => v,
        }
    }
}

/// A schema entry, the deserializable form a table is declared with.
#[derive(Debug, Clone, Deserialize)]
pub struct TableDef {
    pub table: String,
    pub columns: IndexMap<String, String>,
    #[serde(default, alias = "index")]
    pub key: Option<KeyDef>,
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
    #[serde(default, rename = "use-index")]
    pub use_index: Option<String>,
    #[serde(default)]
    pub defaults: HashMap<String, String>,
    #[serde(default)]
    pub values: Vec<IndexMap<String, serde_json::Value>>,
}

impl TableDef {
    fn build(&self) -> Result<Arc<Table>> {
        let mut columns = Vec::with_capacity(self.columns.len());
        for (col_name, type_expr) in &self.columns {
            let default = self.defaults.get(col_name).cloned();
            columns.push(Column::new(col_name, type_expr, default)?);
        }
        let values = self
            .values
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect()
            })
            .collect();
        Table::new(
            &self.table,
            columns,
            self.key.clone().map(KeyDef::into_vec),
            self.unique.clone(),
            values,
            self.use_index.as_deref(),
        )
    }
}
