//! Lazy statement assembly and result materialization.
//!
//! Statements are built as a list of [`Chunk`]s: plain SQL, parsed
//! expressions, and the join plan, which stays lazy so joins required by
//! late-parsed filters still make it into the emitted SQL.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::context::Context;
use crate::expr::{Args, Ast, ReferenceSet};
use crate::expr::{EvalEnv, EvalState};
use crate::schema::ColType;
use crate::value::{self, Value};
use crate::Result;

/// One row of cursor output.
pub type Row = Vec<Value>;

#[derive(Debug, Clone)]
pub(crate) enum Chunk {
    Sql(String),
    Ast {
        ast: Ast,
        /// Pre-bound positional arguments (map filters); when absent the
        /// shared argument state is consumed.
        bound: Option<Vec<Value>>,
    },
    Joins(ReferenceSet),
}

impl Chunk {
    pub(crate) fn sql(s: impl Into<String>) -> Chunk {
        Chunk::Sql(s.into())
    }
}

pub(crate) fn expand_chunks(
    chunks: &[Chunk],
    args: &Args,
    named: &HashMap<String, Value>,
    flavor: crate::backend::Flavor,
) -> Result<(String, Vec<Value>)> {
    let env = EvalEnv { flavor, named };
    let mut state = EvalState::new(args);
    let mut params = Vec::new();
    let mut parts: Vec<String> = Vec::new();
    for chunk in chunks {
        let sql = match chunk {
            Chunk::Sql(s) => s.clone(),
            Chunk::Joins(ref_set) => ref_set.joins_sql(),
            Chunk::Ast { ast, bound } => match bound {
                Some(values) => {
                    let mut local = EvalState {
                        pos: values.clone(),
                        next: 0,
                    };
                    ast.eval_into(&mut local, &env, &mut params)?
                }
                None => ast.eval_into(&mut state, &env, &mut params)?,
            },
        };
        if !sql.is_empty() {
            parts.push(sql);
        }
    }
    Ok((parts.join(" "), params))
}

/// Read conversion target of one selected field.
#[derive(Debug, Clone)]
pub(crate) struct FieldMeta {
    pub(crate) name: String,
    pub(crate) ctype: Option<ColType>,
    pub(crate) array_dim: usize,
}

/// Result of a view read: executes lazily, then materializes rows.
pub struct Cursor<'a> {
    ctx: &'a Context,
    chunks: Vec<Chunk>,
    args: Args,
    fields: Vec<FieldMeta>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        ctx: &'a Context,
        chunks: Vec<Chunk>,
        args: Args,
        fields: Vec<FieldMeta>,
    ) -> Cursor<'a> {
        Cursor {
            ctx,
            chunks,
            args,
            fields,
        }
    }

    /// Replace the bound arguments and return the cursor.
    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    /// Render the SQL and parameter vector without executing.
    pub fn expand(&self) -> Result<(String, Vec<Value>)> {
        let named = self.ctx.eval_named(&self.args);
        expand_chunks(&self.chunks, &self.args, &named, self.ctx.flavor())
    }

    /// Run the statement and return every row.
    pub fn all(self) -> Result<Vec<Row>> {
        let (sql, params) = self.expand()?;
        let mut rows = self.ctx.query(&sql, &params)?;
        if self.ctx.flavor() == crate::backend::Flavor::Sqlite {
            for row in &mut rows {
                for (cell, meta) in row.iter_mut().zip(&self.fields) {
                    let taken = std::mem::replace(cell, Value::Null);
                    *cell = refine_sqlite(taken, meta);
                }
            }
        }
        Ok(rows)
    }

    /// First row, if any.
    pub fn one(self) -> Result<Option<Row>> {
        Ok(self.all()?.into_iter().next())
    }

    /// All rows flattened into a single vector of values.
    pub fn chain(self) -> Result<Vec<Value>> {
        Ok(self.all()?.into_iter().flatten().collect())
    }

    /// Rows as ordered field-name → value maps.
    pub fn dicts(self) -> Result<Vec<IndexMap<String, Value>>> {
        let names: Vec<String> = self.fields.iter().map(|f| f.name.clone()).collect();
        let rows = self.all()?;
        Ok(rows
            .into_iter()
            .map(|row| names.iter().cloned().zip(row).collect())
            .collect())
    }

    /// Run as a statement, returning the affected row count.
    pub fn execute(self) -> Result<usize> {
        let (sql, params) = self.expand()?;
        self.ctx.execute(&sql, &params)
    }
}

/// The embedded engine stores typed values as text or integers; convert
/// them back based on the declared column type of the selected field.
pub(crate) fn refine_sqlite(value: Value, meta: &FieldMeta) -> Value {
    let Some(ctype) = meta.ctype else {
        return value;
    };
    if meta.array_dim > 0 {
        if let Value::Str(s) = &value {
            if let Some(parsed) = parse_array_literal(s, ctype, meta.array_dim) {
                return parsed;
            }
        }
        return value;
    }
    refine_scalar(value, ctype)
}

fn refine_scalar(value: Value, ctype: ColType) -> Value {
    match (ctype, value) {
        (ColType::Bool, Value::Int(i)) => Value::Bool(i != 0),
        (ColType::Float, Value::Int(i)) => Value::Float(i as f64),
        (ColType::Date, Value::Str(s)) => value::parse_date(&s)
            .map(Value::Date)
            .unwrap_or(Value::Str(s)),
        (ColType::Timestamp, Value::Str(s)) => value::parse_timestamp(&s)
            .map(Value::Timestamp)
            .unwrap_or(Value::Str(s)),
        (ColType::Timestamptz, Value::Str(s)) => value::parse_timestamptz(&s)
            .map(Value::Timestamptz)
            .unwrap_or(Value::Str(s)),
        (ColType::Jsonb, Value::Str(s)) => serde_json::from_str(&s)
            .map(Value::Json)
            .unwrap_or(Value::Str(s)),
        (_, v) => v,
    }
}

fn parse_array_literal(s: &str, ctype: ColType, dim: usize) -> Option<Value> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() {
        return Some(Value::Array(Vec::new()));
    }
    let mut cells = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in inner.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                cells.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    cells.push(&inner[start..]);

    let mut out = Vec::with_capacity(cells.len());
    for cell in cells {
        if cell == "null" {
            out.push(Value::Null);
        } else if dim > 1 {
            out.push(parse_array_literal(cell, ctype, dim - 1)?);
        } else {
            out.push(parse_array_cell(cell, ctype));
        }
    }
    Some(Value::Array(out))
}

fn parse_array_cell(cell: &str, ctype: ColType) -> Value {
    match ctype {
        ColType::Integer | ColType::BigInt => cell
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Str(cell.to_string())),
        ColType::Float => cell
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Str(cell.to_string())),
        ColType::Bool => match cell {
            "true" | "t" | "1" | "True" => Value::Bool(true),
            "false" | "f" | "0" | "False" => Value::Bool(false),
            _ => Value::Str(cell.to_string()),
        },
        ColType::Date => value::parse_date(cell)
            .map(Value::Date)
            .unwrap_or_else(|_| Value::Str(cell.to_string())),
        ColType::Timestamp => value::parse_timestamp(cell)
            .map(Value::Timestamp)
            .unwrap_or_else(|_| Value::Str(cell.to_string())),
        _ => Value::Str(cell.to_string()),
    }
}
