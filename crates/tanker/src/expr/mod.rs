//! Prefix expression language used for filters, computed fields, sort
//! keys, grouping and sub-selects.
//!
//! Expressions parse into an AST whose evaluation yields a SQL fragment
//! with `%s` placeholders and a parallel vector of parameter values; the
//! backend adapter later rewrites the placeholders into the driver's
//! syntax. Symbols resolve against the owning table through a
//! [`ReferenceSet`], which accumulates the LEFT JOINs needed by dotted
//! paths.

mod lex;
mod refs;

pub use refs::{Reference, ReferenceSet, TableAliases};

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use crate::backend::Flavor;
use crate::cursor::Chunk;
use crate::schema::{Registry, Table};
use crate::value::Value;
use crate::{Error, Result};

/// Operators understood by the language. Aggregates are kept apart so the
/// read path can auto-derive GROUP BY clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Ge,
    Le,
    Eq,
    Gt,
    Lt,
    Ne,
    Arrow,
    Like,
    Ilike,
    In,
    NotIn,
    Any,
    All,
    Unnest,
    Is,
    IsNot,
    Not,
    Exists,
    Where,
    Select,
    SelectDistinct,
    Cast,
    Extract,
    Floor,
    DateTrunc,
    True,
    False,
    Strftime,
    From,
    // aggregates
    Avg,
    Count,
    Max,
    Min,
    Sum,
    BoolAnd,
    BoolOr,
    Every,
}

impl Builtin {
    fn from_token(token: &str) -> Option<Builtin> {
        Some(match token.to_ascii_lowercase().as_str() {
            "and" => Builtin::And,
            "or" => Builtin::Or,
            "+" => Builtin::Add,
            "-" => Builtin::Sub,
            "*" => Builtin::Mul,
            "/" => Builtin::Div,
            ">=" => Builtin::Ge,
            "<=" => Builtin::Le,
            "=" => Builtin::Eq,
            ">" => Builtin::Gt,
            "<" => Builtin::Lt,
            "!=" => Builtin::Ne,
            "->>" => Builtin::Arrow,
            "like" => Builtin::Like,
            "ilike" => Builtin::Ilike,
            "in" => Builtin::In,
            "notin" => Builtin::NotIn,
            "any" => Builtin::Any,
            "all" => Builtin::All,
            "unnest" => Builtin::Unnest,
            "is" => Builtin::Is,
            "isnot" => Builtin::IsNot,
            "not" => Builtin::Not,
            "exists" => Builtin::Exists,
            "where" => Builtin::Where,
            "select" => Builtin::Select,
            "select-distinct" => Builtin::SelectDistinct,
            "cast" => Builtin::Cast,
            "extract" => Builtin::Extract,
            "floor" => Builtin::Floor,
            "date_trunc" => Builtin::DateTrunc,
            "true" => Builtin::True,
            "false" => Builtin::False,
            "strftime" => Builtin::Strftime,
            "from" => Builtin::From,
            "avg" => Builtin::Avg,
            "count" => Builtin::Count,
            "max" => Builtin::Max,
            "min" => Builtin::Min,
            "sum" => Builtin::Sum,
            "bool_and" => Builtin::BoolAnd,
            "bool_or" => Builtin::BoolOr,
            "every" => Builtin::Every,
            _ => return None,
        })
    }

    pub(crate) fn is_aggregate(self) -> bool {
        matches!(
            self,
            Builtin::Avg
                | Builtin::Count
                | Builtin::Max
                | Builtin::Min
                | Builtin::Sum
                | Builtin::BoolAnd
                | Builtin::BoolOr
                | Builtin::Every
        )
    }

    fn infix(name: &str, args: &[String]) -> String {
        format!("({})", args.join(&format!(" {name} ")))
    }

    fn two<'a>(self, args: &'a [String]) -> Result<(&'a str, &'a str)> {
        if args.len() != 2 {
            return Err(Error::expr(format!(
                "operator expects two arguments, got {}",
                args.len()
            )));
        }
        Ok((args[0].as_str(), args[1].as_str()))
    }

    fn one<'a>(self, args: &'a [String]) -> Result<&'a str> {
        if args.len() != 1 {
            return Err(Error::expr(format!(
                "operator expects one argument, got {}",
                args.len()
            )));
        }
        Ok(args[0].as_str())
    }

    fn apply(self, args: &[String], flavor: Flavor) -> Result<String> {
        Ok(match self {
            Builtin::And => Self::infix("AND", args),
            Builtin::Or => Self::infix("OR", args),
            Builtin::Add => Self::infix("+", args),
            Builtin::Sub => {
                if args.len() == 1 {
                    format!("- {}", args[0])
                } else {
                    Self::infix("-", args)
                }
            }
            Builtin::Mul => Self::infix("*", args),
            Builtin::Div => Self::infix("/", args),
            Builtin::Ge => {
                let (x, y) = self.two(args)?;
                format!("{x} >= {y}")
            }
            Builtin::Le => {
                let (x, y) = self.two(args)?;
                format!("{x} <= {y}")
            }
            Builtin::Eq => {
                let (x, y) = self.two(args)?;
                format!("{x} = {y}")
            }
            Builtin::Gt => {
                let (x, y) = self.two(args)?;
                format!("{x} > {y}")
            }
            Builtin::Lt => {
                let (x, y) = self.two(args)?;
                format!("{x} < {y}")
            }
            Builtin::Ne => {
                let (x, y) = self.two(args)?;
                format!("{x} != {y}")
            }
            Builtin::Arrow => {
                let (x, y) = self.two(args)?;
                format!("{x} ->> {y}")
            }
            Builtin::Like => {
                let (x, y) = self.two(args)?;
                format!("{x} like {y}")
            }
            Builtin::Ilike => {
                let (x, y) = self.two(args)?;
                format!("{x} ilike {y}")
            }
            Builtin::In | Builtin::NotIn => {
                if args.is_empty() {
                    return Err(Error::expr("in expects at least one argument"));
                }
                let op = if self == Builtin::In { "in" } else { "not in" };
                format!("{} {op} ({})", args[0], args[1..].join(", "))
            }
            Builtin::Any => format!("any({})", self.one(args)?),
            Builtin::All => format!("all({})", self.one(args)?),
            Builtin::Unnest => format!("unnest({})", self.one(args)?),
            Builtin::Is => {
                let (x, y) = self.two(args)?;
                format!("{x} is {y}")
            }
            Builtin::IsNot => {
                let (x, y) = self.two(args)?;
                format!("{x} is not {y}")
            }
            Builtin::Not => format!("not {}", self.one(args)?),
            Builtin::Exists => format!("EXISTS ({})", self.one(args)?),
            Builtin::Where => format!("WHERE {}", args.join(" AND ")),
            Builtin::Select => format!("SELECT {}", args.join(", ")),
            Builtin::SelectDistinct => format!("SELECT DISTINCT {}", args.join(", ")),
            Builtin::Cast => {
                let (x, y) = self.two(args)?;
                format!("CAST ({x} AS {y})")
            }
            Builtin::Extract => {
                let (x, y) = self.two(args)?;
                format!("EXTRACT ({x} FROM {y})")
            }
            Builtin::Floor => format!("floor({})", self.one(args)?),
            Builtin::DateTrunc => {
                let (x, y) = self.two(args)?;
                format!("date_trunc({x}, {y})")
            }
            Builtin::True => match flavor {
                Flavor::Sqlite => "1".to_string(),
                _ => "true".to_string(),
            },
            Builtin::False => match flavor {
                Flavor::Sqlite => "0".to_string(),
                _ => "false".to_string(),
            },
            Builtin::Strftime => {
                let (x, y) = self.two(args)?;
                format!("strftime({x}, {y})")
            }
            Builtin::From => {
                return Err(Error::expr("from is only valid as a sub-select head"));
            }
            Builtin::Count => {
                if args.is_empty() {
                    "count(*)".to_string()
                } else {
                    format!("count({})", args.join(", "))
                }
            }
            Builtin::Avg => format!("avg({})", self.one(args)?),
            Builtin::Max => format!("max({})", self.one(args)?),
            Builtin::Min => format!("min({})", self.one(args)?),
            Builtin::Sum => format!("sum({})", self.one(args)?),
            Builtin::BoolAnd => format!("bool_and({})", self.one(args)?),
            Builtin::BoolOr => format!("bool_or({})", self.one(args)?),
            Builtin::Every => format!("every({})", self.one(args)?),
        })
    }
}

/// A resolved symbol: either an operator, a column reference, or a raw
/// word passed through to the SQL (cast targets and the like).
#[derive(Debug, Clone)]
pub(crate) enum SymbolKind {
    Builtin(Builtin),
    Ref(Reference),
    Raw(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Symbol {
    pub(crate) kind: SymbolKind,
}

impl Symbol {
    fn resolve(token: &str, exp: &Expression, first: bool) -> Result<Symbol> {
        if token.starts_with("_parent.") {
            let mut tail = token;
            let mut target = exp.clone();
            while let Some(rest) = tail.strip_prefix("_parent.") {
                target = target.parent().ok_or_else(|| {
                    Error::expr(format!("\"{token}\" not understood"))
                })?;
                tail = rest;
            }
            let r = target
                .ref_set()
                .add(tail)
                .map_err(|_| Error::expr(format!("\"{token}\" not understood")))?;
            return Ok(Symbol {
                kind: SymbolKind::Ref(r),
            });
        }
        if first {
            return Ok(Symbol {
                kind: match Builtin::from_token(token) {
                    Some(b) => SymbolKind::Builtin(b),
                    None => SymbolKind::Raw(token.to_string()),
                },
            });
        }
        if let Some(desc) = exp.env_get(token) {
            let r = exp.ref_set().add(&desc)?;
            return Ok(Symbol {
                kind: SymbolKind::Ref(r),
            });
        }
        match exp.ref_set().add(token) {
            Ok(r) => Ok(Symbol {
                kind: SymbolKind::Ref(r),
            }),
            Err(Error::UnknownColumn { .. }) => {
                Err(Error::expr(format!("\"{token}\" not understood")))
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn sql(&self) -> String {
        match &self.kind {
            SymbolKind::Ref(r) => r.sql(),
            SymbolKind::Raw(s) => s.clone(),
            SymbolKind::Builtin(_) => String::new(),
        }
    }
}

/// A `{…}` parameter reference, bound at execute time.
#[derive(Debug, Clone)]
pub(crate) struct ParamRef {
    key: ParamKey,
    tail: Vec<String>,
    conversion: Option<char>,
    fmt_spec: Option<String>,
}

#[derive(Debug, Clone)]
enum ParamKey {
    /// `{}`: consumes the next positional argument
    Implicit,
    /// `{0}`: indexes the positional arguments
    Pos(usize),
    /// `{name}`: resolves from named arguments, then the context env
    Named(String),
}

impl ParamRef {
    fn parse(token: &str) -> ParamRef {
        let (token, fmt_spec) = match token.split_once(':') {
            Some((t, spec)) => (t, Some(spec.to_string())),
            None => (token, None),
        };
        let (token, conversion) = match token.split_once('!') {
            Some((t, conv)) => (t, conv.chars().next()),
            None => (token, None),
        };
        let mut parts = token.split('.');
        let head = parts.next().unwrap_or_default();
        let tail: Vec<String> = parts.map(str::to_string).collect();
        let key = if head.is_empty() {
            ParamKey::Implicit
        } else if let Ok(n) = head.parse::<usize>() {
            ParamKey::Pos(n)
        } else {
            ParamKey::Named(head.to_string())
        };
        ParamRef {
            key,
            tail,
            conversion,
            fmt_spec,
        }
    }

    fn resolve(&self, state: &mut EvalState, env: &EvalEnv) -> Result<Value> {
        let mut value = match &self.key {
            ParamKey::Implicit => {
                let v = state
                    .pos
                    .get(state.next)
                    .cloned()
                    .ok_or_else(|| Error::expr("missing positional argument"))?;
                state.next += 1;
                v
            }
            ParamKey::Pos(n) => state
                .pos
                .get(*n)
                .cloned()
                .ok_or_else(|| Error::expr(format!("missing positional argument {n}")))?,
            ParamKey::Named(name) => env
                .named
                .get(name)
                .cloned()
                .ok_or_else(|| Error::expr(format!("\"{name}\" not understood")))?,
        };
        for attr in &self.tail {
            value = match &value {
                Value::Json(serde_json::Value::Object(map)) => map
                    .get(attr)
                    .map(Value::from_json)
                    .ok_or_else(|| Error::expr(format!("\"{attr}\" not understood")))?,
                _ => {
                    return Err(Error::expr(format!(
                        "cannot resolve \"{attr}\" on {value:?}"
                    )));
                }
            };
        }
        if let Some(spec) = &self.fmt_spec {
            value = format_field(&value, spec)?;
        }
        if let Some(conv) = self.conversion {
            value = convert_field(&value, conv)?;
        }
        Ok(value)
    }
}

/// Apply a format spec (fill, align, width, precision) to a value.
fn format_field(value: &Value, spec: &str) -> Result<Value> {
    let mut chars: Vec<char> = spec.chars().collect();
    // Drop a trailing presentation type; the value already knows its kind.
    if let Some(&last) = chars.last() {
        if last.is_ascii_alphabetic() {
            chars.pop();
        }
    }
    let (fill, align) = if chars.len() >= 2 && "<>^".contains(chars[1]) {
        (chars.remove(0), Some(chars.remove(0)))
    } else if !chars.is_empty() && "<>^".contains(chars[0]) {
        (' ', Some(chars.remove(0)))
    } else {
        (' ', None)
    };
    let rest: String = chars.into_iter().collect();
    let (width_part, precision) = match rest.split_once('.') {
        Some((w, p)) => (
            w.to_string(),
            Some(p.parse::<usize>().map_err(|_| {
                Error::expr(format!("bad format spec \"{spec}\""))
            })?),
        ),
        None => (rest, None),
    };
    let width: usize = if width_part.is_empty() {
        0
    } else {
        width_part
            .parse()
            .map_err(|_| Error::expr(format!("bad format spec \"{spec}\"")))?
    };

    let base = match (value, precision) {
        (Value::Float(f), Some(p)) => format!("{f:.p$}"),
        (Value::Int(i), Some(p)) => format!("{:.p$}", *i as f64),
        _ => value.literal_text(),
    };
    let padded = if base.len() >= width {
        base
    } else {
        let pad = width - base.len();
        let is_number = matches!(value, Value::Int(_) | Value::Float(_));
        match align.unwrap_or(if is_number { '>' } else { '<' }) {
            '<' => format!("{base}{}", fill.to_string().repeat(pad)),
            '>' => format!("{}{base}", fill.to_string().repeat(pad)),
            _ => {
                let left = pad / 2;
                format!(
                    "{}{base}{}",
                    fill.to_string().repeat(left),
                    fill.to_string().repeat(pad - left)
                )
            }
        }
    };
    Ok(Value::Str(padded))
}

fn convert_field(value: &Value, conv: char) -> Result<Value> {
    match conv {
        'r' => Ok(Value::Str(match value {
            Value::Str(s) => format!("'{s}'"),
            other => other.literal_text(),
        })),
        's' => Ok(Value::Str(value.literal_text())),
        other => Err(Error::expr(format!("unknown conversion \"!{other}\""))),
    }
}

/// One node of a parsed expression.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Str(String),
    Int(i64),
    Float(f64),
    Param(ParamRef),
    Symbol(Symbol),
    List {
        exp: Expression,
        atoms: Vec<Node>,
        sub_select: bool,
    },
}

/// Evaluation-time positional arguments; `{}` consumes them in order.
#[derive(Debug, Default)]
pub(crate) struct EvalState {
    pub(crate) pos: Vec<Value>,
    pub(crate) next: usize,
}

impl EvalState {
    pub(crate) fn new(args: &Args) -> EvalState {
        EvalState {
            pos: match args {
                Args::Positional(v) => v.clone(),
                _ => Vec::new(),
            },
            next: 0,
        }
    }
}

pub(crate) struct EvalEnv<'a> {
    pub(crate) flavor: Flavor,
    pub(crate) named: &'a HashMap<String, Value>,
}

/// A parsed expression ready to be evaluated into SQL + params.
#[derive(Debug, Clone)]
pub struct Ast {
    pub(crate) root: Node,
}

impl Ast {
    /// Evaluate with explicit arguments; mostly used by tests and simple
    /// callers. The read/write paths go through the chunk machinery which
    /// shares argument state across several expressions.
    pub fn eval(
        &self,
        args: &[Value],
        kwargs: &HashMap<String, Value>,
        flavor: Flavor,
    ) -> Result<(String, Vec<Value>)> {
        let mut state = EvalState {
            pos: args.to_vec(),
            next: 0,
        };
        let env = EvalEnv {
            flavor,
            named: kwargs,
        };
        let mut params = Vec::new();
        let sql = self.eval_into(&mut state, &env, &mut params)?;
        Ok((sql, params))
    }

    pub(crate) fn eval_into(
        &self,
        state: &mut EvalState,
        env: &EvalEnv,
        params: &mut Vec<Value>,
    ) -> Result<String> {
        eval_node(&self.root, state, env, params)
    }

    pub(crate) fn is_aggregate(&self) -> bool {
        node_is_aggregate(&self.root)
    }

    /// Nodes of the top-level list, head included; empty for plain atoms.
    pub(crate) fn atoms(&self) -> &[Node] {
        match &self.root {
            Node::List { atoms, .. } => atoms,
            _ => &[],
        }
    }
}

/// Aggregate detection for select-list items; only parenthesized
/// expressions count, bare column references never do.
pub(crate) fn node_is_list_aggregate(node: &Node) -> bool {
    matches!(node, Node::List { .. }) && node_is_aggregate(node)
}

fn node_is_aggregate(node: &Node) -> bool {
    match node {
        Node::Symbol(Symbol {
            kind: SymbolKind::Builtin(b),
        }) => b.is_aggregate(),
        Node::List { atoms, .. } => atoms.iter().any(node_is_aggregate),
        _ => false,
    }
}

fn emit_literal(value: Value, params: &mut Vec<Value>) -> String {
    match value {
        Value::Array(items) => {
            let placeholders: Vec<&str> = items.iter().map(|_| "%s").collect();
            params.extend(items);
            placeholders.join(", ")
        }
        v => {
            params.push(v);
            "%s".to_string()
        }
    }
}

fn eval_node(
    node: &Node,
    state: &mut EvalState,
    env: &EvalEnv,
    params: &mut Vec<Value>,
) -> Result<String> {
    match node {
        Node::Str(s) => Ok(emit_literal(Value::Str(s.clone()), params)),
        Node::Int(i) => Ok(emit_literal(Value::Int(*i), params)),
        Node::Float(f) => Ok(emit_literal(Value::Float(*f), params)),
        Node::Param(p) => {
            let value = p.resolve(state, env)?;
            Ok(emit_literal(value, params))
        }
        Node::Symbol(sym) => Ok(sym.sql()),
        Node::List {
            exp,
            atoms,
            sub_select,
        } => {
            if atoms.is_empty() {
                return Err(Error::expr("unexpected EOF while reading"));
            }
            if *sub_select {
                let mut parts = Vec::new();
                for atom in &atoms[1..] {
                    parts.push(eval_node(atom, state, env, params)?);
                }
                let select = parts.first().cloned().unwrap_or_default();
                let tail = parts[1..].join(" ");
                let from = format!(
                    "FROM {}",
                    crate::quote_ident(&exp.ref_set().table_alias(None))
                );
                let joins = exp.ref_set().joins_sql();
                let pieces = [select, from, joins, tail];
                return Ok(pieces
                    .iter()
                    .filter(|p| !p.is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" "));
            }
            let head = &atoms[0];
            let mut args = Vec::with_capacity(atoms.len() - 1);
            let builtin = match head {
                Node::Symbol(Symbol {
                    kind: SymbolKind::Builtin(b),
                }) => Some(*b),
                _ => None,
            };
            let head_sql = match builtin {
                Some(_) => String::new(),
                None => eval_node(head, state, env, params)?,
            };
            for atom in &atoms[1..] {
                args.push(eval_node(atom, state, env, params)?);
            }
            match builtin {
                Some(b) => b.apply(&args, env.flavor),
                // A non-operator head stands for itself (cast targets...)
                None => Ok(head_sql),
            }
        }
    }
}

struct ExpressionInner {
    table: Arc<Table>,
    registry: Registry,
    env: HashMap<String, String>,
    ref_set: ReferenceSet,
    parent: Option<Expression>,
}

/// Parsing context rooted at one table.
///
/// A single expression may parse several inputs; the joins they require
/// accumulate in the shared [`ReferenceSet`] so aliases stay consistent
/// across the select list, filters and sort keys of one statement.
#[derive(Clone)]
pub struct Expression {
    inner: Rc<ExpressionInner>,
}

impl std::fmt::Debug for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Expression {}>", self.inner.table.name)
    }
}

impl Expression {
    pub fn new(table: Arc<Table>, registry: Registry) -> Expression {
        Self::with_options(table, registry, HashMap::new(), None, None)
    }

    pub fn with_options(
        table: Arc<Table>,
        registry: Registry,
        base_env: HashMap<String, String>,
        table_aliases: Option<TableAliases>,
        parent: Option<&Expression>,
    ) -> Expression {
        let ref_set = ReferenceSet::new(
            table.clone(),
            registry.clone(),
            table_aliases,
            parent.map(|p| p.ref_set()).as_ref(),
        );
        Expression {
            inner: Rc::new(ExpressionInner {
                table,
                registry,
                env: base_env,
                ref_set,
                parent: parent.cloned(),
            }),
        }
    }

    pub fn table(&self) -> Arc<Table> {
        self.inner.table.clone()
    }

    pub fn ref_set(&self) -> ReferenceSet {
        self.inner.ref_set.clone()
    }

    pub fn parent(&self) -> Option<Expression> {
        self.inner.parent.clone()
    }

    fn env_get(&self, name: &str) -> Option<String> {
        self.inner.env.get(name).cloned()
    }

    pub fn parse(&self, input: &str) -> Result<Ast> {
        let mut tokens: VecDeque<String> = lex::tokenize(input)?.into();
        let root = self.read(&mut tokens, true, false)?;
        Ok(Ast { root })
    }

    fn read(&self, tokens: &mut VecDeque<String>, top_level: bool, first: bool) -> Result<Node> {
        let token = tokens
            .pop_front()
            .ok_or_else(|| Error::expr("unexpected EOF while reading"))?;
        if token == "(" {
            let mut exp = self.clone();
            let mut atoms = Vec::new();
            let mut sub_select = false;
            let head_is_from = match tokens.front() {
                None => return Err(Error::expr("unexpected EOF while reading")),
                Some(t) => t.eq_ignore_ascii_case("from"),
            };
            if head_is_from {
                let from_token = tokens.pop_front().expect("checked above");
                let table_name = tokens
                    .pop_front()
                    .ok_or_else(|| Error::expr("unexpected EOF while reading"))?;
                let table = self.inner.registry.get(&table_name)?;
                exp = Expression::with_options(
                    table,
                    self.inner.registry.clone(),
                    HashMap::new(),
                    None,
                    Some(self),
                );
                sub_select = true;
                atoms.push(Node::Symbol(Symbol::resolve(&from_token, &exp, true)?));
            }
            let mut first_item = true;
            loop {
                let at_close = match tokens.front() {
                    None => return Err(Error::expr("unexpected EOF while reading")),
                    Some(t) => t == ")",
                };
                if at_close {
                    break;
                }
                atoms.push(exp.read(tokens, false, first_item)?);
                first_item = false;
            }
            tokens.pop_front(); // the ')'
            if top_level && !tokens.is_empty() {
                return Err(Error::expr("Unexpected tokens after ending \")\""));
            }
            return Ok(Node::List {
                exp,
                atoms,
                sub_select,
            });
        }
        if token == ")" {
            return Err(Error::expr("unexpected )"));
        }
        if !first {
            if let Some(desc) = self.env_get(&token) {
                if desc != token && desc.starts_with('(') {
                    return Ok(self.parse(&desc)?.root);
                }
            }
        }
        self.atom(&token, first)
    }

    /// Identify a token as literal, param or symbol.
    fn atom(&self, token: &str, first: bool) -> Result<Node> {
        for quote in ['"', '\''] {
            if token.len() >= 2 && token.starts_with(quote) && token.ends_with(quote) {
                return Ok(Node::Str(token[1..token.len() - 1].to_string()));
            }
        }
        if token.len() > 1 && token.starts_with('{') && token.ends_with('}') {
            return Ok(Node::Param(ParamRef::parse(&token[1..token.len() - 1])));
        }
        if let Ok(i) = token.parse::<i64>() {
            return Ok(Node::Int(i));
        }
        if let Ok(f) = token.parse::<f64>() {
            return Ok(Node::Float(f));
        }
        Ok(Node::Symbol(Symbol::resolve(token, self, first)?))
    }

    /// Turn caller-supplied filters into WHERE chunks, ANDed together.
    pub(crate) fn build_filter_cond(&self, filters: &[&Filter]) -> Result<Vec<Chunk>> {
        let mut conds: Vec<Chunk> = Vec::new();
        let mut push = |chunk: Chunk, conds: &mut Vec<Chunk>| {
            if !conds.is_empty() {
                conds.push(Chunk::Sql("AND".to_string()));
            }
            conds.push(chunk);
        };
        for filter in filters {
            match filter {
                Filter::None => {}
                Filter::Expr(line) => {
                    let ast = self.parse(line)?;
                    push(Chunk::Ast { ast, bound: None }, &mut conds);
                }
                Filter::List(lines) => {
                    for line in lines {
                        let ast = self.parse(line)?;
                        push(Chunk::Ast { ast, bound: None }, &mut conds);
                    }
                }
                Filter::Map(entries) => {
                    for (field, value) in entries {
                        let ast = self.parse(&format!("(= {field} {{}})"))?;
                        push(
                            Chunk::Ast {
                                ast,
                                bound: Some(vec![value.clone()]),
                            },
                            &mut conds,
                        );
                    }
                }
            }
        }
        Ok(conds)
    }
}

/// Row filters, as accepted by the read, write and delete entry points.
#[derive(Debug, Clone, Default)]
pub enum Filter {
    #[default]
    None,
    /// A single expression line
    Expr(String),
    /// Several lines, ANDed
    List(Vec<String>),
    /// Field → value equalities, ANDed
    Map(Vec<(String, Value)>),
}

impl Filter {
    pub fn is_none(&self) -> bool {
        matches!(self, Filter::None)
    }

    pub(crate) fn from_lines(lines: &[String]) -> Filter {
        if lines.is_empty() {
            Filter::None
        } else {
            Filter::List(lines.to_vec())
        }
    }
}

impl From<&str> for Filter {
    fn from(s: &str) -> Filter {
        Filter::Expr(s.to_string())
    }
}

impl From<String> for Filter {
    fn from(s: String) -> Filter {
        Filter::Expr(s)
    }
}

impl From<Vec<String>> for Filter {
    fn from(v: Vec<String>) -> Filter {
        Filter::List(v)
    }
}

impl From<Vec<&str>> for Filter {
    fn from(v: Vec<&str>) -> Filter {
        Filter::List(v.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Filter {
    fn from(v: [&str; N]) -> Filter {
        Filter::List(v.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<(String, Value)>> for Filter {
    fn from(v: Vec<(String, Value)>) -> Filter {
        Filter::Map(v)
    }
}

/// Query arguments bound to `{}` / `{n}` / `{name}` parameters.
#[derive(Debug, Clone, Default)]
pub enum Args {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(HashMap<String, Value>),
}

impl Args {
    pub fn positional<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Args {
        Args::Positional(items.into_iter().map(Into::into).collect())
    }

    pub fn named<T: Into<Value>>(items: impl IntoIterator<Item = (&'static str, T)>) -> Args {
        Args::Named(
            items
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        )
    }

    pub(crate) fn named_map(&self) -> HashMap<String, Value> {
        match self {
            Args::Named(map) => map.clone(),
            _ => HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::sample_registry;

    fn expression(table: &str) -> Expression {
        let registry = sample_registry();
        Expression::new(registry.get(table).unwrap(), registry)
    }

    fn eval(exp: &Expression, input: &str) -> (String, Vec<Value>) {
        let ast = exp.parse(input).unwrap();
        ast.eval(&[], &HashMap::new(), Flavor::Sqlite).unwrap()
    }

    #[test]
    fn test_comparison_operators() {
        let exp = expression("member");
        for op in ["<", ">", "<=", ">=", "!="] {
            let (sql, params) = eval(&exp, &format!("({op} name \"foo\")"));
            assert_eq!(sql, format!("\"member\".\"name\" {op} %s"));
            assert_eq!(params, vec![Value::Str("foo".into())]);
        }
        let (sql, _) = eval(&exp, "(like name \"foo\")");
        assert_eq!(sql, "\"member\".\"name\" like %s");
        let (sql, _) = eval(&exp, "(is name \"foo\")");
        assert_eq!(sql, "\"member\".\"name\" is %s");
        let (sql, _) = eval(&exp, "(isnot name \"foo\")");
        assert_eq!(sql, "\"member\".\"name\" is not %s");
    }

    #[test]
    fn test_cast() {
        let exp = expression("member");
        let (sql, params) = eval(&exp, "(cast id (varchar))");
        assert_eq!(sql, "CAST (\"member\".\"id\" AS varchar)");
        assert!(params.is_empty());
    }

    #[test]
    fn test_variadic_operators() {
        let exp = expression("member");
        for (op, sep) in [
            ("and", "AND"),
            ("or", "OR"),
            ("+", "+"),
            ("-", "-"),
            ("*", "*"),
            ("/", "/"),
        ] {
            let (sql, params) = eval(&exp, &format!("({op} 1 2)"));
            assert_eq!(sql, format!("(%s {sep} %s)"));
            assert_eq!(params, vec![Value::Int(1), Value::Int(2)]);

            let (sql, params) = eval(&exp, &format!("({op} 1 2 3)"));
            assert_eq!(sql, format!("(%s {sep} %s {sep} %s)"));
            assert_eq!(params.len(), 3);
        }
    }

    #[test]
    fn test_unary_minus() {
        let exp = expression("member");
        let (sql, params) = eval(&exp, "(- 5)");
        assert_eq!(sql, "- %s");
        assert_eq!(params, vec![Value::Int(5)]);
    }

    #[test]
    fn test_in_notin() {
        let exp = expression("member");
        let (sql, _) = eval(&exp, "(in name 1 2)");
        assert_eq!(sql, "\"member\".\"name\" in (%s, %s)");
        let (sql, _) = eval(&exp, "(notin name 1 2)");
        assert_eq!(sql, "\"member\".\"name\" not in (%s, %s)");
    }

    #[test]
    fn test_not() {
        let exp = expression("member");
        let (sql, _) = eval(&exp, "(not (= name 1))");
        assert_eq!(sql, "not \"member\".\"name\" = %s");
    }

    #[test]
    fn test_select() {
        let exp = expression("member");
        let (sql, params) = eval(&exp, "(select 1)");
        assert_eq!(sql, "SELECT %s");
        assert_eq!(params, vec![Value::Int(1)]);
    }

    #[test]
    fn test_sub_select() {
        let exp = expression("team");
        let (sql, params) = eval(&exp, "(FROM member (SELECT id name _parent.name))");
        assert_eq!(
            sql,
            "SELECT \"member\".\"id\", \"member\".\"name\", \"team\".\"name\" FROM \"member\""
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_join_aliases() {
        let exp = expression("member");
        let ast = exp.parse("(= team.name \"spam-team\")").unwrap();
        let (sql, params) = ast.eval(&[], &HashMap::new(), Flavor::Sqlite).unwrap();
        assert_eq!(sql, "\"team_0\".\"name\" = %s");
        assert_eq!(params, vec![Value::Str("spam-team".into())]);

        let (sql, _) = eval(&exp, "(= team.country.name \"BE\")");
        assert_eq!(sql, "\"country_1\".\"name\" = %s");

        let (sql, params) = eval(
            &exp,
            "(and (= team.country.name \"BE\") (= team.country.name \"BE\"))",
        );
        assert_eq!(sql, "(\"country_1\".\"name\" = %s AND \"country_1\".\"name\" = %s)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_exists_correlated() {
        let exp = expression("team");
        let (sql, params) = eval(&exp, "(exists 1)");
        assert_eq!(sql, "EXISTS (%s)");
        assert_eq!(params, vec![Value::Int(1)]);

        let (sql, params) = eval(
            &exp,
            "(and (exists (from member (select 1) (where (= team _parent.id)))) \
             (= name \"spam-team\") (= members.name \"Bob\"))",
        );
        assert_eq!(
            sql,
            "(EXISTS (SELECT %s FROM \"member\" WHERE \"member\".\"team\" = \"team\".\"id\") \
             AND \"team\".\"name\" = %s AND \"member_0\".\"name\" = %s)"
        );
        assert_eq!(
            params,
            vec![
                Value::Int(1),
                Value::Str("spam-team".into()),
                Value::Str("Bob".into())
            ]
        );
    }

    #[test]
    fn test_multi_parent() {
        let exp = expression("country");
        let (sql, params) = eval(
            &exp,
            "(from team (select country) (where (in id \
               (from member (select team) (where (= team _parent.id) \
                                                 (= name _parent._parent.name))))))",
        );
        assert_eq!(
            sql,
            "SELECT \"team\".\"country\" FROM \"team\" WHERE \"team\".\"id\" in (\
             SELECT \"member\".\"team\" FROM \"member\" \
             WHERE \"member\".\"team\" = \"team\".\"id\" \
             AND \"member\".\"name\" = \"country\".\"name\")"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_sub_expression_joins() {
        let exp = expression("team");
        let (sql, params) = eval(
            &exp,
            "(and (exists (from member (select 1) \
               (where (= team _parent.id) (= team.country.name \"BE\")))) \
             (= country.name \"BE\"))",
        );
        assert_eq!(
            sql,
            "(EXISTS (SELECT %s FROM \"member\" \
             LEFT JOIN \"team\" AS \"team_0\" ON (\"member\".\"team\" = \"team_0\".\"id\") \
             LEFT JOIN \"country\" AS \"country_1\" ON (\"team_0\".\"country\" = \"country_1\".\"id\") \
             WHERE \"member\".\"team\" = \"team\".\"id\" AND \"country_1\".\"name\" = %s) \
             AND \"country_2\".\"name\" = %s)"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_sub_select_in_filter() {
        let exp = expression("team");
        let (sql, _) = eval(
            &exp,
            "(in id (from member (select team) (where (= name \"Bob\"))))",
        );
        assert_eq!(
            sql,
            "\"team\".\"id\" in (SELECT \"member\".\"team\" FROM \"member\" \
             WHERE \"member\".\"name\" = %s)"
        );
    }

    #[test]
    fn test_field_resolution() {
        let exp = expression("team");
        assert_eq!(eval(&exp, "name").0, "\"team\".\"name\"");
        assert_eq!(eval(&exp, "country.name").0, "\"country_0\".\"name\"");
        assert_eq!(eval(&exp, "members.team.name").0, "\"team_2\".\"name\"");
        assert_eq!(eval(&exp, "members.name").0, "\"member_1\".\"name\"");
    }

    #[test]
    fn test_base_env() {
        let registry = sample_registry();
        let mut env = HashMap::new();
        env.insert(
            "created_date".to_string(),
            "(cast created_at (date))".to_string(),
        );
        let exp = Expression::with_options(
            registry.get("member").unwrap(),
            registry,
            env,
            None,
            None,
        );
        let expected = "CAST (\"member\".\"created_at\" AS date)";
        assert_eq!(eval(&exp, "(cast created_at (date))").0, expected);
        assert_eq!(eval(&exp, "created_date").0, expected);
    }

    #[test]
    fn test_table_alias_override() {
        let registry = sample_registry();
        let exp = Expression::with_options(
            registry.get("team").unwrap(),
            registry.clone(),
            HashMap::new(),
            Some(TableAliases::Root("tmp".into())),
            None,
        );
        assert_eq!(eval(&exp, "name").0, "\"tmp\".\"name\"");

        let exp = Expression::with_options(
            registry.get("team").unwrap(),
            registry.clone(),
            HashMap::new(),
            Some(TableAliases::Root("tmp".into())),
            None,
        );
        eval(&exp, "(= country.name \"foo\")");
        assert_eq!(
            exp.ref_set().get_sql_joins(),
            vec!["LEFT JOIN \"country\" AS \"country_0\" ON (\"tmp\".\"country\" = \"country_0\".\"id\")"]
        );

        let exp = Expression::with_options(
            registry.get("team").unwrap(),
            registry,
            HashMap::new(),
            Some(TableAliases::Root("tmp".into())),
            None,
        );
        eval(&exp, "(= members.name \"foo\")");
        assert_eq!(
            exp.ref_set().get_sql_joins(),
            vec!["LEFT JOIN \"member\" AS \"member_0\" ON (\"tmp\".\"id\" = \"member_0\".\"team\")"]
        );
    }

    #[test]
    fn test_param_formatting() {
        let exp = expression("team");
        let ast = exp.parse("(in {} {spam!r} {foo:>5})").unwrap();
        let mut kwargs = HashMap::new();
        kwargs.insert("spam".to_string(), Value::Str("spam".into()));
        kwargs.insert("foo".to_string(), Value::Str("foo".into()));
        let (sql, params) = ast
            .eval(&[Value::Str("ham".into())], &kwargs, Flavor::Sqlite)
            .unwrap();
        assert_eq!(sql, "%s in (%s, %s)");
        assert_eq!(
            params,
            vec![
                Value::Str("ham".into()),
                Value::Str("'spam'".into()),
                Value::Str("  foo".into())
            ]
        );
    }

    #[test]
    fn test_param_list_expansion() {
        let exp = expression("team");
        let ast = exp.parse("(in name {names})").unwrap();
        let mut kwargs = HashMap::new();
        kwargs.insert(
            "names".to_string(),
            Value::array(["Red", "Blue"]),
        );
        let (sql, params) = ast.eval(&[], &kwargs, Flavor::Sqlite).unwrap();
        assert_eq!(sql, "\"team\".\"name\" in (%s, %s)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_param_dotted_tail() {
        let exp = expression("team");
        let ast = exp.parse("(= name {data.name})").unwrap();
        let mut kwargs = HashMap::new();
        kwargs.insert(
            "data".to_string(),
            Value::Json(serde_json::json!({"name": "Red"})),
        );
        let (sql, params) = ast.eval(&[], &kwargs, Flavor::Sqlite).unwrap();
        assert_eq!(sql, "\"team\".\"name\" = %s");
        assert_eq!(params, vec![Value::Str("Red".into())]);
    }

    #[test]
    fn test_true_false_by_flavor() {
        let exp = expression("team");
        let ast = exp.parse("(true)").unwrap();
        assert_eq!(ast.eval(&[], &HashMap::new(), Flavor::Sqlite).unwrap().0, "1");
        assert_eq!(
            ast.eval(&[], &HashMap::new(), Flavor::Postgresql).unwrap().0,
            "true"
        );
    }

    #[test]
    fn test_aggregates() {
        let exp = expression("team");
        assert_eq!(eval(&exp, "(count)").0, "count(*)");
        assert_eq!(eval(&exp, "(max name)").0, "max(\"team\".\"name\")");
        assert!(exp.parse("(count)").unwrap().is_aggregate());
        assert!(exp.parse("(max (+ 1 1))").unwrap().is_aggregate());
        assert!(!exp.parse("(= name 1)").unwrap().is_aggregate());
    }

    #[test]
    fn test_parse_errors() {
        let exp = expression("team");
        let err = exp.parse("(= name \"x\"").unwrap_err();
        assert!(err.to_string().contains("unexpected EOF"));

        let err = exp.parse(")").unwrap_err();
        assert!(err.to_string().contains("unexpected )"));

        let err = exp.parse("(= name 1) spam").unwrap_err();
        assert!(err.to_string().contains("Unexpected tokens"));

        let err = exp.parse("(= zorglub 1)").unwrap_err();
        assert!(err.to_string().contains("\"zorglub\" not understood"));
    }

    #[test]
    fn test_placeholder_parity() {
        let exp = expression("member");
        let inputs = [
            "(and (= name \"a\") (in registration_code 1 2 3))",
            "(or (= team.name {0}) (= team.country.name {1}))",
            "(= name {})",
        ];
        for input in inputs {
            let ast = exp.parse(input).unwrap();
            let (sql, params) = ast
                .eval(
                    &[Value::Int(1), Value::Int(2)],
                    &HashMap::new(),
                    Flavor::Sqlite,
                )
                .unwrap();
            assert_eq!(sql.matches("%s").count(), params.len(), "{input}");
        }
    }
}
