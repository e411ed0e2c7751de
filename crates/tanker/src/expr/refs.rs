//! Dotted-path resolution and the join plan it produces.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::schema::{ColType, Column, Registry, Table};
use crate::{Error, Result, quote_ident};

/// The resolved address of a dotted field path.
#[derive(Debug, Clone)]
pub struct Reference {
    pub remote_table: Arc<Table>,
    pub remote_field: String,
    pub join_alias: String,
    pub column: Column,
}

impl Reference {
    pub fn sql(&self) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.join_alias),
            quote_ident(&self.remote_field)
        )
    }
}

/// Root-table alias override used when an expression must be evaluated
/// against another relation (the staging table during post-image checks).
#[derive(Debug, Clone)]
pub enum TableAliases {
    Root(String),
    /// Per-column mapping; unmapped columns keep the table name.
    PerColumn(HashMap<String, String>),
}

type JoinKey = (String, String, String, String);

#[derive(Debug)]
struct RefSetInner {
    table: Arc<Table>,
    registry: Registry,
    aliases: Option<TableAliases>,
    joins: IndexMap<JoinKey, String>,
    parent: Option<ReferenceSet>,
    children: Vec<ReferenceSet>,
}

/// The join plan owned by one expression tree.
///
/// Joins are deduplicated on the `(left_table, right_table, left_col,
/// right_col)` tuple and keep insertion order in the emitted SQL. Alias
/// numbering is global across parent and child expressions so nested
/// sub-selects never collide.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    inner: Rc<RefCell<RefSetInner>>,
}

impl ReferenceSet {
    pub fn new(
        table: Arc<Table>,
        registry: Registry,
        aliases: Option<TableAliases>,
        parent: Option<&ReferenceSet>,
    ) -> ReferenceSet {
        let rs = ReferenceSet {
            inner: Rc::new(RefCell::new(RefSetInner {
                table,
                registry,
                aliases,
                joins: IndexMap::new(),
                parent: parent.cloned(),
                children: Vec::new(),
            })),
        };
        if let Some(parent) = parent {
            parent.inner.borrow_mut().children.push(rs.clone());
        }
        rs
    }

    pub fn table(&self) -> Arc<Table> {
        self.inner.borrow().table.clone()
    }

    /// Which alias stands for the root table when `column` is referenced.
    pub fn table_alias(&self, column: Option<&str>) -> String {
        let inner = self.inner.borrow();
        match (&inner.aliases, column) {
            (Some(TableAliases::Root(alias)), _) => alias.clone(),
            (Some(TableAliases::PerColumn(map)), Some(col)) => map
                .get(col)
                .cloned()
                .unwrap_or_else(|| inner.table.name.clone()),
            _ => inner.table.name.clone(),
        }
    }

    pub fn add(&self, desc: &str) -> Result<Reference> {
        self.get_ref(desc)
    }

    /// Walk a dotted path, creating joins as needed.
    pub fn get_ref(&self, desc: &str) -> Result<Reference> {
        let registry = self.inner.borrow().registry.clone();
        let mut table = self.table();
        let mut force_alias: Option<String> = None;
        let mut rest = desc;

        loop {
            let Some((head, tail)) = rest.split_once('.') else {
                let col = table.get_column(rest)?.clone();
                let alias = force_alias.unwrap_or_else(|| self.table_alias(Some(rest)));
                return Ok(Reference {
                    remote_table: table,
                    remote_field: rest.to_string(),
                    join_alias: alias,
                    column: col,
                });
            };

            let rel = table.get_column(head)?.clone();
            let foreign_table = rel.get_foreign_table(&registry)?;
            let left_table = force_alias.unwrap_or_else(|| self.table_alias(Some(head)));
            let right_table = foreign_table.name.clone();

            let (left_col, right_col) = if rel.ctype == ColType::M2O {
                (
                    head.to_string(),
                    rel.foreign_col.clone().ok_or_else(|| {
                        Error::schema(format!("column \"{head}\" lacks a foreign column"))
                    })?,
                )
            } else {
                // o2m: the remote fk column points back at one of ours.
                let fk = rel.foreign_col.clone().ok_or_else(|| {
                    Error::schema(format!("column \"{head}\" lacks a foreign column"))
                })?;
                let left = foreign_table
                    .get_column(&fk)?
                    .foreign_col
                    .clone()
                    .ok_or_else(|| {
                        Error::schema(format!(
                            "column \"{fk}\" of \"{right_table}\" is not a foreign key"
                        ))
                    })?;
                (left, fk)
            };

            let key = (left_table, right_table.clone(), left_col, right_col);
            let alias = {
                let existing = self.inner.borrow().joins.get(&key).cloned();
                match existing {
                    Some(alias) => alias,
                    None => {
                        let n = self.nb_joins();
                        let alias = format!("{right_table}_{n}");
                        self.inner.borrow_mut().joins.insert(key, alias.clone());
                        alias
                    }
                }
            };

            table = foreign_table;
            force_alias = Some(alias);
            rest = tail;
        }
    }

    /// Total number of joins across the whole expression tree.
    pub fn nb_joins(&self) -> usize {
        let parent = self.inner.borrow().parent.clone();
        match parent {
            Some(parent) => parent.nb_joins(),
            None => self.count_down(),
        }
    }

    fn count_down(&self) -> usize {
        let inner = self.inner.borrow();
        let mut n = inner.joins.len();
        for child in &inner.children {
            n += child.count_down();
        }
        n
    }

    /// Emit `LEFT JOIN` clauses in insertion order.
    pub fn get_sql_joins(&self) -> Vec<String> {
        let inner = self.inner.borrow();
        inner
            .joins
            .iter()
            .map(|((left_table, right_table, left_col, right_col), alias)| {
                format!(
                    "LEFT JOIN {} AS {} ON ({}.{} = {}.{})",
                    quote_ident(right_table),
                    quote_ident(alias),
                    quote_ident(left_table),
                    quote_ident(left_col),
                    quote_ident(alias),
                    quote_ident(right_col),
                )
            })
            .collect()
    }

    pub fn joins_sql(&self) -> String {
        self.get_sql_joins().join(" ")
    }
}
