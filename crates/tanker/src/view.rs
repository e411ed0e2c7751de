//! Views: named projections of a table, possibly traversing relations.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::context::Context;
use crate::cursor::{Chunk, Cursor, FieldMeta};
use crate::expr::{Args, Expression, Filter, Reference};
use crate::schema::{ColType, Column, Registry, Table};
use crate::value::Value;
use crate::write::{self, WriteData};
use crate::{Error, Result, quote_ident};
use std::sync::Arc;

/// What a view field binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A direct column of the table
    Column,
    /// A dotted path through one or more relations
    Path,
    /// An s-expression, evaluated per row
    Expression,
    /// A `{name}` literal bound at query time
    Alias,
}

/// One named field of a view.
#[derive(Debug, Clone)]
pub struct ViewField {
    pub name: String,
    pub desc: String,
    pub kind: FieldKind,
    /// Base column backing this field (first path segment), if any
    pub(crate) col: Option<Column>,
    pub(crate) ref_: Option<Reference>,
    /// Type the field reads as
    pub(crate) ctype: Option<ColType>,
    /// Type the field is staged as during writes
    pub(crate) ftype: Option<ColType>,
    pub(crate) array_dim: usize,
}

impl ViewField {
    fn new(name: &str, desc: &str, table: &Arc<Table>, registry: &Registry) -> Result<ViewField> {
        if desc.starts_with('(') {
            return Ok(ViewField {
                name: name.to_string(),
                desc: desc.to_string(),
                kind: FieldKind::Expression,
                col: None,
                ref_: None,
                ctype: None,
                ftype: None,
                array_dim: 0,
            });
        }
        if desc.starts_with('{') {
            return Ok(ViewField {
                name: name.to_string(),
                desc: desc.to_string(),
                kind: FieldKind::Alias,
                col: None,
                ref_: None,
                ctype: None,
                ftype: None,
                array_dim: 0,
            });
        }
        if desc.contains('.') {
            let exp = Expression::new(table.clone(), registry.clone());
            let ref_ = exp.ref_set().get_ref(desc)?;
            let remote_col = ref_.remote_table.get_column(&ref_.remote_field)?.clone();
            let head = desc.split('.').next().expect("dotted");
            let col = table.get_column(head)?.clone();
            return Ok(ViewField {
                name: name.to_string(),
                desc: desc.to_string(),
                kind: FieldKind::Path,
                col: Some(col),
                ctype: Some(remote_col.ctype),
                array_dim: remote_col.array_dim,
                ftype: Some(ColType::Integer),
                ref_: Some(ref_),
            });
        }
        let col = table.get_column(desc)?.clone();
        let (ctype, ftype) = if col.ctype == ColType::M2O {
            (ColType::Integer, ColType::Integer)
        } else {
            (col.ctype, col.ctype)
        };
        Ok(ViewField {
            name: name.to_string(),
            desc: desc.to_string(),
            kind: FieldKind::Column,
            array_dim: col.array_dim,
            col: Some(col),
            ref_: None,
            ctype: Some(ctype),
            ftype: Some(ftype),
        })
    }

    pub(crate) fn meta(&self) -> FieldMeta {
        FieldMeta {
            name: self.name.clone(),
            ctype: self.ctype,
            array_dim: self.array_dim,
        }
    }
}

/// Fields a view is built from.
#[derive(Debug, Clone)]
pub enum Fields {
    /// Every stored column, relations expanded to their natural key
    All,
    /// Field descriptors, named after themselves
    List(Vec<String>),
    /// (name, descriptor) pairs
    Pairs(Vec<(String, String)>),
}

impl From<Vec<String>> for Fields {
    fn from(v: Vec<String>) -> Fields {
        Fields::List(v)
    }
}

impl From<Vec<&str>> for Fields {
    fn from(v: Vec<&str>) -> Fields {
        Fields::List(v.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Fields {
    fn from(v: [&str; N]) -> Fields {
        Fields::List(v.into_iter().map(str::to_string).collect())
    }
}

impl From<&str> for Fields {
    fn from(v: &str) -> Fields {
        Fields::List(vec![v.to_string()])
    }
}

impl From<Vec<(&str, &str)>> for Fields {
    fn from(v: Vec<(&str, &str)>) -> Fields {
        Fields::Pairs(
            v.into_iter()
                .map(|(n, d)| (n.to_string(), d.to_string()))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Fields {
    fn from(v: [(&str, &str); N]) -> Fields {
        Fields::Pairs(
            v.into_iter()
                .map(|(n, d)| (n.to_string(), d.to_string()))
                .collect(),
        )
    }
}

pub(crate) struct FieldGroup {
    pub(crate) col: Column,
    /// Positions of the view fields backed by this column
    pub(crate) field_idx: Vec<usize>,
}

/// A view binds a table to an ordered list of named fields and carries
/// the read/write/delete entry points.
pub struct View {
    pub(crate) table: Arc<Table>,
    pub(crate) registry: Registry,
    pub fields: Vec<ViewField>,
    /// View fields grouped by their backing column
    pub(crate) field_map: IndexMap<String, FieldGroup>,
    /// Columns identifying a row: `["id"]` when the view carries it,
    /// otherwise the natural key
    pub(crate) key_cols: Vec<String>,
}

impl View {
    pub fn new(ctx: &Context, table: &str, fields: impl Into<Fields>) -> Result<View> {
        let registry = ctx.registry();
        let table = registry.get(table)?;
        let pairs: Vec<(String, String)> = match fields.into() {
            Fields::All => table
                .default_fields(&registry)?
                .into_iter()
                .map(|f| (f.clone(), f))
                .collect(),
            Fields::List(list) => list.into_iter().map(|f| (f.clone(), f)).collect(),
            Fields::Pairs(pairs) => pairs,
        };

        let mut fields = Vec::with_capacity(pairs.len());
        for (name, desc) in &pairs {
            fields.push(ViewField::new(name.trim(), desc, &table, &registry)?);
        }

        let mut field_map: IndexMap<String, FieldGroup> = IndexMap::new();
        for (idx, field) in fields.iter().enumerate() {
            let Some(col) = &field.col else { continue };
            if let Some(group) = field_map.get_mut(&col.name) {
                if !col.ctype.is_relation() {
                    return Err(Error::usage(format!(
                        "Column {} is specified several time in view",
                        col.name
                    )));
                }
                group.field_idx.push(idx);
            } else {
                field_map.insert(
                    col.name.clone(),
                    FieldGroup {
                        col: col.clone(),
                        field_idx: vec![idx],
                    },
                );
            }
        }

        let key_cols = if field_map.contains_key("id") {
            vec!["id".to_string()]
        } else {
            table.key.clone()
        };

        Ok(View {
            table,
            registry,
            fields,
            field_map,
            key_cols,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    pub fn get_field(&self, name: &str) -> Option<&ViewField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Names that do not shadow a column resolve to their descriptor
    /// inside expressions.
    pub(crate) fn base_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for field in &self.fields {
            if self.table.columns.contains_key(&field.name) {
                continue;
            }
            env.insert(field.name.clone(), field.desc.clone());
        }
        env
    }

    /// Refuse row-addressing operations unless the given columns cover the
    /// table key (or carry `id`).
    pub(crate) fn validate_key_cols(table: &Table, columns: &HashSet<String>) -> Result<()> {
        if columns.contains("id") {
            return Ok(());
        }
        let missing: Vec<&str> = table
            .key
            .iter()
            .filter(|k| !columns.contains(*k))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::usage(format!(
            "You must reference all the columns composing the table key when you want \
             to write, delete or reference rows (or pass the id column). Table is \
             \"{}\", missing columns are: {}",
            table.name,
            missing.join(",")
        )))
    }

    pub(crate) fn validate_key(&self) -> Result<()> {
        let columns: HashSet<String> = self.field_map.keys().cloned().collect();
        Self::validate_key_cols(&self.table, &columns)
    }

    /// Build and return a read cursor.
    pub fn read<'a>(&self, ctx: &'a Context, opts: ReadOptions) -> Result<Cursor<'a>> {
        let acl_filter = if opts.disable_acl {
            Filter::None
        } else {
            ctx.cfg()
                .acl_read
                .get(&self.table.name)
                .map(|lines| Filter::from_lines(lines))
                .unwrap_or_default()
        };

        let exp = Expression::with_options(
            self.table.clone(),
            self.registry.clone(),
            self.base_env(),
            None,
            None,
        );

        let statement = if opts.distinct {
            "select-distinct"
        } else {
            "select"
        };
        let descs: Vec<&str> = self.fields.iter().map(|f| f.desc.as_str()).collect();
        let select_ast = exp.parse(&format!("({statement} {})", descs.join(" ")))?;

        // Positions of aggregate fields in the select list.
        let aggregates: Vec<usize> = select_ast
            .atoms()
            .iter()
            .skip(1)
            .enumerate()
            .filter_map(|(pos, node)| {
                crate::expr::node_is_list_aggregate(node).then_some(pos)
            })
            .collect();

        let mut chunks = vec![
            Chunk::Ast {
                ast: select_ast,
                bound: None,
            },
            Chunk::sql(format!("FROM {}", quote_ident(&self.table.name))),
            Chunk::Joins(exp.ref_set()),
        ];

        let filter_chunks = exp.build_filter_cond(&[&opts.filters, &acl_filter])?;
        if !filter_chunks.is_empty() {
            chunks.push(Chunk::sql("WHERE"));
            chunks.extend(filter_chunks);
        }

        // Aggregates without an explicit grouping group by every other
        // field.
        let mut groupby = opts.groupby.clone();
        if groupby.is_empty() && !aggregates.is_empty() {
            for (pos, field) in self.fields.iter().enumerate() {
                if !aggregates.contains(&pos) {
                    groupby.push(field.desc.clone());
                }
            }
        }
        if !groupby.is_empty() {
            chunks.push(Chunk::sql("GROUP BY"));
            for (i, item) in groupby.iter().enumerate() {
                if i > 0 {
                    chunks.push(Chunk::sql(","));
                }
                chunks.push(Chunk::Ast {
                    ast: exp.parse(item)?,
                    bound: None,
                });
            }
        }

        if !opts.order.is_empty() {
            chunks.push(Chunk::sql("ORDER BY"));
            for (i, item) in opts.order.iter().enumerate() {
                if i > 0 {
                    chunks.push(Chunk::sql(","));
                }
                chunks.push(Chunk::Ast {
                    ast: exp.parse(&item.expr)?,
                    bound: None,
                });
                if let Some(dir) = &item.dir {
                    let dir = dir.to_ascii_uppercase();
                    if dir != "ASC" && dir != "DESC" {
                        return Err(Error::usage(format!(
                            "Unexpected value \"{dir}\" for sort direction"
                        )));
                    }
                    chunks.push(Chunk::sql(dir));
                }
            }
        }

        if let Some(limit) = opts.limit {
            chunks.push(Chunk::sql(format!("LIMIT {limit}")));
        }
        if let Some(offset) = opts.offset {
            chunks.push(Chunk::sql(format!("OFFSET {offset}")));
        }

        let metas = self.fields.iter().map(ViewField::meta).collect();
        Ok(Cursor::new(ctx, chunks, opts.args, metas))
    }

    /// Delete rows matching `data` (by key columns) or `filters`, exactly
    /// one of them. `swap` inverts the data match. Without either, the
    /// whole table is emptied.
    pub fn delete(&self, ctx: &Context, opts: DeleteOptions) -> Result<usize> {
        self.validate_key()?;
        let has_data = opts.data.is_some();
        let has_filters = !opts.filters.is_none();
        if !has_data && !has_filters {
            return ctx.execute(&format!("DELETE FROM {}", quote_ident(&self.table.name)), &[]);
        }
        if has_data && has_filters {
            return Err(Error::usage("Deletion by both data and filter not supported"));
        }

        let main = quote_ident(&self.table.name);
        let op = if opts.swap { "NOT IN" } else { "IN" };

        if let Some(data) = opts.data {
            let columns = data.into_columns(&self.fields)?;
            let formatted = write::format_data(self, ctx, columns)?;
            let staging = write::Staging::create(self, ctx, &formatted)?;
            let sql = format!(
                "DELETE FROM {main} WHERE id {op} (SELECT {main}.id FROM {main} \
                 INNER JOIN {tmp} on {cond})",
                tmp = quote_ident(staging.tmp_table()),
                cond = staging.join_cond().join(" AND "),
            );
            let deleted = ctx.execute(&sql, &[]);
            staging.drop(ctx)?;
            return deleted;
        }

        let exp = Expression::with_options(
            self.table.clone(),
            self.registry.clone(),
            self.base_env(),
            None,
            None,
        );
        let filter_chunks = exp.build_filter_cond(&[&opts.filters])?;
        let mut chunks = vec![
            Chunk::sql(format!(
                "DELETE FROM {main} WHERE id {op} (SELECT {main}.id FROM {main}"
            )),
            Chunk::Joins(exp.ref_set()),
        ];
        if !filter_chunks.is_empty() {
            chunks.push(Chunk::sql("WHERE"));
            chunks.extend(filter_chunks);
        }
        chunks.push(Chunk::sql(")"));
        Cursor::new(ctx, chunks, opts.args, Vec::new()).execute()
    }
}

/// One ORDER BY item: a field descriptor or expression, with an optional
/// direction.
#[derive(Debug, Clone)]
pub struct OrderItem {
    pub expr: String,
    pub dir: Option<String>,
}

impl From<&str> for OrderItem {
    fn from(s: &str) -> OrderItem {
        OrderItem {
            expr: s.to_string(),
            dir: None,
        }
    }
}

impl From<(&str, &str)> for OrderItem {
    fn from((expr, dir): (&str, &str)) -> OrderItem {
        OrderItem {
            expr: expr.to_string(),
            dir: Some(dir.to_string()),
        }
    }
}

/// Options accepted by [`View::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub filters: Filter,
    pub args: Args,
    pub order: Vec<OrderItem>,
    pub groupby: Vec<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub distinct: bool,
    pub disable_acl: bool,
}

impl ReadOptions {
    pub fn new() -> ReadOptions {
        ReadOptions::default()
    }

    pub fn filters(mut self, filters: impl Into<Filter>) -> Self {
        self.filters = filters.into();
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    pub fn order(mut self, item: impl Into<OrderItem>) -> Self {
        self.order.push(item.into());
        self
    }

    pub fn groupby(mut self, item: impl Into<String>) -> Self {
        self.groupby.push(item.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn disable_acl(mut self) -> Self {
        self.disable_acl = true;
        self
    }
}

/// Options accepted by [`View::delete`].
#[derive(Default)]
pub struct DeleteOptions {
    pub filters: Filter,
    pub data: Option<WriteData>,
    pub args: Args,
    pub swap: bool,
}

impl DeleteOptions {
    pub fn new() -> DeleteOptions {
        DeleteOptions::default()
    }

    pub fn filters(mut self, filters: impl Into<Filter>) -> Self {
        self.filters = filters.into();
        self
    }

    pub fn data(mut self, data: impl Into<WriteData>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    pub fn swap(mut self) -> Self {
        self.swap = true;
        self
    }
}

/// Read one row of `table` as a field → value map.
pub fn fetch(
    ctx: &Context,
    table: &str,
    filter_by: Vec<(String, Value)>,
) -> Result<Option<IndexMap<String, Value>>> {
    let registry = ctx.registry();
    let tbl = registry.get(table)?;
    let mut fields: Vec<String> = vec!["id".to_string()];
    fields.extend(tbl.own_columns().map(|c| c.name.clone()));
    let view = View::new(ctx, table, Fields::List(fields))?;
    let rows = view
        .read(ctx, ReadOptions::new().filters(Filter::Map(filter_by)))?
        .dicts()?;
    Ok(rows.into_iter().next())
}

/// Write one field → value record into `table`.
pub fn save(ctx: &Context, table: &str, data: IndexMap<String, Value>) -> Result<()> {
    let fields: Vec<String> = data.keys().cloned().collect();
    let view = View::new(ctx, table, Fields::List(fields))?;
    let row: Vec<Value> = data.into_values().collect();
    view.write(ctx, vec![row], crate::write::WriteOptions::new())?;
    Ok(())
}

/// Enumerate the relation paths linking `src` to `dest`, shortest first.
pub fn link(ctx: &Context, src: &str, dest: &str) -> Result<Vec<Vec<Column>>> {
    let registry = ctx.registry();
    let table = registry.get(src)?;
    table.link(&registry, dest)
}
