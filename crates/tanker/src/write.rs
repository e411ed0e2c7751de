//! The write pipeline: staging, foreign-key resolution, access-filter
//! purges and the final insert / update / upsert / purge application.
//!
//! Data is staged into a transient table mirroring the view's columns,
//! filtered against the pre- and post-image access rules, then applied to
//! the main table in one pass. The same staging machinery backs
//! data-driven deletes.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::cache::{FkMap, Lru, LRU_PAGE_SIZE};
use crate::context::Context;
use crate::cursor::{expand_chunks, Chunk};
use crate::expr::{Args, Expression, Filter, TableAliases};
use crate::schema::ColType;
use crate::value::Value;
use crate::view::{FieldKind, ReadOptions, View, ViewField};
use crate::{Error, Result, quote_ident};

/// Caller-supplied write input, normalized to column vectors at the
/// pipeline boundary.
pub enum WriteData {
    /// Row-major tuples, aligned with the view fields
    Rows(Vec<Vec<Value>>),
    /// One map per row, keyed by field name
    Records(Vec<HashMap<String, Value>>),
    /// One vector per field, keyed by field name
    Columns(HashMap<String, Vec<Value>>),
}

impl<T: Into<Value>> From<Vec<Vec<T>>> for WriteData {
    fn from(rows: Vec<Vec<T>>) -> WriteData {
        WriteData::Rows(
            rows.into_iter()
                .map(|row| row.into_iter().map(Into::into).collect())
                .collect(),
        )
    }
}

impl From<Vec<HashMap<String, Value>>> for WriteData {
    fn from(records: Vec<HashMap<String, Value>>) -> WriteData {
        WriteData::Records(records)
    }
}

impl From<HashMap<String, Vec<Value>>> for WriteData {
    fn from(columns: HashMap<String, Vec<Value>>) -> WriteData {
        WriteData::Columns(columns)
    }
}

impl WriteData {
    pub fn rows<R, T>(rows: R) -> WriteData
    where
        R: IntoIterator,
        R::Item: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        WriteData::Rows(
            rows.into_iter()
                .map(|row| row.into_iter().map(Into::into).collect())
                .collect(),
        )
    }

    /// Transpose into one vector per view field.
    pub(crate) fn into_columns(self, fields: &[ViewField]) -> Result<Vec<Vec<Value>>> {
        match self {
            WriteData::Rows(rows) => {
                let mut columns: Vec<Vec<Value>> =
                    fields.iter().map(|_| Vec::with_capacity(rows.len())).collect();
                for row in rows {
                    if row.len() != fields.len() {
                        return Err(Error::usage(format!(
                            "Expected {} values per row, got {}",
                            fields.len(),
                            row.len()
                        )));
                    }
                    for (slot, value) in columns.iter_mut().zip(row) {
                        slot.push(value);
                    }
                }
                Ok(columns)
            }
            WriteData::Records(records) => Ok(fields
                .iter()
                .map(|f| {
                    records
                        .iter()
                        .map(|r| r.get(&f.name).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect()),
            WriteData::Columns(mut columns) => {
                let mut out = Vec::with_capacity(fields.len());
                let mut len = None;
                for field in fields {
                    let col = columns.remove(&field.name).ok_or_else(|| {
                        Error::usage(format!("Missing column \"{}\" in data", field.name))
                    })?;
                    if let Some(len) = len {
                        if col.len() != len {
                            return Err(Error::usage("Uneven column lengths in data"));
                        }
                    }
                    len = Some(col.len());
                    out.push(col);
                }
                Ok(out)
            }
        }
    }
}

/// Options accepted by [`View::write`].
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub insert: bool,
    pub update: bool,
    pub purge: bool,
    pub filters: Filter,
    pub disable_acl: bool,
    pub args: Args,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            insert: true,
            update: true,
            purge: false,
            filters: Filter::None,
            disable_acl: false,
            args: Args::None,
        }
    }
}

impl WriteOptions {
    pub fn new() -> WriteOptions {
        WriteOptions::default()
    }

    pub fn insert(mut self, insert: bool) -> Self {
        self.insert = insert;
        self
    }

    pub fn update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    pub fn purge(mut self) -> Self {
        self.purge = true;
        self
    }

    pub fn filters(mut self, filters: impl Into<Filter>) -> Self {
        self.filters = filters.into();
        self
    }

    pub fn disable_acl(mut self) -> Self {
        self.disable_acl = true;
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }
}

/// Outcome of a write: rows rejected by access filters and rows purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteResult {
    pub filtered: usize,
    pub deleted: usize,
}

/// The transient table a batch is loaded into before being applied.
pub(crate) struct Staging {
    tmp_table: String,
    join_cond: Vec<String>,
}

impl Staging {
    pub(crate) fn create(
        view: &View,
        ctx: &Context,
        data: &IndexMap<String, Vec<Value>>,
    ) -> Result<Staging> {
        let flavor = ctx.flavor();
        let tmp_table = if flavor.temp_tables_supported() {
            "tmp".to_string()
        } else {
            format!("tmp_{}", uuid::Uuid::new_v4().simple())
        };

        let extra_id = !view.field_map.contains_key("id");
        let mut col_defs = Vec::with_capacity(view.field_map.len() + 1);
        for (name, group) in &view.field_map {
            let field = &view.fields[group.field_idx[0]];
            let mut ty = field.ftype.unwrap_or(ColType::Varchar).sql_name().to_string();
            if field.kind == FieldKind::Column {
                for _ in 0..field.array_dim {
                    ty.push_str("[]");
                }
            }
            let not_null = if view.table.key.contains(name) {
                " NOT NULL"
            } else {
                ""
            };
            col_defs.push(format!("{} {ty}{not_null}", quote_ident(name)));
        }
        if extra_id {
            let id_def = match flavor {
                crate::backend::Flavor::Sqlite => "id INTEGER PRIMARY KEY",
                _ => "id SERIAL PRIMARY KEY",
            };
            col_defs.push(id_def.to_string());
        }

        let create = if flavor.temp_tables_supported() {
            "CREATE TEMPORARY TABLE"
        } else {
            "CREATE TABLE"
        };
        ctx.execute(
            &format!("{create} {} ({})", quote_ident(&tmp_table), col_defs.join(", ")),
            &[],
        )?;

        let staging = Staging {
            join_cond: view
                .key_cols
                .iter()
                .map(|k| {
                    format!(
                        "{}.{} = {}.{}",
                        quote_ident(&tmp_table),
                        quote_ident(k),
                        quote_ident(&view.table.name),
                        quote_ident(k)
                    )
                })
                .collect(),
            tmp_table,
        };
        staging.fill(view, ctx, data)?;
        Ok(staging)
    }

    fn fill(&self, view: &View, ctx: &Context, data: &IndexMap<String, Vec<Value>>) -> Result<()> {
        let nb_rows = data.values().next().map_or(0, Vec::len);
        if nb_rows == 0 {
            return Ok(());
        }
        let columns: Vec<&String> = data.keys().collect();
        let rows = (0..nb_rows).map(|i| {
            data.values()
                .map(|col| col.get(i).cloned().unwrap_or(Value::Null))
                .collect::<Vec<Value>>()
        });

        let flavor = ctx.flavor();
        if flavor.copy_supported() {
            let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
            ctx.copy_load(&self.tmp_table, &col_list, rows)
        } else if flavor == crate::backend::Flavor::Sqlite {
            let placeholders: Vec<&str> = columns.iter().map(|_| "%s").collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&self.tmp_table),
                columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", "),
                placeholders.join(", ")
            );
            ctx.executemany(&sql, rows)
        } else {
            // No copy channel: interpolate literals client-side, by batch.
            let head = format!(
                "INSERT INTO {} ({}) VALUES ",
                quote_ident(&self.tmp_table),
                columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let rows: Vec<Vec<Value>> = rows.collect();
            for batch in rows.chunks(500) {
                let tuples: Vec<String> = batch
                    .iter()
                    .map(|row| {
                        let cells: Vec<String> =
                            row.iter().map(Value::sql_literal).collect();
                        format!("({})", cells.join(", "))
                    })
                    .collect();
                ctx.execute(&format!("{head}{}", tuples.join(", ")), &[])?;
            }
            Ok(())
        }
    }

    pub(crate) fn tmp_table(&self) -> &str {
        &self.tmp_table
    }

    pub(crate) fn join_cond(&self) -> &[String] {
        &self.join_cond
    }

    pub(crate) fn drop(&self, ctx: &Context) -> Result<()> {
        ctx.execute(&format!("DROP TABLE {}", quote_ident(&self.tmp_table)), &[])?;
        Ok(())
    }
}

/// Coerce the column vectors and resolve foreign keys, yielding the
/// staging columns in field-map order.
pub(crate) fn format_data(
    view: &View,
    ctx: &Context,
    columns: Vec<Vec<Value>>,
) -> Result<IndexMap<String, Vec<Value>>> {
    let encoding = ctx.cfg().encoding.clone();
    let mut out = IndexMap::with_capacity(view.field_map.len());
    for (col_name, group) in &view.field_map {
        let formatted = if group.col.ctype == ColType::M2O {
            let fields: Vec<&ViewField> =
                group.field_idx.iter().map(|&i| &view.fields[i]).collect();
            if fields.len() == 1 && fields[0].ref_.is_none() {
                // Direct update of the fk by id.
                group
                    .col
                    .format(columns[group.field_idx[0]].clone(), &encoding)?
            } else {
                let mut field_values = Vec::with_capacity(fields.len());
                for (&idx, field) in group.field_idx.iter().zip(&fields) {
                    let astype = field.ctype.unwrap_or(ColType::Varchar);
                    field_values.push(group.col.format_as(
                        columns[idx].clone(),
                        astype,
                        field.array_dim,
                        &encoding,
                    )?);
                }
                resolve_fk(ctx, &fields, field_values)?
            }
        } else {
            group.col.format(columns[group.field_idx[0]].clone(), &encoding)?
        };
        out.insert(col_name.clone(), formatted);
    }
    Ok(out)
}

fn all_null(row: &[Value]) -> bool {
    row.iter().all(Value::is_null)
}

fn value_repr(v: &Value) -> String {
    match v {
        Value::Str(s) => format!("'{s}'"),
        other => other.literal_text(),
    }
}

fn pop_id(mut row: Vec<Value>) -> Result<(Vec<Value>, i64)> {
    match row.pop() {
        Some(Value::Int(id)) => Ok((row, id)),
        other => Err(Error::schema(format!(
            "unexpected id value in foreign-key lookup: {other:?}"
        ))),
    }
}

/// Resolve natural-key tuples into foreign-key ids, through the
/// per-context cache. Output ids align positionally with the input.
fn resolve_fk(
    ctx: &Context,
    fields: &[&ViewField],
    values: Vec<Vec<Value>>,
) -> Result<Vec<Value>> {
    let remote_table = fields[0]
        .col
        .as_ref()
        .and_then(|c| c.foreign_table.clone())
        .ok_or_else(|| Error::schema("foreign-key resolution on a non-relation column"))?;
    let read_fields: Vec<String> = fields
        .iter()
        .map(|f| {
            f.desc
                .split_once('.')
                .map(|(_, tail)| tail.to_string())
                .unwrap_or_else(|| f.desc.clone())
        })
        .collect();
    let cache_key = (
        remote_table.clone(),
        fields.iter().map(|f| f.desc.clone()).collect::<Vec<_>>(),
    );

    let mut lookup_fields = read_fields.clone();
    lookup_fields.push("id".to_string());
    let lookup = View::new(ctx, &remote_table, crate::view::Fields::List(lookup_fields))?;
    if !read_fields.iter().any(|f| f == "id") {
        // The natural key must be covered for a one-to-one mapping.
        let columns: HashSet<String> = lookup
            .field_map
            .keys()
            .filter(|c| c.as_str() != "id")
            .cloned()
            .collect();
        View::validate_key_cols(&lookup.table, &columns)?;
    }

    let mut mapping = match ctx.fk_cache_take(&cache_key) {
        Some(mapping) => mapping,
        None => {
            let rows = lookup
                .read(
                    ctx,
                    ReadOptions::new()
                        .disable_acl()
                        .order(("id", "desc"))
                        .limit(LRU_PAGE_SIZE as i64),
                )?
                .all()?;
            let mut map = HashMap::with_capacity(rows.len());
            for row in rows {
                let (key, id) = pop_id(row)?;
                map.insert(key, id);
            }
            if map.len() == LRU_PAGE_SIZE {
                FkMap::Lru(Lru::new(map))
            } else {
                FkMap::Plain(map)
            }
        }
    };

    let nb_rows = values.first().map_or(0, Vec::len);
    let rows: Vec<Vec<Value>> = (0..nb_rows)
        .map(|i| values.iter().map(|col| col[i].clone()).collect())
        .collect();

    let mut out = Vec::with_capacity(nb_rows);
    let fetch_missing = matches!(mapping, FkMap::Lru(_));
    if fetch_missing {
        for page in rows.chunks(LRU_PAGE_SIZE) {
            let mut missing: Vec<&Vec<Value>> = Vec::new();
            let mut seen = HashSet::new();
            for row in page {
                if !all_null(row) && !mapping.contains(row) && seen.insert(row.clone()) {
                    missing.push(row);
                }
            }
            if !missing.is_empty() {
                let base = format!(
                    "(AND {})",
                    read_fields
                        .iter()
                        .map(|f| format!("(= {f} {{}})"))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
                let fltr = format!("(OR {})", vec![base; missing.len()].join(" "));
                let args: Vec<Value> = missing.iter().flat_map(|r| r.iter().cloned()).collect();
                let fetched = lookup
                    .read(
                        ctx,
                        ReadOptions::new()
                            .filters(fltr.as_str())
                            .args(Args::Positional(args))
                            .disable_acl(),
                    )?
                    .all()?;
                for row in fetched {
                    let (key, id) = pop_id(row)?;
                    mapping.set(key, id);
                }
            }
            for row in page {
                out.push(emit_fk(&mut mapping, row, &remote_table)?);
            }
        }
    } else {
        for row in &rows {
            out.push(emit_fk(&mut mapping, row, &remote_table)?);
        }
    }

    ctx.fk_cache_put(cache_key, mapping);
    Ok(out)
}

fn emit_fk(mapping: &mut FkMap, row: &Vec<Value>, remote_table: &str) -> Result<Value> {
    if all_null(row) {
        return Ok(Value::Null);
    }
    match mapping.get(row) {
        Some(id) => Ok(Value::Int(id)),
        None => Err(Error::Resolution {
            values: row.iter().map(value_repr).collect::<Vec<_>>().join(", "),
            table: remote_table.to_string(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PurgeKind {
    /// Drop staged rows whose existing image fails the filter
    Old,
    /// Drop staged rows whose proposed image fails the filter
    New,
    /// Drop main-table rows absent from staging (and matching the filter)
    Purge,
}

/// Filter-driven deletion used on both sides of the staging join.
pub(crate) fn purge(
    view: &View,
    ctx: &Context,
    staging: &Staging,
    filters: &[&Filter],
    kind: PurgeKind,
    args: &Args,
) -> Result<usize> {
    let aliases = match kind {
        // Evaluate the proposed values from staging, not the old image.
        PurgeKind::New => Some(TableAliases::PerColumn(
            view.field_map
                .keys()
                .map(|c| (c.clone(), staging.tmp_table().to_string()))
                .collect(),
        )),
        _ => None,
    };
    let exp = Expression::with_options(
        view.table.clone(),
        view.registry.clone(),
        view.base_env(),
        aliases,
        None,
    );
    let filter_chunks = exp.build_filter_cond(filters)?;
    if filter_chunks.is_empty() && kind != PurgeKind::Purge {
        return Ok(0);
    }

    let main = quote_ident(&view.table.name);
    let tmp = quote_ident(staging.tmp_table());
    let (target, other, join_kw) = match kind {
        PurgeKind::Old => (&tmp, &main, "INNER"),
        PurgeKind::New => (&tmp, &main, "LEFT"),
        PurgeKind::Purge => (&main, &tmp, "LEFT"),
    };

    let mut chunks = vec![
        Chunk::sql(format!(
            "DELETE FROM {target} WHERE id IN ( SELECT {target}.id FROM {target}"
        )),
        Chunk::sql(format!(
            "{join_kw} JOIN {other} on ({})",
            staging.join_cond().join(" AND ")
        )),
        Chunk::Joins(exp.ref_set()),
    ];
    match kind {
        PurgeKind::Purge => {
            let absent = format!("{tmp}.{} IS NULL", quote_ident(&view.key_cols[0]));
            if filter_chunks.is_empty() {
                chunks.push(Chunk::sql(format!("WHERE {absent}")));
            } else {
                chunks.push(Chunk::sql("WHERE"));
                chunks.extend(filter_chunks);
                chunks.push(Chunk::sql(format!("AND {absent}")));
            }
        }
        _ => {
            chunks.push(Chunk::sql("WHERE NOT ("));
            chunks.extend(filter_chunks);
            chunks.push(Chunk::sql(")"));
        }
    }
    chunks.push(Chunk::sql(")"));

    let named = ctx.eval_named(args);
    let (sql, params) = expand_chunks(&chunks, args, &named, ctx.flavor())?;
    ctx.execute(&sql, &params)
}

fn tmp_fields_sql(view: &View, tmp: &str) -> String {
    view.field_map
        .keys()
        .map(|c| format!("{}.{}", quote_ident(tmp), quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn main_fields_sql(view: &View) -> String {
    view.field_map
        .keys()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Single-statement upsert on backends with conflict handling.
fn apply_upsert(
    view: &View,
    ctx: &Context,
    staging: &Staging,
    insert: bool,
    update: bool,
) -> Result<()> {
    let main = quote_ident(&view.table.name);
    let tmp = quote_ident(staging.tmp_table());
    let upd_fields: Vec<String> = view
        .field_map
        .keys()
        .filter(|c| !view.key_cols.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();
    let conflict = view
        .key_cols
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "INSERT INTO {main} ({}) SELECT {} FROM {tmp} {} JOIN {main} ON ( {} ) ",
        main_fields_sql(view),
        tmp_fields_sql(view, staging.tmp_table()),
        if insert { "LEFT" } else { "INNER" },
        staging.join_cond().join(" AND "),
    );
    if update && !upd_fields.is_empty() {
        sql.push_str(&format!(
            "ON CONFLICT ({conflict}) DO UPDATE SET {}",
            upd_fields.join(", ")
        ));
    } else {
        sql.push_str(&format!("ON CONFLICT ({conflict}) DO NOTHING"));
    }
    ctx.execute(&sql, &[])?;
    Ok(())
}

/// Insert-only half of the legacy two-statement path.
fn apply_insert(view: &View, ctx: &Context, staging: &Staging) -> Result<usize> {
    let main = quote_ident(&view.table.name);
    let tmp = quote_ident(staging.tmp_table());
    let where_cond: Vec<String> = view
        .key_cols
        .iter()
        .map(|k| format!("{main}.{} IS NULL", quote_ident(k)))
        .collect();
    let sql = format!(
        "INSERT INTO {main} ({}) SELECT {} FROM {tmp} LEFT JOIN {main} ON ( {} ) WHERE {}",
        main_fields_sql(view),
        tmp_fields_sql(view, staging.tmp_table()),
        staging.join_cond().join(" AND "),
        where_cond.join(" AND "),
    );
    ctx.execute(&sql, &[])
}

/// Correlated-update half of the legacy two-statement path.
fn apply_update(view: &View, ctx: &Context, staging: &Staging) -> Result<usize> {
    let update_cols: Vec<&String> = view
        .field_map
        .keys()
        .filter(|c| !view.key_cols.contains(c))
        .collect();
    if update_cols.is_empty() {
        return Ok(0);
    }
    let main = quote_ident(&view.table.name);
    let tmp = quote_ident(staging.tmp_table());
    let sets: Vec<String> = update_cols
        .iter()
        .map(|c| format!("{} = {tmp}.{}", quote_ident(c), quote_ident(c)))
        .collect();
    let sql = format!(
        "UPDATE {main} SET {} FROM {tmp} WHERE {}",
        sets.join(", "),
        staging.join_cond().join(" AND "),
    );
    ctx.execute(&sql, &[])
}

/// Embedded-engine apply: `INSERT OR REPLACE`, joining the existing row
/// so columns outside the view survive the replacement.
fn apply_replace(
    view: &View,
    ctx: &Context,
    staging: &Staging,
    insert: bool,
    update: bool,
) -> Result<()> {
    let main = quote_ident(&view.table.name);
    let tmp = quote_ident(staging.tmp_table());

    let mut columns: Vec<String> = vec!["id".to_string()];
    columns.extend(view.table.own_columns().map(|c| c.name.clone()));
    let select: Vec<String> = columns
        .iter()
        .map(|c| {
            if view.field_map.contains_key(c) {
                format!("{tmp}.{}", quote_ident(c))
            } else {
                format!("{main}.{}", quote_ident(c))
            }
        })
        .collect();

    let verb = if update {
        "INSERT OR REPLACE"
    } else {
        "INSERT OR IGNORE"
    };
    let join = if insert { "LEFT" } else { "INNER" };
    let sql = format!(
        "{verb} INTO {main} ({}) SELECT {} FROM {tmp} {join} JOIN {main} ON ( {} )",
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        select.join(", "),
        staging.join_cond().join(" AND "),
    );
    ctx.execute(&sql, &[])?;
    Ok(())
}

impl View {
    /// Write a batch to the view's table.
    ///
    /// With `insert` new rows are added, with `update` existing rows are
    /// refreshed, with `purge` rows absent from the batch (and matching
    /// the filters) are deleted. Rows rejected by the access filters are
    /// counted, not errors.
    pub fn write(
        &self,
        ctx: &Context,
        data: impl Into<WriteData>,
        opts: WriteOptions,
    ) -> Result<WriteResult> {
        self.validate_key()?;

        let columns = data.into().into_columns(&self.fields)?;
        let formatted = format_data(self, ctx, columns)?;

        let acl_filter = if opts.disable_acl {
            Filter::None
        } else {
            ctx.cfg()
                .acl_write
                .get(&self.table.name)
                .map(|lines| Filter::from_lines(lines))
                .unwrap_or_default()
        };

        let staging = Staging::create(self, ctx, &formatted)?;

        let mut filtered = 0;
        if !opts.filters.is_none() || !acl_filter.is_none() {
            let filters = [&opts.filters, &acl_filter];
            filtered += purge(self, ctx, &staging, &filters, PurgeKind::Old, &opts.args)?;
            filtered += purge(self, ctx, &staging, &filters, PurgeKind::New, &opts.args)?;
        }

        if opts.insert || opts.update {
            let flavor = ctx.flavor();
            if flavor == crate::backend::Flavor::Sqlite {
                apply_replace(self, ctx, &staging, opts.insert, opts.update)?;
            } else if flavor
                .upsert_supported(ctx.legacy_pg(), self.table.use_index == crate::schema::IndexKind::Brin)
            {
                apply_upsert(self, ctx, &staging, opts.insert, opts.update)?;
            } else {
                if opts.insert {
                    apply_insert(self, ctx, &staging)?;
                }
                if opts.update {
                    apply_update(self, ctx, &staging)?;
                }
            }
        }

        let mut deleted = 0;
        if opts.purge {
            let filters = [&opts.filters, &acl_filter];
            deleted = purge(self, ctx, &staging, &filters, PurgeKind::Purge, &opts.args)?;
        }

        staging.drop(ctx)?;
        ctx.invalidate_fk(&self.table.name);

        Ok(WriteResult { filtered, deleted })
    }
}
