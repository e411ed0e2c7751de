//! Database introspection: read tables, columns, indexes and constraints
//! from a live database, and optionally synthesize a plausible schema
//! from them.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::backend::Flavor;
use crate::context::Context;
use crate::schema::{KeyDef, TableDef};
use crate::value::Value;
use crate::Result;

fn as_str(v: &Value) -> String {
    match v {
        Value::Str(s) => s.clone(),
        other => other.literal_text(),
    }
}

fn as_int(v: &Value) -> i64 {
    match v {
        Value::Int(i) => *i,
        Value::Str(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Collect table, column, index and constraint names into the context.
/// With `auto`, additionally extract foreign keys and the first unique
/// index per table to build schema entries from the live database.
pub(crate) fn introspect_db(ctx: &Context, auto: bool) -> Result<Option<Vec<TableDef>>> {
    let flavor = ctx.flavor();
    let schema = ctx.pg_schema().unwrap_or_else(|| "public".to_string());

    // Tables
    let sql = match flavor {
        Flavor::Sqlite => {
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'"
                .to_string()
        }
        _ => format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{schema}'"
        ),
    };
    let table_names: Vec<String> = ctx
        .query(&sql, &[])?
        .iter()
        .map(|row| as_str(&row[0]))
        .collect();
    *ctx.db_tables.borrow_mut() = table_names.iter().cloned().collect();

    // Columns
    let mut db_columns: HashMap<String, IndexMap<String, String>> = HashMap::new();
    match flavor {
        Flavor::Sqlite => {
            for table in &table_names {
                let rows = ctx.query(&format!("PRAGMA table_info(\"{table}\")"), &[])?;
                let cols: IndexMap<String, String> = rows
                    .iter()
                    .map(|r| (as_str(&r[1]), as_str(&r[2]).to_uppercase()))
                    .collect();
                db_columns.insert(table.clone(), cols);
            }
        }
        _ => {
            let rows = ctx.query(
                "SELECT table_name, column_name, data_type \
                 FROM information_schema.columns ORDER BY table_name",
                &[],
            )?;
            for row in rows {
                db_columns
                    .entry(as_str(&row[0]))
                    .or_default()
                    .insert(as_str(&row[1]), as_str(&row[2]).to_uppercase());
            }
        }
    }
    *ctx.db_columns.borrow_mut() = db_columns.clone();

    // Indexes
    let sql = match flavor {
        Flavor::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'index'".to_string(),
        _ => format!("SELECT indexname FROM pg_indexes WHERE schemaname = '{schema}'"),
    };
    *ctx.db_indexes.borrow_mut() = ctx
        .query(&sql, &[])?
        .iter()
        .map(|row| as_str(&row[0]))
        .collect();

    // Constraints
    if flavor != Flavor::Sqlite {
        let rows = ctx.query(
            "SELECT constraint_name FROM information_schema.table_constraints",
            &[],
        )?;
        *ctx.db_constraints.borrow_mut() = rows.iter().map(|row| as_str(&row[0])).collect();
    }

    if !auto {
        return Ok(None);
    }

    // Foreign keys: (table, column) -> (remote table, remote column)
    let mut foreign_keys: HashMap<(String, String), (String, String)> = HashMap::new();
    match flavor {
        Flavor::Sqlite => {
            for table in &table_names {
                let rows = ctx.query(&format!("PRAGMA foreign_key_list(\"{table}\")"), &[])?;
                for r in rows {
                    foreign_keys.insert(
                        (table.clone(), as_str(&r[3])),
                        (as_str(&r[2]), as_str(&r[4])),
                    );
                }
            }
        }
        _ => {
            let rows = ctx.query(
                "SELECT tc.table_name, kcu.column_name, \
                        ccu.table_name AS foreign_table_name, \
                        ccu.column_name AS foreign_column_name \
                 FROM information_schema.table_constraints AS tc \
                 JOIN information_schema.key_column_usage AS kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                 JOIN information_schema.constraint_column_usage AS ccu \
                   ON ccu.constraint_name = tc.constraint_name \
                 WHERE constraint_type = 'FOREIGN KEY'",
                &[],
            )?;
            for r in rows {
                foreign_keys.insert(
                    (as_str(&r[0]), as_str(&r[1])),
                    (as_str(&r[2]), as_str(&r[3])),
                );
            }
        }
    }

    // First unique index per table gives the natural key.
    let mut keys: HashMap<String, Vec<String>> = HashMap::new();
    match flavor {
        Flavor::Sqlite => {
            for table in &table_names {
                let rows = ctx.query(&format!("PRAGMA index_list(\"{table}\")"), &[])?;
                for r in &rows {
                    let unique = as_int(&r[2]) != 0;
                    if !unique {
                        continue;
                    }
                    let idx_name = as_str(&r[1]);
                    let mut cols =
                        ctx.query(&format!("PRAGMA index_info(\"{idx_name}\")"), &[])?;
                    cols.sort_by_key(|c| as_int(&c[0]));
                    keys.insert(table.clone(), cols.iter().map(|c| as_str(&c[2])).collect());
                    break;
                }
            }
        }
        _ => {
            let rows = ctx.query(
                "SELECT t.relname AS table_name, i.relname AS index_name, \
                        a.attname AS column_name, ix.indkey AS idx_col, \
                        a.attnum AS col_pos \
                 FROM pg_class t, pg_class i, pg_index ix, pg_attribute a \
                 WHERE t.oid = ix.indrelid AND i.oid = ix.indexrelid \
                   AND a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
                   AND t.relkind = 'r' AND ix.indisunique AND NOT ix.indisprimary",
                &[],
            )?;
            // Sort by index size, then column position inside the index.
            let mut rows: Vec<(String, String, String, Vec<String>, String)> = rows
                .iter()
                .map(|r| {
                    (
                        as_str(&r[0]),
                        as_str(&r[1]),
                        as_str(&r[2]),
                        as_str(&r[3]).split_whitespace().map(str::to_string).collect(),
                        as_int(&r[4]).to_string(),
                    )
                })
                .collect();
            rows.sort_by_key(|(_, _, _, idx_cols, pos)| {
                (
                    idx_cols.len(),
                    idx_cols.iter().position(|c| c == pos).unwrap_or(usize::MAX),
                )
            });
            let mut index_by_table: HashMap<String, String> = HashMap::new();
            for (table, index_name, col_name, _, _) in rows {
                match index_by_table.get(&table) {
                    Some(known) if known != &index_name => continue,
                    _ => {}
                }
                index_by_table.insert(table.clone(), index_name);
                keys.entry(table).or_default().push(col_name);
            }
        }
    }

    let type_map: HashMap<&str, &str> = [
        ("CHARACTER VARYING", "varchar"),
        ("TIMESTAMP WITHOUT TIME ZONE", "timestamp"),
        ("TIMESTAMP WITH TIME ZONE", "timestamptz"),
        ("DOUBLE PRECISION", "float"),
        ("REAL", "float"),
        ("NUMERIC", "float"),
        ("BOOLEAN", "bool"),
        ("TEXT", "varchar"),
        ("BIGINT", "bigint"),
        ("INTEGER", "integer"),
        ("SMALLINT", "integer"),
        ("DATE", "date"),
        ("BOOL", "bool"),
        ("VARCHAR", "varchar"),
        ("TIMESTAMP", "timestamp"),
        ("TIMESTAMPTZ", "timestamptz"),
        ("FLOAT", "float"),
        ("JSONB", "jsonb"),
        ("BYTEA", "bytea"),
    ]
    .into();

    let mut defs = Vec::new();
    for table in &table_names {
        let mut columns = IndexMap::new();
        for (name, data_type) in db_columns.get(table).into_iter().flatten() {
            if let Some((remote_table, remote_col)) =
                foreign_keys.get(&(table.clone(), name.clone()))
            {
                columns.insert(name.clone(), format!("m2o {remote_table}.{remote_col}"));
            } else if let Some(ctype) = type_map.get(data_type.as_str()) {
                columns.insert(name.clone(), ctype.to_string());
            }
            // Unknown types are left out of the synthesized schema.
        }
        defs.push(TableDef {
            table: table.clone(),
            columns,
            key: Some(match keys.get(table) {
                Some(cols) if !cols.is_empty() => KeyDef::Many(cols.clone()),
                _ => KeyDef::One("id".to_string()),
            }),
            unique: Vec::new(),
            use_index: None,
            defaults: HashMap::new(),
            values: Vec::new(),
        });
    }
    Ok(Some(defs))
}
