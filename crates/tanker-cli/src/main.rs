//! Command-line front-end: read, write, delete, inspect and initialize
//! tables from a config file describing the database and its schema.

mod render;

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use serde::Deserialize;
use tanker::{
    connect, ColType, Config, Context, DeleteOptions, Fields, Filter, OrderItem, ReadOptions,
    TableDef, Value, View, WriteData, WriteOptions,
};

#[derive(Parser)]
#[command(name = "tanker", about = "Tanker CLI", disable_version_flag = true)]
struct Cli {
    /// info, read, write, delete, init or version
    action: String,

    /// Table to query, then field names
    table: Vec<String>,

    /// Config file
    #[arg(long, default_value = ".tk.yaml")]
    config: String,

    /// Database URI (overrides the config file value)
    #[arg(short = 'D', long = "db-uri")]
    db_uri: Option<String>,

    /// Limit number of results
    #[arg(short = 'l', long)]
    limit: Option<i64>,

    /// Offset results
    #[arg(short = 'o', long)]
    offset: Option<i64>,

    /// Add a filter (repeatable)
    #[arg(short = 'F', long = "filter")]
    filter: Vec<String>,

    /// Purge table after write
    #[arg(short = 'p', long)]
    purge: bool,

    /// Sort results (repeatable, "field" or "field:desc")
    #[arg(short = 's', long = "sort")]
    sort: Vec<String>,

    /// Read/write to file (instead of stdin/stdout)
    #[arg(short = 'f', long)]
    file: Option<String>,

    /// Enable YAML input/output (defaults to csv)
    #[arg(long)]
    yaml: bool,

    /// Enable ascii table output
    #[arg(short = 't', long = "ascii-table")]
    ascii_table: bool,

    /// Vertical bar plot
    #[arg(long)]
    vbar: bool,

    /// Tic character to use for plots
    #[arg(long)]
    tic: Option<String>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Hide headers
    #[arg(short = 'H', long = "hide-headers")]
    hide_headers: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    db_uri: Option<String>,
    /// Path to the schema file
    schema: Option<String>,
    encoding: Option<String>,
    #[serde(default, rename = "acl-read")]
    acl_read: HashMap<String, Vec<String>>,
    #[serde(default, rename = "acl-write")]
    acl_write: HashMap<String, Vec<String>>,
    pg_min_pool_size: Option<usize>,
    pg_max_pool_size: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.debug { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.action == "version" {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut file_cfg = FileConfig::default();
    if Path::new(&cli.config).exists() {
        file_cfg = serde_yaml::from_str(&fs::read_to_string(&cli.config)?)?;
    }

    let mut cfg = Config::new(file_cfg.db_uri.unwrap_or_default());
    if let Some(uri) = &cli.db_uri {
        cfg.db_uri = uri.clone();
    }
    if let Some(schema_path) = &file_cfg.schema {
        let raw = fs::read_to_string(shellexpand_home(schema_path))?;
        let defs: Vec<TableDef> = serde_yaml::from_str(&raw)?;
        cfg.schema = Some(defs);
    }
    if let Some(encoding) = file_cfg.encoding {
        cfg.encoding = encoding;
    }
    cfg.acl_read = file_cfg.acl_read;
    cfg.acl_write = file_cfg.acl_write;
    if let Some(n) = file_cfg.pg_min_pool_size {
        cfg.pg_min_pool_size = n;
    }
    if let Some(n) = file_cfg.pg_max_pool_size {
        cfg.pg_max_pool_size = n;
    }
    Ok(cfg)
}

fn shellexpand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}/{rest}"),
        _ => path.to_string(),
    }
}

fn run(cli: &Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cfg = load_config(cli)?;
    let mut exit = ExitCode::SUCCESS;
    connect(&cfg, |ctx| {
        exit = dispatch(cli, ctx).map_err(|e| tanker::Error::Usage(e.to_string()))?;
        Ok(())
    })?;
    Ok(exit)
}

fn dispatch(cli: &Cli, ctx: &Context) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.action.as_str() {
        "read" => action_read(cli, ctx)?,
        "write" => action_write(cli, ctx)?,
        "delete" => action_delete(cli, ctx)?,
        "info" => action_info(cli, ctx)?,
        "init" => ctx.create_tables()?,
        other => {
            eprintln!("Action \"{other}\" not supported");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn table_arg<'a>(cli: &'a Cli) -> Result<&'a str, Box<dyn std::error::Error>> {
    cli.table
        .first()
        .map(String::as_str)
        .ok_or_else(|| "Missing table argument".into())
}

fn view_fields(cli: &Cli) -> Fields {
    let fields: Vec<String> = cli.table.iter().skip(1).cloned().collect();
    if fields.is_empty() {
        Fields::All
    } else {
        Fields::List(fields)
    }
}

fn order_items(cli: &Cli) -> Vec<OrderItem> {
    cli.sort
        .iter()
        .map(|item| match item.split_once(':') {
            Some((field, dir)) => OrderItem {
                expr: field.to_string(),
                dir: Some(dir.to_string()),
            },
            None => OrderItem {
                expr: item.clone(),
                dir: None,
            },
        })
        .collect()
}

fn action_read(cli: &Cli, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let view = View::new(ctx, table_arg(cli)?, view_fields(cli))?;
    let mut opts = ReadOptions::new().filters(Filter::from(cli.filter.clone()));
    for item in order_items(cli) {
        opts = opts.order(item);
    }
    if let Some(limit) = cli.limit {
        opts = opts.limit(limit);
    }
    if let Some(offset) = cli.offset {
        opts = opts.offset(offset);
    }

    let headers: Vec<String> = view.fields.iter().map(|f| f.name.clone()).collect();
    let mut out: Box<dyn Write> = match &cli.file {
        Some(path) => Box::new(fs::File::create(path)?),
        None => Box::new(std::io::stdout()),
    };

    if cli.yaml {
        let dicts = view.read(ctx, opts)?.dicts()?;
        let docs: Vec<serde_json::Value> = dicts
            .iter()
            .map(|row| {
                serde_json::Value::Object(
                    row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
                )
            })
            .collect();
        out.write_all(serde_yaml::to_string(&docs)?.as_bytes())?;
    } else if cli.ascii_table {
        let rows: Vec<Vec<String>> = view
            .read(ctx, opts)?
            .all()?
            .iter()
            .map(|row| row.iter().map(render::render_value).collect())
            .collect();
        let headers = (!cli.hide_headers).then_some(&headers[..]);
        out.write_all(render::ascii_table(&rows, headers).as_bytes())?;
    } else if cli.vbar {
        let rows = view.read(ctx, opts)?.all()?;
        match render::vbar(&rows, 80, cli.tic.as_deref()) {
            Some(plot) => out.write_all(plot.as_bytes())?,
            None => tracing::error!("Last column must be numeric"),
        }
    } else {
        let mut writer = csv::Writer::from_writer(out);
        if !cli.hide_headers {
            writer.write_record(&headers)?;
        }
        for row in view.read(ctx, opts)?.all()? {
            writer.write_record(row.iter().map(|v| render::render_value(v)))?;
        }
        writer.flush()?;
    }
    Ok(())
}

/// Rows from the input file (or stdin), with field names taken from the
/// command line or inferred from the input itself.
fn input_data(cli: &Cli) -> Result<(Option<Vec<String>>, WriteData), Box<dyn std::error::Error>> {
    let mut raw = String::new();
    match &cli.file {
        Some(path) => {
            raw = fs::read_to_string(path)?;
        }
        None => {
            std::io::stdin().read_to_string(&mut raw)?;
        }
    }

    let mut fields: Option<Vec<String>> = {
        let names: Vec<String> = cli.table.iter().skip(1).cloned().collect();
        (!names.is_empty()).then_some(names)
    };

    if cli.yaml {
        let records: Vec<indexmap::IndexMap<String, serde_json::Value>> =
            serde_yaml::from_str(&raw)?;
        if fields.is_none() {
            fields = records
                .first()
                .map(|r| r.keys().cloned().collect::<Vec<_>>());
        }
        let rows: Vec<Vec<Value>> = records
            .iter()
            .map(|record| {
                fields
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|f| record.get(f).map(Value::from_json).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Ok((fields, WriteData::Rows(rows)))
    } else {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(raw.as_bytes());
        let mut rows: Vec<Vec<Value>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(Value::from).collect());
        }
        if fields.is_none() && !rows.is_empty() {
            let header = rows.remove(0);
            fields = Some(
                header
                    .iter()
                    .map(|v| match v {
                        Value::Str(s) => s.clone(),
                        other => other.literal_text(),
                    })
                    .collect(),
            );
        }
        Ok((fields, WriteData::Rows(rows)))
    }
}

fn action_write(cli: &Cli, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let table = table_arg(cli)?;
    let (fields, data) = input_data(cli)?;
    let fields = fields
        .map(Fields::List)
        .unwrap_or(Fields::All);
    let view = View::new(ctx, table, fields)?;
    let mut opts = WriteOptions::new();
    if cli.purge {
        opts = opts.purge();
    }
    if !cli.filter.is_empty() {
        opts = opts.filters(Filter::from(cli.filter.clone()));
    }
    view.write(ctx, data, opts)?;
    Ok(())
}

fn action_delete(cli: &Cli, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let table = table_arg(cli)?;
    let mut opts = DeleteOptions::new();
    if !cli.filter.is_empty() {
        opts = opts.filters(Filter::from(cli.filter.clone()));
    } else {
        let (fields, data) = input_data(cli)?;
        if let Some(fields) = fields {
            let view = View::new(ctx, table, Fields::List(fields))?;
            return Ok(view.delete(ctx, opts.data(data)).map(|_| ())?);
        }
    }
    let view = View::new(ctx, table, view_fields(cli))?;
    view.delete(ctx, opts)?;
    Ok(())
}

fn action_info(cli: &Cli, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let registry = ctx.registry();
    match cli.table.first() {
        Some(table) => {
            let table = registry.get(table)?;
            let mut columns: Vec<_> = table.columns.values().collect();
            columns.sort_by_key(|c| c.name.clone());
            for col in columns {
                let details = match (&col.ctype, &col.foreign_table, &col.foreign_col) {
                    (ColType::M2O | ColType::O2M, Some(ft), Some(fc)) => {
                        format!("{} -> {ft}.{fc}", col.ctype)
                    }
                    _ => col.sql_type(),
                };
                println!("{} ({details})", col.name);
            }
        }
        None => {
            let mut names: Vec<&str> = registry.names().collect();
            names.sort();
            for name in names {
                println!("{name}");
            }
        }
    }
    Ok(())
}
