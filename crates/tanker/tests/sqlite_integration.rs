//! End-to-end tests against the embedded backend.

use serde_json::json;
use tanker::{
    connect, fetch, save, spawn_with_context, Args, Config, Context, DeleteOptions, Fields,
    Filter, ReadOptions, Result, TableDef, Value, View, WriteData, WriteOptions,
};

fn s(v: &str) -> Value {
    Value::from(v)
}

fn i(v: i64) -> Value {
    Value::Int(v)
}

fn base_defs() -> Vec<TableDef> {
    serde_json::from_value(json!([
        {
            "table": "team",
            "columns": {"name": "varchar", "country": "m2o country.id"},
            "key": ["name", "country"]
        },
        {
            "table": "country",
            "columns": {"name": "varchar", "teams": "o2m team.country"},
            "key": ["name"],
            "values": [
                {"name": "Belgium"},
                {"name": "France"},
                {"name": "Holland"}
            ]
        },
        {
            "table": "member",
            "columns": {
                "name": "varchar",
                "registration_code": "varchar",
                "created_at": "timestamp",
                "team": "m2o team.id"
            },
            "key": ["registration_code"]
        }
    ]))
    .unwrap()
}

fn base_cfg(tag: &str) -> Config {
    Config::new(format!("sqlite:///:memory:?ctx={tag}")).schema(base_defs())
}

fn setup(ctx: &Context) -> Result<()> {
    ctx.create_tables()?;
    let teams = View::new(ctx, "team", ["name", "country.name"])?;
    teams.write(
        ctx,
        vec![
            vec!["Blue", "Belgium"],
            vec!["Red", "Belgium"],
            vec!["Blue", "France"],
        ],
        WriteOptions::new(),
    )?;
    Ok(())
}

fn write_members(ctx: &Context) -> Result<View> {
    let view = View::new(
        ctx,
        "member",
        [
            ("Name", "name"),
            ("Team", "team.name"),
            ("Code", "registration_code"),
            ("Country", "team.country.name"),
        ],
    )?;
    view.write(
        ctx,
        vec![
            vec!["Bob", "Blue", "001", "Belgium"],
            vec!["Alice", "Red", "002", "Belgium"],
            vec!["Trudy", "Blue", "003", "France"],
        ],
        WriteOptions::new(),
    )?;
    Ok(view)
}

#[test]
fn test_read_after_write() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        let rows = view
            .read(
                ctx,
                ReadOptions::new().order("name").order("country.name"),
            )?
            .all()?;
        assert_eq!(
            rows,
            vec![
                vec![s("Blue"), s("Belgium")],
                vec![s("Blue"), s("France")],
                vec![s("Red"), s("Belgium")],
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_default_fields() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", Fields::All)?;
        let rows = view
            .read(ctx, ReadOptions::new().order("name").order("country.name"))?
            .all()?;
        assert_eq!(
            rows,
            vec![
                vec![s("Blue"), s("Belgium")],
                vec![s("Blue"), s("France")],
                vec![s("Red"), s("Belgium")],
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_seed_values() {
    connect(&base_cfg("base"), |ctx| {
        ctx.create_tables()?;
        let rows = View::new(ctx, "country", ["name"])?
            .read(ctx, ReadOptions::new().order("name"))?
            .all()?;
        assert_eq!(
            rows,
            vec![vec![s("Belgium")], vec![s("France")], vec![s("Holland")]]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_write_idempotence() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        let data = vec![
            vec!["Blue", "Belgium"],
            vec!["Red", "Belgium"],
            vec!["Blue", "France"],
        ];
        let result = view.write(ctx, data.clone(), WriteOptions::new())?;
        assert_eq!(result.filtered, 0);
        let again = view.write(ctx, data, WriteOptions::new())?;
        assert_eq!(again.filtered, 0);
        let rows = view.read(ctx, ReadOptions::new())?.all()?;
        assert_eq!(rows.len(), 3);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_purge() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        let result = view.write(
            ctx,
            vec![vec!["Orange", "Holland"]],
            WriteOptions::new().purge(),
        )?;
        assert_eq!(result.deleted, 3);
        let rows = view.read(ctx, ReadOptions::new())?.all()?;
        assert_eq!(rows, vec![vec![s("Orange"), s("Holland")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_purge_with_filters() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        view.write(
            ctx,
            vec![vec!["Red", "Belgium"]],
            WriteOptions::new()
                .purge()
                .filters("(= country.name \"Belgium\")"),
        )?;
        let rows = view
            .read(ctx, ReadOptions::new().order("name").order("country.name"))?
            .all()?;
        assert_eq!(
            rows,
            vec![vec![s("Blue"), s("France")], vec![s("Red"), s("Belgium")]]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_purge_only() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        view.write(
            ctx,
            vec![vec!["Orange", "Holland"], vec!["Blue", "France"]],
            WriteOptions::new().insert(false).update(false).purge(),
        )?;
        let rows = view.read(ctx, ReadOptions::new())?.all()?;
        assert_eq!(rows, vec![vec![s("Blue"), s("France")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_no_insert() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        view.write(
            ctx,
            vec![vec!["Orange", "Holland"], vec!["Blue", "Belgium"]],
            WriteOptions::new().insert(false),
        )?;
        let rows = view
            .read(ctx, ReadOptions::new().order("name").order("country.name"))?
            .all()?;
        assert_eq!(
            rows,
            vec![
                vec![s("Blue"), s("Belgium")],
                vec![s("Blue"), s("France")],
                vec![s("Red"), s("Belgium")],
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_no_update() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        write_members(ctx)?;
        let view = View::new(ctx, "member", ["registration_code", "name"])?;
        view.write(
            ctx,
            vec![vec!["004", "Carol"], vec!["001", "Hijacked"]],
            WriteOptions::new().update(false),
        )?;
        let mut rows = View::new(ctx, "member", ["name"])?
            .read(ctx, ReadOptions::new())?
            .chain()?;
        rows.sort_by_key(|v| v.literal_text());
        assert_eq!(
            rows,
            vec![s("Alice"), s("Bob"), s("Carol"), s("Trudy")]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_partial_write_preserves_columns() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let full = write_members(ctx)?;
        let partial = View::new(ctx, "member", ["name", "registration_code"])?;
        partial.write(ctx, vec![vec!["Bobby", "001"]], WriteOptions::new())?;

        let rows = full
            .read(ctx, ReadOptions::new().filters("(= registration_code \"001\")"))?
            .all()?;
        assert_eq!(
            rows,
            vec![vec![s("Bobby"), s("Blue"), s("001"), s("Belgium")]]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_fk_by_id_matches_fk_by_key() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let countries = View::new(ctx, "country", ["id", "name"])?
            .read(ctx, ReadOptions::new())?
            .all()?;
        let holland_id = countries
            .iter()
            .find(|row| row[1] == s("Holland"))
            .map(|row| row[0].clone())
            .unwrap();

        let by_id = View::new(ctx, "team", ["name", "country"])?;
        by_id.write(ctx, vec![vec![s("Orange"), holland_id]], WriteOptions::new())?;

        let rows = View::new(ctx, "team", ["name", "country.name"])?
            .read(ctx, ReadOptions::new().filters("(= name \"Orange\")"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Orange"), s("Holland")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_fk_cache_invalidation() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        // The team writes above cached the country lookups; a write to
        // country must invalidate them.
        View::new(ctx, "country", ["name"])?.write(
            ctx,
            vec![vec!["Italy"]],
            WriteOptions::new(),
        )?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        view.write(ctx, vec![vec!["Green", "Italy"]], WriteOptions::new())?;
        let rows = view
            .read(ctx, ReadOptions::new().filters("(= country.name \"Italy\")"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Green"), s("Italy")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_unknown_fk_value() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        let err = view
            .write(ctx, vec![vec!["Pink", "Atlantis"]], WriteOptions::new())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("country"), "{msg}");
        assert!(msg.contains("Atlantis"), "{msg}");
        Err::<(), _>(err) // roll back the failed batch
    })
    .unwrap_err();
}

#[test]
fn test_null_fk() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = write_members(ctx)?;
        view.write(
            ctx,
            vec![vec![s("Ghost"), Value::Null, s("004"), Value::Null]],
            WriteOptions::new(),
        )?;
        let rows = view
            .read(ctx, ReadOptions::new().filters("(= registration_code \"004\")"))?
            .all()?;
        assert_eq!(
            rows,
            vec![vec![s("Ghost"), Value::Null, s("004"), Value::Null]]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_o2m_read() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "country", ["name", "teams.name"])?;
        let rows = view
            .read(ctx, ReadOptions::new().order("name").order("teams.name"))?
            .all()?;
        assert_eq!(
            rows,
            vec![
                vec![s("Belgium"), s("Blue")],
                vec![s("Belgium"), s("Red")],
                vec![s("France"), s("Blue")],
                vec![s("Holland"), Value::Null],
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_filters() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name"])?;

        let rows = view
            .read(ctx, ReadOptions::new().filters("(= country.name \"France\")"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Blue")]]);

        let rows = view
            .read(
                ctx,
                ReadOptions::new().filters(vec![
                    "(= country.name \"France\")",
                    "(= country.name \"Belgium\")",
                ]),
            )?
            .all()?;
        assert_eq!(rows, Vec::<Vec<Value>>::new());

        let rows = view.read(ctx, ReadOptions::new().filters("(false)"))?.all()?;
        assert!(rows.is_empty());

        let rows = view.read(ctx, ReadOptions::new().filters("(true)"))?.all()?;
        assert_eq!(rows.len(), 3);

        let rows = view
            .read(
                ctx,
                ReadOptions::new().filters(Filter::Map(vec![("name".to_string(), s("Red"))])),
            )?
            .all()?;
        assert_eq!(rows, vec![vec![s("Red")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_like_ilike() {
    connect(&base_cfg("base"), |ctx| {
        ctx.create_tables()?;
        let view = View::new(ctx, "country", ["name"])?;

        let rows = view
            .read(ctx, ReadOptions::new().filters("(like name \"%e%\")"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Belgium")], vec![s("France")]]);

        let rows = view
            .read(ctx, ReadOptions::new().filters("(ilike name \"H%\")"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Holland")]]);

        let rows = view
            .read(
                ctx,
                ReadOptions::new()
                    .filters("(ilike name {prefix})")
                    .args(Args::named([("prefix", "H%")])),
            )?
            .all()?;
        assert_eq!(rows, vec![vec![s("Holland")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_args() {
    connect(&base_cfg("args").var("cfg_team", "Red"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name"])?;

        let rows = view
            .read(
                ctx,
                ReadOptions::new()
                    .filters("(= name {name})")
                    .args(Args::named([("name", "Blue")])),
            )?
            .all()?;
        assert_eq!(rows.len(), 2);

        let rows = view
            .read(
                ctx,
                ReadOptions::new()
                    .filters("(or (= name {0}) (= name {1}))")
                    .args(Args::positional(["Red", "Blue"])),
            )?
            .all()?;
        assert_eq!(rows.len(), 3);

        let rows = view
            .read(
                ctx,
                ReadOptions::new()
                    .filters("(or (= name {}) (= name {}))")
                    .args(Args::positional(["Red", "Blue"])),
            )?
            .all()?;
        assert_eq!(rows.len(), 3);

        // Value from the configuration vars
        let rows = view
            .read(ctx, ReadOptions::new().filters("(in name {cfg_team})"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Red")]]);

        // A list expands into one placeholder per element
        let rows = view
            .read(
                ctx,
                ReadOptions::new()
                    .filters("(in name {names})")
                    .args(Args::Named(
                        [("names".to_string(), Value::array(["Red", "Blue"]))].into(),
                    )),
            )?
            .all()?;
        assert_eq!(rows.len(), 3);

        // Dotted tails navigate JSON objects
        let rows = view
            .read(
                ctx,
                ReadOptions::new()
                    .filters("(= name {data.name})")
                    .args(Args::Named(
                        [("data".to_string(), Value::Json(json!({"name": "Red"})))].into(),
                    )),
            )?
            .all()?;
        assert_eq!(rows, vec![vec![s("Red")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_aliases() {
    connect(&base_cfg("base"), |ctx| {
        ctx.create_tables()?;
        ctx.set_alias("tag", "TYPE");
        let view = View::new(ctx, "country", ["name", "{tag}"])?;
        let rows = view
            .read(ctx, ReadOptions::new().filters("(= name \"France\")"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("France"), s("TYPE")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_limit_order_offset_distinct() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "country", ["name"])?;

        let rows = view
            .read(ctx, ReadOptions::new().limit(1).order("name"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Belgium")]]);

        let rows = view
            .read(ctx, ReadOptions::new().limit(1).order(("name", "DESC")))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Holland")]]);

        let rows = view
            .read(ctx, ReadOptions::new().limit(1).offset(1).order("name"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("France")]]);

        // Sort on an expression
        let rows = view
            .read(
                ctx,
                ReadOptions::new().limit(1).order("(!= name \"Belgium\")"),
            )?
            .all()?;
        assert_eq!(rows, vec![vec![s("Belgium")]]);

        let team_countries = View::new(ctx, "team", ["country.name"])?;
        let rows = team_countries
            .read(ctx, ReadOptions::new().distinct().order("country.name"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Belgium")], vec![s("France")]]);

        let err = view
            .read(ctx, ReadOptions::new().order(("name", "sideways")))
            .map(|_| ())
            .unwrap_err();
        assert!(err.to_string().contains("sort direction"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_aggregates() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;

        let rows = View::new(ctx, "country", ["(count)"])?
            .read(ctx, ReadOptions::new())?
            .all()?;
        assert_eq!(rows, vec![vec![i(3)]]);

        let rows = View::new(ctx, "country", ["(sum 1)"])?
            .read(ctx, ReadOptions::new())?
            .all()?;
        assert_eq!(rows, vec![vec![i(3)]]);

        let rows = View::new(ctx, "country", ["(max (+ 1 1))"])?
            .read(ctx, ReadOptions::new())?
            .all()?;
        assert_eq!(rows, vec![vec![i(2)]]);

        // Aggregates auto-group on the other fields
        let view = View::new(ctx, "team", ["name", "(count)"])?;
        let rows = view.read(ctx, ReadOptions::new().order("name"))?.all()?;
        assert_eq!(rows, vec![vec![s("Blue"), i(2)], vec![s("Red"), i(1)]]);

        // All fields aggregated: a single row, no grouping
        let rows = View::new(ctx, "team", ["(max name)", "(count)"])?
            .read(ctx, ReadOptions::new())?
            .all()?;
        assert_eq!(rows, vec![vec![s("Red"), i(3)]]);

        // Group on a relation field
        let rows = View::new(ctx, "team", ["(max name)"])?
            .read(
                ctx,
                ReadOptions::new()
                    .groupby("country.name")
                    .order("country.name"),
            )?
            .all()?;
        assert_eq!(rows, vec![vec![s("Red")], vec![s("Blue")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_expression_fields() {
    connect(&base_cfg("base"), |ctx| {
        ctx.create_tables()?;

        let rows = View::new(ctx, "country", ["(= name \"Belgium\")"])?
            .read(ctx, ReadOptions::new().order("name"))?
            .all()?;
        assert_eq!(rows, vec![vec![i(1)], vec![i(0)], vec![i(0)]]);

        let rows = View::new(ctx, "country", ["(cast id (varchar))"])?
            .read(ctx, ReadOptions::new())?
            .all()?;
        assert!(rows.iter().all(|r| matches!(r[0], Value::Str(_))));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_acl_read() {
    let cfg = base_cfg("base").acl_read("country", vec!["(= name \"Belgium\")".to_string()]);
    connect(&cfg, |ctx| {
        ctx.create_tables()?;
        let view = View::new(ctx, "country", ["name"])?;
        let rows = view.read(ctx, ReadOptions::new())?.all()?;
        assert_eq!(rows, vec![vec![s("Belgium")]]);

        let rows = view.read(ctx, ReadOptions::new().disable_acl())?.all()?;
        assert_eq!(rows.len(), 3);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_acl_write() {
    let cfg = base_cfg("base").acl_write("member", vec!["(= team.name \"Blue\")".to_string()]);
    connect(&cfg, |ctx| {
        setup(ctx)?;
        let view = View::new(
            ctx,
            "member",
            ["name", "team.name", "registration_code", "team.country.name"],
        )?;
        let result = view.write(
            ctx,
            vec![
                vec!["Bob", "Blue", "001", "Belgium"],
                vec!["Alice", "Red", "002", "Belgium"],
            ],
            WriteOptions::new(),
        )?;
        assert_eq!(result.filtered, 1);

        let rows = View::new(ctx, "member", ["name"])?
            .read(ctx, ReadOptions::new())?
            .all()?;
        assert_eq!(rows, vec![vec![s("Bob")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_acl_write_update_restriction() {
    let cfg = base_cfg("base").acl_write(
        "member",
        vec!["(= registration_code \"001\")".to_string()],
    );
    connect(&cfg, |ctx| {
        setup(ctx)?;
        let seed = View::new(
            ctx,
            "member",
            ["name", "team.name", "registration_code", "team.country.name"],
        )?;
        seed.write(
            ctx,
            vec![
                vec!["Bob", "Blue", "001", "Belgium"],
                vec!["Alice", "Red", "002", "Belgium"],
                vec!["Trudy", "Blue", "003", "France"],
            ],
            WriteOptions::new().disable_acl(),
        )?;
        let view = View::new(ctx, "member", ["registration_code", "name"])?;
        let result = view.write(
            ctx,
            vec![vec!["001", "UPDATED"], vec!["002", "UPDATED"]],
            WriteOptions::new(),
        )?;
        assert_eq!(result.filtered, 1);

        let rows = View::new(ctx, "member", ["registration_code", "name"])?
            .read(ctx, ReadOptions::new().order("registration_code"))?
            .all()?;
        assert_eq!(
            rows,
            vec![
                vec![s("001"), s("UPDATED")],
                vec![s("002"), s("Alice")],
                vec![s("003"), s("Trudy")],
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_by_data() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "country", ["name"])?;
        view.delete(ctx, DeleteOptions::new().data(vec![vec!["France"]]))?;
        let rows = view.read(ctx, ReadOptions::new().order("name"))?.all()?;
        assert_eq!(rows, vec![vec![s("Belgium")], vec![s("Holland")]]);

        // The delete cascaded to teams via the relation trigger.
        let teams = View::new(ctx, "team", ["name", "country.name"])?
            .read(ctx, ReadOptions::new())?
            .all()?;
        assert!(teams.iter().all(|row| row[1] != s("France")));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_by_data_extra_cols() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = write_members(ctx)?;
        assert_eq!(view.read(ctx, ReadOptions::new())?.all()?.len(), 3);
        view.delete(
            ctx,
            DeleteOptions::new().data(vec![
                vec!["Bob", "Blue", "001", "Belgium"],
                vec!["Alice", "Red", "002", "Belgium"],
                vec!["Trudy", "Blue", "003", "France"],
            ]),
        )?;
        assert!(view.read(ctx, ReadOptions::new())?.all()?.is_empty());
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_swap() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "country", ["name"])?;
        view.delete(
            ctx,
            DeleteOptions::new().data(vec![vec!["Belgium"]]).swap(),
        )?;
        let rows = view.read(ctx, ReadOptions::new())?.all()?;
        assert_eq!(rows, vec![vec![s("Belgium")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_by_filters() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "country", ["name"])?;

        // Contradictory filters delete nothing
        view.delete(
            ctx,
            DeleteOptions::new().filters(vec!["(> id 0)", "(< id 0)"]),
        )?;
        assert_eq!(view.read(ctx, ReadOptions::new())?.all()?.len(), 3);

        view.delete(
            ctx,
            DeleteOptions::new()
                .filters("(in name {names})")
                .args(Args::Named(
                    [(
                        "names".to_string(),
                        Value::array(["France", "Holland"]),
                    )]
                    .into(),
                )),
        )?;
        let rows = view.read(ctx, ReadOptions::new())?.all()?;
        assert_eq!(rows, vec![vec![s("Belgium")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_by_filter_map() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "country", ["name"])?;
        view.delete(
            ctx,
            DeleteOptions::new().filters(Filter::Map(vec![("name".to_string(), s("France"))])),
        )?;
        let rows = view.read(ctx, ReadOptions::new().order("name"))?.all()?;
        assert_eq!(rows, vec![vec![s("Belgium")], vec![s("Holland")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_usage_errors() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "country", ["name"])?;
        let err = view
            .delete(
                ctx,
                DeleteOptions::new()
                    .data(vec![vec!["France"]])
                    .filters("(= name \"France\")"),
            )
            .unwrap_err();
        assert!(err.to_string().contains("both data and filter"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_validate_key() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "member", ["name"])?;
        let err = view
            .write(ctx, vec![vec!["Bob"]], WriteOptions::new())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("member"), "{msg}");
        assert!(msg.contains("registration_code"), "{msg}");
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_duplicate_column_rejected() {
    connect(&base_cfg("base"), |ctx| {
        ctx.create_tables()?;
        let err = View::new(ctx, "country", ["name", "name"]).map(|_| ()).unwrap_err();
        assert!(err.to_string().contains("several time"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_coercion_error() {
    let defs: Vec<TableDef> = serde_json::from_value(json!([
        {"table": "plain", "columns": {"n": "integer"}, "key": ["n"]}
    ]))
    .unwrap();
    let cfg = Config::new("sqlite:///:memory:?ctx=coercion").schema(defs);
    connect(&cfg, |ctx| {
        ctx.create_tables()?;
        let view = View::new(ctx, "plain", ["n"])?;
        let err = view
            .write(ctx, vec![vec!["ham"]], WriteOptions::new())
            .unwrap_err();
        assert!(err.to_string().contains("unexpected value"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_timestamp_round_trip() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "member", ["registration_code", "created_at"])?;
        view.write(
            ctx,
            vec![vec!["010", "2020-01-02 03:04:05"]],
            WriteOptions::new(),
        )?;
        let rows = view
            .read(ctx, ReadOptions::new().filters("(= registration_code \"010\")"))?
            .all()?;
        let expected = chrono::NaiveDate::from_ymd_opt(2020, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(rows, vec![vec![s("010"), Value::Timestamp(expected)]]);
        Ok(())
    })
    .unwrap();
}

fn sink_defs() -> Vec<TableDef> {
    serde_json::from_value(json!([
        {
            "table": "kitchensink",
            "columns": {
                "index": "integer",
                "int_array": "integer[]",
                "float_array": "float[]",
                "bool_array": "bool[]",
                "doc": "jsonb"
            },
            "key": ["index"]
        }
    ]))
    .unwrap()
}

#[test]
fn test_arrays() {
    let cfg = Config::new("sqlite:///:memory:?ctx=arrays").schema(sink_defs());
    connect(&cfg, |ctx| {
        ctx.create_tables()?;
        let view = View::new(ctx, "kitchensink", ["index", "int_array"])?;
        let data = vec![vec![i(1), Value::array([1i64, 2])]];
        view.write(ctx, data.clone(), WriteOptions::new())?;
        let rows = view.read(ctx, ReadOptions::new())?.all()?;
        assert_eq!(rows, data);

        let view = View::new(ctx, "kitchensink", ["index", "bool_array"])?;
        view.write(
            ctx,
            vec![vec![i(1), Value::array([true, false])]],
            WriteOptions::new(),
        )?;
        let rows = view.read(ctx, ReadOptions::new())?.all()?;
        assert_eq!(rows, vec![vec![i(1), Value::array([true, false])]]);

        let view = View::new(ctx, "kitchensink", ["index", "float_array"])?;
        view.write(
            ctx,
            vec![vec![i(2), Value::array([1.5f64, 2.0])]],
            WriteOptions::new(),
        )?;
        let rows = view
            .read(ctx, ReadOptions::new().filters("(= index 2)"))?
            .all()?;
        assert_eq!(rows, vec![vec![i(2), Value::array([1.5f64, 2.0])]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_jsonb() {
    let cfg = Config::new("sqlite:///:memory:?ctx=jsonb").schema(sink_defs());
    connect(&cfg, |ctx| {
        ctx.create_tables()?;
        let view = View::new(ctx, "kitchensink", ["index", "doc"])?;
        view.write(
            ctx,
            vec![vec![i(1), Value::Json(json!({"ham": "spam"}))]],
            WriteOptions::new(),
        )?;
        let rows = view.read(ctx, ReadOptions::new())?.all()?;
        assert_eq!(rows, vec![vec![i(1), Value::Json(json!({"ham": "spam"}))]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_dicts_and_fetch_save() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        let dicts = view
            .read(ctx, ReadOptions::new().order("name").order("country.name").limit(1))?
            .dicts()?;
        assert_eq!(dicts[0].get("name"), Some(&s("Blue")));
        assert_eq!(dicts[0].get("country.name"), Some(&s("Belgium")));

        let row = fetch(
            ctx,
            "country",
            vec![("name".to_string(), s("France"))],
        )?
        .unwrap();
        assert_eq!(row.get("name"), Some(&s("France")));
        assert!(matches!(row.get("id"), Some(Value::Int(_))));

        let mut record = indexmap::IndexMap::new();
        record.insert("name".to_string(), s("Spain"));
        save(ctx, "country", record)?;
        let rows = View::new(ctx, "country", ["name"])?
            .read(ctx, ReadOptions::new().filters("(= name \"Spain\")"))?
            .all()?;
        assert_eq!(rows, vec![vec![s("Spain")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_records_and_columns_input() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        let view = View::new(ctx, "country", ["name"])?;

        let mut record = std::collections::HashMap::new();
        record.insert("name".to_string(), s("Portugal"));
        view.write(ctx, WriteData::Records(vec![record]), WriteOptions::new())?;

        let mut columns = std::collections::HashMap::new();
        columns.insert("name".to_string(), vec![s("Greece"), s("Austria")]);
        view.write(ctx, WriteData::Columns(columns), WriteOptions::new())?;

        let rows = view
            .read(
                ctx,
                ReadOptions::new().filters(
                    "(in name \"Portugal\" \"Greece\" \"Austria\")",
                ),
            )?
            .all()?;
        assert_eq!(rows.len(), 3);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_exists_filter() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        write_members(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        let rows = view
            .read(
                ctx,
                ReadOptions::new()
                    .filters(
                        "(and (exists (from member (select 1) \
                         (where (= team _parent.id) (= name \"Bob\")))) \
                         (= name \"Blue\"))",
                    )
                    .order("country.name"),
            )?
            .all()?;
        assert_eq!(rows, vec![vec![s("Blue"), s("Belgium")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_subselect_filter() {
    connect(&base_cfg("base"), |ctx| {
        setup(ctx)?;
        write_members(ctx)?;
        let view = View::new(ctx, "team", ["name", "country.name"])?;
        let rows = view
            .read(
                ctx,
                ReadOptions::new().filters(
                    "(in id (from member (select team) (where (= name \"Trudy\"))))",
                ),
            )?
            .all()?;
        assert_eq!(rows, vec![vec![s("Blue"), s("France")]]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_introspection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("introspect.db");
    let path = path.to_str().unwrap();

    let cfg = Config::new(format!("sqlite:///{path}")).schema(base_defs());
    connect(&cfg, |ctx| {
        setup(ctx)?;
        Ok(())
    })
    .unwrap();

    // A different URI string addresses the same file but bypasses the
    // cached registry, forcing introspection.
    let cfg = Config::new(format!("sqlite:///{path}?auto=1"));
    connect(&cfg, |ctx| {
        let registry = ctx.registry();
        let team = registry.get("team")?;
        assert_eq!(team.key, vec!["name", "country"]);
        let country = registry.get("country")?;
        assert_eq!(country.key, vec!["name"]);

        let rows = View::new(ctx, "team", ["name"])?
            .read(ctx, ReadOptions::new().order("name"))?
            .all()?;
        assert_eq!(rows.len(), 3);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_thread_inheritance() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threads.db");
    let path = path.to_str().unwrap();
    let cfg = Config::new(format!("sqlite:///{path}")).schema(base_defs());

    connect(&cfg, |ctx| {
        setup(ctx)?;
        Ok(())
    })
    .unwrap();

    connect(&cfg, |_ctx| {
        let handle = spawn_with_context(|child| {
            View::new(child, "team", ["name", "country.name"])?
                .read(child, ReadOptions::new().order("name").order("country.name"))?
                .all()
        });
        let rows = handle.join().expect("thread panicked")?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![s("Blue"), s("Belgium")]);
        Ok(())
    })
    .unwrap();

    // Without a context to inherit, the child reports a usage error.
    let handle = spawn_with_context(|_ctx| Ok(()));
    assert!(handle.join().expect("thread panicked").is_err());
}

#[test]
fn test_enter_leave() {
    let cfg = base_cfg("base");
    let ctx = tanker::enter(&cfg).unwrap();
    ctx.create_tables().unwrap();
    assert!(tanker::current().is_some());
    tanker::leave().unwrap();
    assert!(tanker::current().is_none());
}
