//! Backend dialects and the SQL rewrites they require.

use crate::{Error, Result};

/// The database engine behind a connection URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Embedded file (or in-memory) engine.
    Sqlite,
    /// Client-server engine with a connection pool.
    Postgresql,
    /// Distributed-SQL dialect, spoken over the client-server protocol.
    Crdb,
}

impl Flavor {
    pub fn from_scheme(scheme: &str, uri: &str) -> Result<Flavor> {
        match scheme {
            "sqlite" => Ok(Flavor::Sqlite),
            "postgresql" | "postgres" => Ok(Flavor::Postgresql),
            "crdb" => Ok(Flavor::Crdb),
            other => Err(Error::usage(format!(
                "Unsupported scheme \"{other}\" in uri \"{uri}\""
            ))),
        }
    }

    /// Statements are generated with `%s` placeholders; rewrite them to
    /// what the driver actually understands. Quoted literals are preserved
    /// by a single pre-scan.
    pub fn prepare_sql(self, query: &str) -> String {
        let mut out = String::with_capacity(query.len() + 8);
        let mut n = 0usize;
        let mut chars = query.chars().peekable();
        let mut plain = String::new();

        let flush = |plain: &mut String, out: &mut String, n: &mut usize, flavor: Flavor| {
            match flavor {
                Flavor::Sqlite => {
                    let replaced = plain.replace("ilike", "like");
                    out.push_str(&replaced.replace("%s", "?"));
                }
                Flavor::Postgresql | Flavor::Crdb => {
                    let mut rest = plain.as_str();
                    while let Some(pos) = rest.find("%s") {
                        *n += 1;
                        out.push_str(&rest[..pos]);
                        out.push('$');
                        out.push_str(&n.to_string());
                        rest = &rest[pos + 2..];
                    }
                    out.push_str(rest);
                }
            }
            plain.clear();
        };

        while let Some(c) = chars.next() {
            if c == '\'' {
                flush(&mut plain, &mut out, &mut n, self);
                out.push('\'');
                // Copy the quoted literal verbatim, honoring '' escapes.
                while let Some(q) = chars.next() {
                    out.push(q);
                    if q == '\'' {
                        if chars.peek() == Some(&'\'') {
                            out.push(chars.next().unwrap());
                        } else {
                            break;
                        }
                    }
                }
            } else {
                plain.push(c);
            }
        }
        flush(&mut plain, &mut out, &mut n, self);
        out
    }

    /// Definition of the implicit `id` column.
    ///
    /// An explicit primary-key index is only needed when some other table
    /// references this one.
    pub fn id_sql_definition(self, bigint: bool, referenced: bool) -> String {
        match self {
            Flavor::Sqlite => "INTEGER PRIMARY KEY".to_string(),
            Flavor::Postgresql | Flavor::Crdb => {
                let mut def = if bigint { "BIGSERIAL" } else { "SERIAL" }.to_string();
                if referenced {
                    def.push_str(" PRIMARY KEY");
                }
                def
            }
        }
    }

    /// Whether `INSERT .. ON CONFLICT` can be used to apply staged rows.
    pub fn upsert_supported(self, legacy_pg: bool, brin_index: bool) -> bool {
        match self {
            // The embedded engine goes through INSERT OR REPLACE instead.
            Flavor::Sqlite => false,
            Flavor::Postgresql => !legacy_pg && !brin_index,
            Flavor::Crdb => !brin_index,
        }
    }

    /// Whether a bulk-load channel (COPY) is available for staging data.
    pub fn copy_supported(self) -> bool {
        matches!(self, Flavor::Postgresql)
    }

    /// Staging tables are temporary except on the distributed dialect,
    /// where temporary tables are not reliably visible to follow-up
    /// statements.
    pub fn temp_tables_supported(self) -> bool {
        !matches!(self, Flavor::Crdb)
    }
}
