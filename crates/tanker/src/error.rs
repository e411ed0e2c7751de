use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("table not found: {0}")]
    UnknownTable(String),

    #[error("column \"{column}\" not found in table \"{table}\"")]
    UnknownColumn { table: String, column: String },

    #[error("unexpected value \"{value}\" for type \"{ctype}\"")]
    Coercion { value: String, ctype: String },

    #[error("values ({values}) are not known in table \"{table}\"")]
    Resolution { values: String, table: String },

    #[error("expression error: {0}")]
    Expression(String),

    #[error("{0}")]
    Usage(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn expr(msg: impl Into<String>) -> Self {
        Error::Expression(msg.into())
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }
}
