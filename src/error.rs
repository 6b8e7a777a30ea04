use thiserror::Error;

/// Error taxonomy for the warehouse pipeline.
///
/// Record-level failures (schema violations, coercion failures, referential
/// violations) are routed to quarantine as values and never surface here;
/// this type covers job-level and infrastructure failures.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("authentication failure: {0}")]
    AuthFailure(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("type coercion failure: {0}")]
    TypeCoercionFailure(String),

    #[error("referential violation: {0}")]
    ReferentialViolation(String),

    #[error("unresolved dimension: {0}")]
    UnresolvedDimension(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("warehouse error: {0}")]
    Warehouse(String),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EtlError>;
