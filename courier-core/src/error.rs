use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid job id: {0}")]
    InvalidId(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// True for errors caused by the catalog or registry setup rather than by
    /// runtime conditions.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnknownJobType(_) | Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;
