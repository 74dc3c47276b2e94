use thiserror::Error;

/// The data store could not be reached. Retried by the engine per its
/// retry policy, then surfaced as an `error` log on the failing node
/// only.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("operational error connecting to {0} store")]
    Operational(String),

    #[error("internal error connecting to {0} store")]
    Internal(String),

    #[error("connection error: {0}")]
    Other(String),
}

/// The store rejected a statement, or one could not be generated.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("statement rejected by the store: {0}")]
    Rejected(String),

    #[error("erasure rule {rule} has no masking strategy for category {category}")]
    MissingMaskingStrategy { rule: String, category: String },
}

/// A row cannot be masked because required input is missing, most
/// commonly a non-null primary key value. Logged and treated as a
/// no-op for that row.
#[derive(Debug, Error)]
#[error("insufficient data to mask a row in {collection}: {reason}")]
pub struct InsufficientDataError {
    pub collection: String,
    pub reason: String,
}

/// Any failure a [`Connector`](crate::Connector) operation can
/// surface.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    InsufficientData(#[from] InsufficientDataError),
}
