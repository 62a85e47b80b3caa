use std::error::Error as StdError;

use thiserror::Error;

/// Failure raised by a repository or by the unit of work itself.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unit of work scope is closed; acquire a new scope")]
    ScopeClosed,
    #[error("{entity} already has an identity and cannot be added again")]
    AlreadyPersisted { entity: &'static str },
    #[error("{entity} has no persisted identity")]
    MissingIdentity { entity: &'static str },
    #[error("{entity} is missing required field {field}")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
}

impl StorageError {
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::Backend(err.into())
    }
}

/// Failure raised by an external raw-item provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
