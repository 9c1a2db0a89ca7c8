use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not available")]
    Unavailable,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
}

impl StoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sea_orm::DbErr> for StoreError {
    fn from(value: sea_orm::DbErr) -> Self {
        StoreError::storage(value.to_string())
    }
}

impl From<apotheke_hider::HideError> for StoreError {
    fn from(value: apotheke_hider::HideError) -> Self {
        StoreError::storage(value.to_string())
    }
}
