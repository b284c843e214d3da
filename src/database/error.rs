use thiserror::Error;

use crate::domain::ParseEnumError;
use crate::error::{AppError, AppErrorKind, InfrastructureError};

pub type DbResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    NotFound { entity: String, id: String },
    UniqueViolation { constraint: Option<String> },
    ConnectionError { message: String },
    /// A conditional write lost to a concurrent writer.
    Conflict { message: String },
    /// A stored value could not be mapped back onto a domain type.
    Decode { message: String },
    Unknown { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{}", self.message())]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Decode {
            message: message.into(),
        })
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "row".to_string(),
                id: String::new(),
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DatabaseErrorKind::UniqueViolation {
                    constraint: db_err.constraint().map(str::to_string),
                }
            }
            // 40001 serialization_failure, 40P01 deadlock_detected
            sqlx::Error::Database(db_err)
                if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) =>
            {
                DatabaseErrorKind::Conflict {
                    message: db_err.message().to_string(),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::ConnectionError {
                    message: err.to_string(),
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => DatabaseErrorKind::Decode {
                message: err.to_string(),
            },
            _ => DatabaseErrorKind::Unknown {
                message: err.to_string(),
            },
        };
        Self::new(kind)
    }

    pub fn message(&self) -> String {
        match &self.kind {
            DatabaseErrorKind::NotFound { entity, id } => format!("{} not found: {}", entity, id),
            DatabaseErrorKind::UniqueViolation { constraint } => format!(
                "unique constraint violated: {}",
                constraint.as_deref().unwrap_or("unknown")
            ),
            DatabaseErrorKind::ConnectionError { message } => {
                format!("database connection error: {}", message)
            }
            DatabaseErrorKind::Conflict { message } => format!("concurrent update: {}", message),
            DatabaseErrorKind::Decode { message } => format!("stored value unreadable: {}", message),
            DatabaseErrorKind::Unknown { message } => format!("database error: {}", message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionError { .. } | DatabaseErrorKind::Conflict { .. }
        )
    }
}

impl From<ParseEnumError> for DatabaseError {
    fn from(err: ParseEnumError) -> Self {
        Self::decode(err.to_string())
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        match err.kind {
            DatabaseErrorKind::NotFound { entity, id } => AppError::not_found(&entity, id),
            _ => AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
                is_retryable: err.is_retryable(),
                message: err.message(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = DatabaseError::from_sqlx(sqlx::Error::RowNotFound);
        assert!(matches!(err.kind, DatabaseErrorKind::NotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let err = DatabaseError::from_sqlx(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        let app: AppError = err.into();
        assert_eq!(app.status_code(), 500);
        assert!(app.is_retryable());
    }

    #[test]
    fn not_found_becomes_404() {
        let app: AppError = DatabaseError::not_found("payment", "abc").into();
        assert_eq!(app.status_code(), 404);
    }
}
