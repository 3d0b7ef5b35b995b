//! Error types for chryso.
//!
//! All failures surface as a single [`DbError`] enum. Raw driver errors never
//! leak to callers directly: they are funnelled through [`translate`], which
//! maps every recognized driver shape onto a small, closed set of variants and
//! keeps the original error only as the diagnostic `source()`.

use std::error::Error as StdError;
use thiserror::Error;

/// Opaque error produced by a driver (execution or connection factory).
pub type DriverError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        suggestion: String,
        #[source]
        source: Option<DriverError>,
    },

    #[error("Constraint violation: {message}")]
    ConstraintViolation {
        message: String,
        /// e.g. "23505" for a PostgreSQL unique violation
        sql_state: Option<String>,
        #[source]
        source: Option<DriverError>,
    },

    #[error("Connectivity error: {message}")]
    Connectivity {
        message: String,
        #[source]
        source: Option<DriverError>,
    },

    #[error("Statement error: {message}")]
    Statement {
        message: String,
        sql_state: Option<String>,
        #[source]
        source: Option<DriverError>,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    TransactionState {
        message: String,
        transaction_id: String,
    },

    #[error("Unknown database error: {message}")]
    Unknown {
        message: String,
        #[source]
        source: Option<DriverError>,
    },

    #[error("No engine configured: {message}")]
    NotConfigured { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
            source: None,
        }
    }

    /// Create a connection error that keeps the factory's failure as its source.
    pub fn connection_with_source(
        source: DriverError,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Connection {
            message: source.to_string(),
            suggestion: suggestion.into(),
            source: Some(source),
        }
    }

    /// Create a transaction misuse error.
    pub fn transaction_state(
        message: impl Into<String>,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self::TransactionState {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a not configured error.
    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::NotConfigured {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE (or driver-native code) attached to a translated failure.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::ConstraintViolation { sql_state, .. } | Self::Statement { sql_state, .. } => {
                sql_state.as_deref()
            }
            _ => None,
        }
    }

    /// True for errors that came out of [`translate`].
    pub fn is_driver_error(&self) -> bool {
        matches!(
            self,
            Self::ConstraintViolation { .. }
                | Self::Connectivity { .. }
                | Self::Statement { .. }
                | Self::Unknown { .. }
        )
    }

    /// Check if this error is retryable.
    ///
    /// Informational only; nothing in this crate retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Connectivity { .. })
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Generic driver failure for [`Connection`](crate::db::Connection)
/// implementations that have no richer error type of their own.
///
/// The optional `sql_state` follows SQLSTATE conventions and drives
/// translation: class `23` is a constraint violation, class `08` a
/// connectivity failure, any other code a statement failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverFailure {
    pub sql_state: Option<String>,
    pub message: String,
}

impl DriverFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            sql_state: None,
            message: message.into(),
        }
    }

    pub fn with_sql_state(sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sql_state: Some(sql_state.into()),
            message: message.into(),
        }
    }
}

/// Outcome of inspecting a raw driver error.
#[derive(Debug, PartialEq, Eq)]
enum Class {
    Constraint(Option<String>),
    Connectivity,
    Statement(Option<String>),
    Unknown,
}

/// Translate a raw driver error into a [`DbError`].
///
/// Total and side-effect free: every input yields exactly one of
/// `ConstraintViolation`, `Connectivity`, `Statement` or `Unknown`, with the
/// original message preserved and the original error attached as `source`.
pub fn translate(raw: DriverError) -> DbError {
    let class = classify(raw.as_ref());
    let message = raw.to_string();
    let source = Some(raw);

    match class {
        Class::Constraint(sql_state) => DbError::ConstraintViolation {
            message,
            sql_state,
            source,
        },
        Class::Connectivity => DbError::Connectivity { message, source },
        Class::Statement(sql_state) => DbError::Statement {
            message,
            sql_state,
            source,
        },
        Class::Unknown => DbError::Unknown { message, source },
    }
}

fn classify(err: &(dyn StdError + Send + Sync + 'static)) -> Class {
    if let Some(e) = err.downcast_ref::<sqlx::Error>() {
        return classify_sqlx(e);
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return Class::Connectivity;
    }
    if let Some(e) = err.downcast_ref::<DriverFailure>() {
        return match e.sql_state.as_deref() {
            Some(code) => classify_sql_state(code).unwrap_or(Class::Statement(Some(code.into()))),
            None => Class::Unknown,
        };
    }
    Class::Unknown
}

fn classify_sqlx(err: &sqlx::Error) -> Class {
    use sqlx::error::ErrorKind;

    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned());
            match db_err.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => Class::Constraint(code),
                _ if code.as_deref().is_some_and(is_sqlite_constraint_code) => {
                    Class::Constraint(code)
                }
                _ => match code {
                    Some(code) => {
                        classify_sql_state(&code).unwrap_or(Class::Statement(Some(code)))
                    }
                    None => Class::Statement(None),
                },
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Class::Connectivity,
        sqlx::Error::RowNotFound
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::Encode(_) => Class::Statement(None),
        _ => Class::Unknown,
    }
}

/// SQLite reports constraint failures as `SQLITE_CONSTRAINT` (19), possibly
/// extended in the high bits: 1811 for a trigger `RAISE(ABORT)`, 1555 for a
/// primary key, 3091 for a strict-table datatype mismatch. Five-character
/// codes are SQLSTATEs and never match.
fn is_sqlite_constraint_code(code: &str) -> bool {
    const SQLITE_CONSTRAINT: i64 = 19;
    code.len() < 5
        && code
            .parse::<i64>()
            .is_ok_and(|n| n & 0xff == SQLITE_CONSTRAINT)
}

/// Classify a five-character SQLSTATE by class. Returns `None` for codes that
/// carry no class-level meaning here (including driver-native numeric codes).
fn classify_sql_state(code: &str) -> Option<Class> {
    if code.len() != 5 {
        return None;
    }
    match code.get(..2) {
        Some("23") => Some(Class::Constraint(Some(code.to_string()))),
        Some("08") => Some(Class::Connectivity),
        _ => None,
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        translate(Box::new(err))
    }
}
