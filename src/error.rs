use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid outbox configuration: {message}"))]
    Configuration { message: String },

    #[snafu(display("Precondition failed: {message}"))]
    Precondition { message: String },

    #[snafu(display("Store unavailable"))]
    StoreUnavailable {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error executing statement: {query}"))]
    Statement {
        query: String,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error decoding outbox row"))]
    Scan {
        #[snafu(source)]
        source: sqlx::Error,
    },
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    pub fn store_unavailable(source: sqlx::Error) -> Self {
        Self::StoreUnavailable { source }
    }

    pub fn scan(source: sqlx::Error) -> Self {
        Self::Scan { source }
    }

    /// Classifies a driver error raised while running `query`.
    ///
    /// Connection-level failures become [`Error::StoreUnavailable`]; anything the
    /// store itself rejected becomes [`Error::Statement`] with the query attached.
    pub fn from_store(query: impl Into<String>, source: sqlx::Error) -> Self {
        match source {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => Self::StoreUnavailable { source },
            source => Self::Statement {
                query: query.into(),
                source,
            },
        }
    }

    /// True when the store rejected an insert because the message id already exists.
    ///
    /// Republishing the same message is expected under retries and callers should
    /// treat this as an idempotent no-op.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Statement { source, .. } => source
                .as_database_error()
                .map(|e| e.is_unique_violation())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration { .. } | Self::Precondition { .. })
    }

    pub fn query(&self) -> Option<&str> {
        match self {
            Self::Statement { query, .. } => Some(query.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_store_unavailable() {
        let err = Error::from_store("SELECT 1", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::StoreUnavailable { .. }));
        assert!(err.query().is_none());

        let err = Error::from_store("SELECT 1", sqlx::Error::PoolClosed);
        assert!(matches!(err, Error::StoreUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_statement_errors_keep_query() {
        let err = Error::from_store("SELECT * FROM outbox", sqlx::Error::RowNotFound);

        assert_eq!(err.query(), Some("SELECT * FROM outbox"));
        assert!(!err.is_unique_violation());
        assert!(err.to_string().contains("SELECT * FROM outbox"));
    }

    #[test]
    fn test_configuration_is_fatal() {
        assert!(!Error::configuration("table not defined").is_retryable());
        assert!(!Error::precondition("zero interval").is_retryable());
        assert!(Error::scan(sqlx::Error::RowNotFound).is_retryable());
    }
}
