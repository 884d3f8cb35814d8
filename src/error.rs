use std::fmt;

/// Storage engine error kinds
///
/// The store never panics across its boundary; every failure becomes one of
/// these variants or an observer callback. `LeaseExpired` has no variant on
/// purpose: completing or releasing an id whose record no longer exists is
/// treated as success so duplicate completions stay harmless.
#[derive(Debug)]
pub enum StoreError {
    /// Caller-side programming error, synchronous and non-recoverable for that call
    InvalidArgument(String),
    /// Backing store cannot serve requests; the operation must be assumed failed
    StorageUnavailable(String),
    /// Corruption detected and the automatic recreate attempt also failed
    StorageCorrupt(String),
    /// Record rejected by quota policy; caller may retry after backoff or accept the drop
    QuotaRejected,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Self::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            Self::StorageCorrupt(msg) => write!(f, "Storage corrupt: {}", msg),
            Self::QuotaRejected => write!(f, "Record rejected by quota policy"),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// Stable kind name used in observer callbacks and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::StorageCorrupt(_) => "storage_corrupt",
            Self::QuotaRejected => "quota_rejected",
        }
    }
}

/// Whether a sqlx error indicates an unreadable or malformed database file
pub(crate) fn is_corruption(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        if let Some(code) = db.code() {
            // SQLITE_CORRUPT (11) and SQLITE_NOTADB (26), plus extended codes
            if matches!(code.as_ref(), "11" | "26" | "267" | "779") {
                return true;
            }
        }
        let message = db.message();
        return message.contains("malformed") || message.contains("not a database");
    }
    false
}

/// Whether a sqlx error is transient lock contention worth a short retry
pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        if let Some(code) = db.code() {
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6), plus extended codes
            return matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517");
        }
    }
    matches!(err, sqlx::Error::PoolTimedOut)
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_corruption(&err) {
            Self::StorageCorrupt(err.to_string())
        } else {
            Self::StorageUnavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("serialization failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StoreError::InvalidArgument("filter arrays differ in length".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid argument: filter arrays differ in length"
        );
        assert_eq!(
            StoreError::QuotaRejected.to_string(),
            "Record rejected by quota policy"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(StoreError::QuotaRejected.kind(), "quota_rejected");
        assert_eq!(
            StoreError::StorageUnavailable("disk busy".to_string()).kind(),
            "storage_unavailable"
        );
    }
}
