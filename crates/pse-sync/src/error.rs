use pse_adapters::NormalizeError;
use pse_core::CellError;
use pse_storage::lake::LakeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("MALFORMED_RECORD: {0}")]
    Malformed(#[from] NormalizeError),
    #[error("WRITE_CONFLICT on {table}: {detail}")]
    WriteConflict { table: String, detail: String },
    #[error("BACKEND_UNAVAILABLE ({backend}): {detail}")]
    BackendUnavailable { backend: &'static str, detail: String },
    #[error("BACKEND_STATEMENT ({backend}): {detail}")]
    Statement { backend: &'static str, detail: String },
    #[error("PARTIAL_EXTRACTION_FAILURE: {failed} of {total} extraction units failed")]
    PartialExtraction { failed: usize, total: usize },
    #[error("RETRIES_EXHAUSTED on {table} after {attempts} attempts: {last}")]
    RetriesExhausted {
        table: String,
        attempts: usize,
        last: Box<SyncError>,
    },
    #[error("CONFIG: {0}")]
    Config(String),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Malformed(_) => "MALFORMED_RECORD",
            SyncError::WriteConflict { .. } => "WRITE_CONFLICT",
            SyncError::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            SyncError::Statement { .. } => "BACKEND_STATEMENT",
            SyncError::PartialExtraction { .. } => "PARTIAL_EXTRACTION_FAILURE",
            SyncError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            SyncError::Config(_) => "CONFIG",
        }
    }

    /// Only concurrent-modification failures are worth re-planning for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::WriteConflict { .. })
    }

    pub fn statement(backend: &'static str, detail: impl ToString) -> Self {
        SyncError::Statement {
            backend,
            detail: detail.to_string(),
        }
    }

    pub fn unavailable(backend: &'static str, detail: impl ToString) -> Self {
        SyncError::BackendUnavailable {
            backend,
            detail: detail.to_string(),
        }
    }

    pub fn config(detail: impl ToString) -> Self {
        SyncError::Config(detail.to_string())
    }

    /// Rows read back from a backend that do not fit the entity schema.
    pub fn decode(backend: &'static str, err: CellError) -> Self {
        SyncError::statement(backend, format!("undecodable row: {err}"))
    }

    pub fn from_sqlx(table: &str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let code = db.code().map(|c| c.into_owned());
            let message = db.message().to_string();
            return match code.as_deref() {
                // unique_violation, serialization_failure, deadlock_detected
                Some("23505") | Some("40001") | Some("40P01") => SyncError::WriteConflict {
                    table: table.to_string(),
                    detail: message,
                },
                // invalid_catalog_name, invalid_authorization_specification, invalid_password
                Some("3D000") | Some("28000") | Some("28P01") => SyncError::unavailable("postgres", message),
                _ => SyncError::statement("postgres", message),
            };
        }
        let connection_level = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Configuration(_)
                | sqlx::Error::Protocol(_)
        );
        if connection_level {
            SyncError::unavailable("postgres", err)
        } else {
            SyncError::statement("postgres", err)
        }
    }

    pub fn from_lake(table: &str, err: LakeError) -> Self {
        match err {
            LakeError::CommitConflict { detail, .. } => SyncError::WriteConflict {
                table: table.to_string(),
                detail,
            },
            LakeError::NotFound(uri) => {
                SyncError::unavailable("lake", format!("{uri} does not exist; run initialize-schema"))
            }
            LakeError::Store { .. } => SyncError::unavailable("lake", err),
            other => SyncError::statement("lake", other),
        }
    }
}
