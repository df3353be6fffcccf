use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("no attendance record for student {student_id} in section {section}")]
    NotFound { section: String, student_id: String },
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    #[error("malformed attendance record for student {student_id}: {reason}")]
    MalformedRecord { student_id: String, reason: String },
    #[error("store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for AttendanceError {
    fn from(err: sqlx::Error) -> Self {
        AttendanceError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AttendanceError>;
