use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::routes::ErrorResponseWithMessage;

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Path traversal denied: {0}")]
    PathTraversal(String),
    #[error("Symlink escape denied: {0}")]
    SymlinkEscape(String),
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Container runtime failure: {0}")]
    ExecutionInfrastructure(String),
    #[error("PDF extraction failed: {0}")]
    PdfExtraction(String),
    #[error("File must be a PDF")]
    NotAPdf,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Security-class failures are fatal to the operation and never retried.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::PathTraversal(_) | Self::SymlinkEscape(_) | Self::InvalidFilename(_)
        )
    }

    fn reason(&self) -> (&'static str, u32) {
        match self {
            Self::PathTraversal(_) | Self::SymlinkEscape(_) | Self::InvalidFilename(_) => {
                ("ERR_INVALID_ARGUMENT", 1)
            }
            Self::NotAPdf => ("ERR_INVALID_ARGUMENT", 1),
            Self::FileNotFound(_) => ("ERR_NOT_FOUND", 3),
            Self::ExecutionInfrastructure(_) | Self::PdfExtraction(_) => ("ERR_EXTERNAL", 5),
            Self::Io(_) | Self::Serialization(_) => ("ERR_INTERNAL", 6),
        }
    }

    /// Client-facing text; never carries host paths or io error details.
    pub fn public_message(&self) -> String {
        match self {
            Self::PathTraversal(_) | Self::SymlinkEscape(_) => "Path not allowed".to_string(),
            Self::InvalidFilename(_) => "Invalid filename".to_string(),
            Self::FileNotFound(id) => format!("File not found: {id}"),
            Self::ExecutionInfrastructure(_) => "Execution backend unavailable".to_string(),
            Self::PdfExtraction(msg) => format!("PDF extraction failed: {msg}"),
            Self::NotAPdf => self.to_string(),
            Self::Io(_) | Self::Serialization(_) => "Internal storage error".to_string(),
        }
    }
}

impl From<crate::queue::QueueError> for SandboxError {
    fn from(e: crate::queue::QueueError) -> Self {
        Self::ExecutionInfrastructure(e.to_string())
    }
}

impl ResponseError for SandboxError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::PathTraversal(_)
            | Self::SymlinkEscape(_)
            | Self::InvalidFilename(_)
            | Self::NotAPdf => StatusCode::BAD_REQUEST,
            Self::FileNotFound(_) => StatusCode::NOT_FOUND,
            Self::ExecutionInfrastructure(_)
            | Self::PdfExtraction(_)
            | Self::Io(_)
            | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (reason, code) = self.reason();
        HttpResponse::build(self.status_code()).json(ErrorResponseWithMessage {
            reason,
            code,
            message: self.public_message(),
        })
    }
}
