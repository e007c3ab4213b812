use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::{json, Json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PileError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database connection lock poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("Admin privileges required")]
    Unauthorized,

    #[error("Invalid password")]
    BadCredentials,

    #[error("{0}")]
    Forbidden(String),

    #[error("Rate limit exceeded, try again later")]
    RateLimited,

    #[error("Upload rejected: {0}")]
    Upload(String),
}

impl PileError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PileError::Validation(msg.into())
    }

    pub fn status(&self) -> Status {
        match self {
            PileError::Database(_) | PileError::LockPoisoned | PileError::Io(_) => {
                Status::InternalServerError
            }
            PileError::Validation(_) | PileError::Upload(_) => Status::BadRequest,
            PileError::NotFound(_) => Status::NotFound,
            PileError::Conflict(_) => Status::Conflict,
            PileError::Unauthorized | PileError::BadCredentials => Status::Unauthorized,
            PileError::Forbidden(_) => Status::Forbidden,
            PileError::RateLimited => Status::TooManyRequests,
        }
    }

    /// Stable machine-readable code sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            PileError::Database(_) | PileError::LockPoisoned | PileError::Io(_) => "INTERNAL_ERROR",
            PileError::Validation(_) => "VALIDATION_ERROR",
            PileError::NotFound(_) => "NOT_FOUND",
            PileError::Conflict(_) => "DUPLICATE_SLUG",
            PileError::Unauthorized => "UNAUTHORIZED",
            PileError::BadCredentials => "INVALID_PASSWORD",
            PileError::Forbidden(_) => "FORBIDDEN",
            PileError::RateLimited => "RATE_LIMIT_EXCEEDED",
            PileError::Upload(_) => "UPLOAD_REJECTED",
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for PileError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let status = self.status();
        let message = if status == Status::InternalServerError {
            tracing::error!(error = %self, uri = %req.uri(), "request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({"error": message, "code": self.code()}))).respond_to(req)
    }
}

pub type Result<T> = std::result::Result<T, PileError>;
