use crate::http::Method;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Not found")]
    NotFound,
    #[error("Method not allowed")]
    MethodNotAllowed(Vec<Method>),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("Response already sent")]
    AlreadySent,
    #[error("Handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid route registration: {0}")]
    MountConflict(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Panic: {0}")]
    PanicError(String),
}

impl ServerError {
    /// Wraps a domain error raised by a middleware or handler.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ServerError::Handler(err.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::BadRequest(_) => 400,
            ServerError::Unauthorized(_) => 401,
            ServerError::Forbidden(_) => 403,
            ServerError::NotFound => 404,
            ServerError::MethodNotAllowed(_) => 405,
            ServerError::PayloadTooLarge { .. } => 413,
            ServerError::ParseError(_) => 422,
            ServerError::IoError(_)
            | ServerError::AlreadySent
            | ServerError::Handler(_)
            | ServerError::MountConflict(_)
            | ServerError::InternalError(_)
            | ServerError::PanicError(_) => 500,
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ServerError::NotFound.status_code(), 404);
        assert_eq!(ServerError::PayloadTooLarge { limit: 10 }.status_code(), 413);
        assert_eq!(ServerError::handler("boom").status_code(), 500);
        assert_eq!(ServerError::MethodNotAllowed(vec![Method::GET]).status_code(), 405);
        assert!(ServerError::AlreadySent.is_server_error());
        assert!(!ServerError::Unauthorized("no".into()).is_server_error());
    }

    #[test]
    fn test_handler_error_keeps_source() {
        let err = ServerError::handler(io::Error::new(io::ErrorKind::Other, "disk"));
        assert_eq!(err.to_string(), "Handler error: disk");
        assert!(std::error::Error::source(&err).is_some());
    }
}
