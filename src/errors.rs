use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrintError {
    #[error("{operation}: method not supported on {platform}")]
    NotSupported {
        operation: &'static str,
        platform: &'static str,
    },

    /// Non-zero exit of a spooler tool. The message is the tool's own output.
    #[error("{0}")]
    Command(String),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("request error: {0}")]
    Request(String),

    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("render failed: {0}")]
    Render(String),

    #[error("unreadable printer list: {0}")]
    PrinterList(#[from] csv::Error),
}

impl PrintError {
    pub fn not_supported(operation: &'static str) -> Self {
        PrintError::NotSupported {
            operation,
            platform: std::env::consts::OS,
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn field(name: &str, problem: impl std::fmt::Display) -> Self {
        ValidationError(format!("{}: {}", name, problem))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Print(#[from] PrintError),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn message_body(&self) -> serde_json::Value {
        serde_json::json!({ "message": self.to_string() })
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Print(PrintError::NotSupported { .. }) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Print(PrintError::Request(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Print(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        if matches!(self, ApiError::Unauthorized) {
            response.insert_header((header::WWW_AUTHENTICATE, "Basic"));
        }
        response.json(self.message_body())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("invalid header: {0:?}")]
    InvalidHeader(String),

    #[error("{path}: not a regular file")]
    NotAFile { path: String },

    #[error("config I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config format error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type ApiResult<T> = Result<T, ApiError>;
