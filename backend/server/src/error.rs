use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{
    bypass::BypassError, codes::CodeError, config::ConfigError, fingerprint::FingerprintError,
    lock::LockError, network::IpError, rate_limit::RateLimitError, store::StoreError,
    tickets::TicketError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Conflict,
    Throttled,
    NotFound,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Throttled => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Missing parameters")]
    MissingParameters,

    #[error("Not enough fingerprint attributes")]
    InsufficientEntropy,

    #[error("Invalid client address")]
    InvalidIp,

    #[error("Invalid bypass code")]
    InvalidBypassCode,

    #[error("Invalid ticket signature")]
    InvalidSignature,

    #[error("No active event")]
    NoActiveEvent,

    #[error("Voting closed")]
    VotingClosed,

    #[error("Already voted")]
    AlreadyVoted,

    #[error("Bypass code already used")]
    BypassCodeUsed,

    #[error("Too many requests")]
    Throttled,

    #[error("Ticket not found")]
    TicketNotFound,

    #[error("Store unavailable")]
    Unavailable,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::MalformedPayload
            | AppError::MissingParameters
            | AppError::InsufficientEntropy
            | AppError::InvalidIp
            | AppError::InvalidBypassCode
            | AppError::InvalidSignature => ErrorKind::BadRequest,
            AppError::NoActiveEvent
            | AppError::VotingClosed
            | AppError::AlreadyVoted
            | AppError::BypassCodeUsed => ErrorKind::Conflict,
            AppError::Throttled => ErrorKind::Throttled,
            AppError::TicketNotFound => ErrorKind::NotFound,
            AppError::Unavailable => ErrorKind::Unavailable,
            AppError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Machine readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MalformedPayload => "malformed_payload",
            AppError::MissingParameters => "missing_parameters",
            AppError::InsufficientEntropy => "insufficient_entropy",
            AppError::InvalidIp => "invalid_ip",
            AppError::InvalidBypassCode => "invalid_bypass_code",
            AppError::InvalidSignature => "invalid_signature",
            AppError::NoActiveEvent => "no_active_event",
            AppError::VotingClosed => "voting_closed",
            AppError::AlreadyVoted => "already_voted",
            AppError::BypassCodeUsed => "bypass_code_used",
            AppError::Throttled => "too_many_requests",
            AppError::TicketNotFound => "ticket_not_found",
            AppError::Unavailable => "service_unavailable",
            AppError::InternalError(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::InternalError(reason) = &self {
            error!("Internal error: {reason}");
        }

        let body = Json(json!({ "error": self.code() }));

        (self.kind().status(), body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::InternalError(e.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(e: url::ParseError) -> Self {
        AppError::InternalError(format!("redemption url: {e}"))
    }
}

impl From<JsonRejection> for AppError {
    fn from(_: JsonRejection) -> Self {
        AppError::MalformedPayload
    }
}

impl From<QueryRejection> for AppError {
    fn from(_: QueryRejection) -> Self {
        AppError::MissingParameters
    }
}

impl From<FingerprintError> for AppError {
    fn from(e: FingerprintError) -> Self {
        match e {
            FingerprintError::InsufficientEntropy { .. } => AppError::InsufficientEntropy,
        }
    }
}

impl From<IpError> for AppError {
    fn from(_: IpError) -> Self {
        AppError::InvalidIp
    }
}

impl From<BypassError> for AppError {
    fn from(e: BypassError) -> Self {
        match e {
            BypassError::Malformed | BypassError::BadSignature => AppError::InvalidBypassCode,
            BypassError::AlreadyUsed => AppError::BypassCodeUsed,
            BypassError::Store(e) => e.into(),
        }
    }
}

impl From<RateLimitError> for AppError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::Throttled(_) => AppError::Throttled,
            RateLimitError::Poisoned => AppError::InternalError(e.to_string()),
        }
    }
}

impl From<LockError> for AppError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyUsed => AppError::AlreadyVoted,
            LockError::Duration(e) => AppError::InternalError(e.to_string()),
            LockError::Store(e) => e.into(),
        }
    }
}

impl From<CodeError> for AppError {
    fn from(e: CodeError) -> Self {
        match e {
            CodeError::AlreadyVoted => AppError::AlreadyVoted,
            CodeError::BypassUsed => AppError::BypassCodeUsed,
            CodeError::Exhausted { .. } => AppError::InternalError(e.to_string()),
            CodeError::Store(e) => e.into(),
        }
    }
}

impl From<TicketError> for AppError {
    fn from(e: TicketError) -> Self {
        match e {
            TicketError::NotFound => AppError::TicketNotFound,
            TicketError::SignatureMismatch => AppError::InvalidSignature,
            TicketError::MissingParameters => AppError::MissingParameters,
            TicketError::Store(e) => e.into(),
        }
    }
}

/// Startup failures.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
