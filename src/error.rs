use std::time::Duration;

use thiserror::Error;

use crate::market_data::record::InstrumentIdError;
use crate::session::state::SessionStatus;

/// Non-zero status codes returned by gateway requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway already disconnected")]
    AlreadyDisconnected,
    #[error("too many unhandled requests")]
    TooManyUnhandledRequests,
    #[error("too many requests")]
    TooManyRequests,
    #[error("gateway rejected request with code {0}")]
    Rejected(i32),
}

impl GatewayError {
    /// -2/-3: the venue is pushing back, delay and retry the same call.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, GatewayError::TooManyUnhandledRequests | GatewayError::TooManyRequests)
    }

    /// -1: the session is torn down, only a full reconnect helps.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, GatewayError::AlreadyDisconnected)
    }
}

/// Coarse classification the driver branches on. Ingest failures
/// (`PoolError`, `IngestError`) classify themselves as `Resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    StateConflict,
    Timeout,
    GatewayRejection,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no gateway address given")]
    AddressEmpty,
    #[error("gateway flow path is empty")]
    FlowPathEmpty,
    #[error("session has no gateway, call init first")]
    NotInitialized,
    #[error("status conflict: expected {expected:?}, session is {actual:?}")]
    StatusConflict { expected: SessionStatus, actual: SessionStatus },
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("login did not complete within the retry budget")]
    LoginTimeout,
    #[error("login request failed: {0}")]
    LoginFailed(GatewayError),
    #[error(transparent)]
    InvalidInstrument(#[from] InstrumentIdError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::AddressEmpty
            | SessionError::FlowPathEmpty
            | SessionError::NotInitialized
            | SessionError::InvalidInstrument(_) => ErrorKind::Configuration,
            SessionError::StatusConflict { .. } => ErrorKind::StateConflict,
            SessionError::ConnectTimeout(_) | SessionError::LoginTimeout => ErrorKind::Timeout,
            SessionError::LoginFailed(_) | SessionError::Gateway(_) => ErrorKind::GatewayRejection,
        }
    }

    /// Whether repeating the same operation later can succeed without a reconnect.
    pub fn is_retriable(&self) -> bool {
        match self {
            SessionError::LoginFailed(e) | SessionError::Gateway(e) => e.is_backpressure(),
            SessionError::StatusConflict { .. } | SessionError::ConnectTimeout(_) => true,
            _ => false,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
