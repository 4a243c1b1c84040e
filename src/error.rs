//! Error taxonomy shared by the core operations and the HTTP dispatcher.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("no pending buy to act on")]
    NoPendingBuy,
    #[error("no pending sell to act on")]
    NoPendingSell,
    #[error("no trigger set for this user and symbol")]
    NoTrigger,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("insufficient stock")]
    InsufficientStock,
    #[error("unknown user")]
    UnknownUser,
    #[error("no holding of this stock")]
    UnknownHolding,
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// HTTP status the dispatcher reports for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::Validation(_)
            | EngineError::NoPendingBuy
            | EngineError::NoPendingSell
            | EngineError::NoTrigger
            | EngineError::InsufficientFunds
            | EngineError::InsufficientStock
            | EngineError::UnknownUser
            | EngineError::UnknownHolding => StatusCode::BAD_REQUEST,
            EngineError::Unavailable(_) | EngineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_map_to_bad_request() {
        assert_eq!(EngineError::NoPendingBuy.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            EngineError::InsufficientFunds.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::Validation("bad symbol".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn upstream_errors_map_to_internal() {
        assert_eq!(
            EngineError::Unavailable("quote oracle timed out".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
