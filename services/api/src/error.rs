use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Domain error taxonomy. Infrastructure layers use `anyhow` and surface
/// here through the `Internal` variant at the domain seams.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("insufficient liquidity in tier {tier}: required {required}, available {available}")]
    InsufficientLiquidity {
        tier: String,
        required: i64,
        available: i64,
    },

    #[error("on-chain price is stale")]
    StalePrice,

    #[error("no on-chain price data")]
    NoPriceData,

    #[error("bad nonce: node expected {expected}, used {actual}")]
    BadNonce { expected: u64, actual: u64 },

    #[error("nonce mismatch persisted after retry")]
    BadNoncePersistence,

    #[error("chain rejected broadcast: {0}")]
    ChainRejected(String),

    #[error("transaction failed on-chain: {0}")]
    ChainFailed(String),

    #[error("event ingestion lag exceeds SLO")]
    Stale,

    #[error("reconciliation: {0}")]
    Reconciliation(String),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::InsufficientLiquidity { .. } => "insufficient_liquidity",
            CoreError::StalePrice => "stale_price",
            CoreError::NoPriceData => "no_price_data",
            CoreError::BadNonce { .. } => "bad_nonce",
            CoreError::BadNoncePersistence => "bad_nonce_persistence",
            CoreError::ChainRejected(_) => "chain_rejected",
            CoreError::ChainFailed(_) => "chain_failed",
            CoreError::Stale => "stale",
            CoreError::Reconciliation(_) => "reconciliation",
            CoreError::Config(_) => "config_error",
            CoreError::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::InsufficientLiquidity { .. } => StatusCode::CONFLICT,
            CoreError::StalePrice | CoreError::NoPriceData | CoreError::Stale => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::BadNonce { .. }
            | CoreError::BadNoncePersistence
            | CoreError::ChainRejected(_)
            | CoreError::ChainFailed(_) => StatusCode::BAD_GATEWAY,
            CoreError::Reconciliation(_) | CoreError::Config(_) | CoreError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "request failed: {self:#}");
        }
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
