use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use be_billing_db::DbError;
use serde::Serialize;
use uuid::Uuid;

use crate::gateway::GatewayError;

/// Failures of the reconciliation flow. Details are for logs and audit; the
/// browser only ever sees a success or failure redirect.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Unknown product: {0}")]
    InvalidProduct(String),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(#[from] GatewayError),

    #[error("Gateway rejected payment for order {order_id} (status '{status_marker}', authorized: {authorized})")]
    ValidationRejected {
        order_id: Uuid,
        status_marker: String,
        authorized: bool,
    },

    #[error("Order {order_id} expected {expected} but gateway reports {paid}")]
    AmountMismatch {
        order_id: Uuid,
        expected: i64,
        paid: i64,
    },

    #[error("Order {order_id} has no gateway token to validate")]
    MissingToken { order_id: Uuid },

    #[error("Storage error: {0}")]
    Storage(#[from] DbError),
}

impl ReconcileError {
    /// Transient failures are safe to retry by restarting the purchase.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_) | Self::Storage(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidProduct(_) => "invalid_product",
            Self::GatewayUnavailable(_) => "gateway_unavailable",
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::MissingToken { .. } => "missing_token",
            Self::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl From<DbError> for BillingError {
    fn from(err: DbError) -> Self {
        Self::Reconcile(ReconcileError::Storage(err))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            BillingError::Reconcile(ReconcileError::InvalidProduct(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            BillingError::Reconcile(ReconcileError::GatewayUnavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Payment gateway unavailable, please try again".to_string(),
            ),
            BillingError::Reconcile(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
            BillingError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            BillingError::Config(_) | BillingError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %self, "Billing service error");
        } else {
            tracing::debug!(%status, error = %self, "Billing request rejected");
        }

        (status, axum::Json(ErrorBody { error: message })).into_response()
    }
}
