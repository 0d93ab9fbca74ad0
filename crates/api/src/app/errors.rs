use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use reelgen_infra::scheduler::SubmitError;

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::InvalidRequest(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_request", msg),
        SubmitError::ConcurrencyLimit {
            reason,
            active_count,
            max_allowed,
        } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "concurrency_limit",
                "message": reason,
                "active_count": active_count,
                "max_allowed": max_allowed,
            })),
        )
            .into_response(),
        err @ SubmitError::InsufficientCredits { .. } => {
            json_error(StatusCode::PAYMENT_REQUIRED, "insufficient_credits", err.to_string())
        }
        err @ SubmitError::LedgerUnavailable(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "ledger_unavailable", err.to_string())
        }
        err @ SubmitError::DebitFailed(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "debit_failed", err.to_string())
        }
        err @ SubmitError::PersistenceFailed(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "persistence_failed", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
