//! Human-in-the-loop confirmation gate.
//!
//! A single-shot request/response protocol: the coordinator records a pending
//! request, the pipeline suspends, and an external answer correlated by id
//! resumes it. Only one outstanding request exists per session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context key holding the pending [`ConfirmationRequest`].
pub const CONFIRMATION_REQUEST_KEY: &str = "confirmation.request";
/// Context key holding the externally supplied [`ConfirmationResponse`].
pub const CONFIRMATION_RESPONSE_KEY: &str = "confirmation.response";

pub const OUTPUT_FORMAT_HINT: &str = "Would you like 'comprehensive' (detailed summaries + references) or 'simple' (article only) output?";

/// Pending question raised by the coordinator stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationRequest {
    /// Correlation id carried across the suspend/resume boundary.
    pub id: String,
    pub hint: String,
    pub payload: ConfirmationPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationPayload {
    pub preference_type: String,
}

impl ConfirmationRequest {
    /// The one request this pipeline ever raises: the output-format question.
    pub fn output_format() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            hint: OUTPUT_FORMAT_HINT.to_string(),
            payload: ConfirmationPayload {
                preference_type: "output_format".to_string(),
            },
        }
    }
}

/// Externally supplied answer to a pending request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationResponse {
    pub request_id: String,
    pub confirmed: bool,
    pub answer: String,
}

impl ConfirmationResponse {
    pub fn confirmed(request_id: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            confirmed: true,
            answer: answer.into(),
        }
    }

    pub fn rejected(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            confirmed: false,
            answer: String::new(),
        }
    }
}

/// Outcome of one gate invocation. Exactly one of these per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// Resolve the gate for the current invocation. A response whose correlation
/// id does not match the outstanding request leaves the gate pending.
pub fn resolve(
    request: &ConfirmationRequest,
    response: Option<&ConfirmationResponse>,
) -> ConfirmationStatus {
    match response {
        Some(response) if response.request_id == request.id => {
            if response.confirmed {
                ConfirmationStatus::Confirmed
            } else {
                ConfirmationStatus::Rejected
            }
        }
        _ => ConfirmationStatus::Pending,
    }
}
