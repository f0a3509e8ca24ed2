// Access review endpoints: ask the policy snapshot whether a subject may
// perform an action, or which rules it holds in a namespace

use axum::{body::Bytes, extract::State, Json};
use common::errors::ApiError;
use common::models::{AuthorizationDecision, Grant, PolicyRule, RequestAttributes, Subject, UserInfo};
use common::telemetry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::handlers::ErrorResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AccessReviewRequest {
    pub subject: Subject,
    /// Groups resolved by the authenticator
    #[serde(default)]
    pub groups: BTreeSet<String>,
    pub request: RequestAttributes,
}

#[derive(Debug, Serialize)]
pub struct AccessReviewResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<Grant>,
}

#[derive(Debug, Deserialize)]
pub struct RulesReviewRequest {
    pub subject: Subject,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RulesReviewResponse {
    pub rules: Vec<PolicyRule>,
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, ErrorResponse> {
    serde_json::from_slice(body).map_err(|e| ErrorResponse::from(ApiError::from(e)))
}

fn validate_request(request: &RequestAttributes) -> Result<(), ErrorResponse> {
    let (verb, target) = match request {
        RequestAttributes::Resource { verb, resource, .. } => (verb, resource),
        RequestAttributes::NonResource { verb, path } => (verb, path),
    };
    if verb.is_empty() {
        return Err(ErrorResponse::new("validation_error", "verb cannot be empty"));
    }
    if target.is_empty() {
        return Err(ErrorResponse::new(
            "validation_error",
            "resource or path cannot be empty",
        ));
    }
    Ok(())
}

/// Decide one request against the loaded policy
#[tracing::instrument(skip(state, body))]
pub async fn create_access_review(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AccessReviewResponse>, ErrorResponse> {
    let review: AccessReviewRequest = parse_body(&body)?;
    validate_request(&review.request)?;

    let user = UserInfo {
        subject: review.subject,
        groups: review.groups,
    };
    let decision = state.policy.authorize(&user, &review.request);
    telemetry::record_authorization(decision.kind());

    let response = match decision {
        AuthorizationDecision::Allow { grant } => {
            tracing::info!(
                subject = %user.subject,
                binding = %grant.binding,
                role = %grant.role_ref,
                "Access review allowed"
            );
            AccessReviewResponse {
                allowed: true,
                reason: None,
                grant: Some(grant),
            }
        }
        AuthorizationDecision::Deny { reason } => {
            tracing::info!(subject = %user.subject, %reason, "Access review denied");
            AccessReviewResponse {
                allowed: false,
                reason: Some(reason),
                grant: None,
            }
        }
    };

    Ok(Json(response))
}

/// List the rules a subject holds in a namespace
#[tracing::instrument(skip(state, body))]
pub async fn create_rules_review(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RulesReviewResponse>, ErrorResponse> {
    let review: RulesReviewRequest = parse_body(&body)?;
    let user = UserInfo {
        subject: review.subject,
        groups: review.groups,
    };
    let rules = state.policy.rules_for(&user, review.namespace.as_deref());
    Ok(Json(RulesReviewResponse { rules }))
}
