//! Provider webhook endpoint and webhook audit reads.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

use crate::webhook::{apply_event, verify_signature};

use super::{ApiError, SharedState};

/// Inbound provider events. The raw body is read before JSON parsing so
/// the signature is verified over the exact bytes the provider signed.
pub async fn github_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let Some(secret) = state.config.webhook_secret.clone() else {
        return Err(ApiError::Internal(
            "webhook secret is not configured".to_string(),
        ));
    };

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing x-hub-signature-256".to_string()))?;
    if !verify_signature(&secret, &body, signature) {
        eprintln!("[webhook] rejected event with bad signature");
        return Err(ApiError::Unauthorized("signature mismatch".to_string()));
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON payload: {}", e)))?;

    let raw = String::from_utf8_lossy(&body).into_owned();
    let (outcome, hook) = state
        .db
        .call(move |db| apply_event(db, &event_type, &payload, &raw))
        .await?;
    eprintln!(
        "[webhook] {} event {} ({:?})",
        hook.event_type,
        hook.action.as_deref().unwrap_or("-"),
        outcome
    );
    Ok(Json(serde_json::json!({
        "outcome": outcome,
        "webhook_id": hook.id,
    })))
}

pub async fn list_webhooks(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let hooks = state.db.call(|db| db.list_webhooks()).await?;
    Ok(Json(hooks))
}

pub async fn get_webhook(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let hook = state
        .db
        .call(move |db| db.get_webhook(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Webhook {} not found", id)))?;
    Ok(Json(hook))
}

pub async fn delete_webhook(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.call(move |db| db.delete_webhook(id)).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Webhook {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::api::testsupport::{test_router, test_state_with_secret};
    use crate::db::models::{ContributionStatus, IssueStatus};
    use crate::webhook::sign_body;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const SECRET: &str = "test-webhook-secret";

    fn event_request(body: &str, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header("content-type", "application/json")
            .header("x-github-event", "pull_request");
        if let Some(signature) = signature {
            builder = builder.header("x-hub-signature-256", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn merged_close_body() -> String {
        serde_json::json!({
            "action": "closed",
            "pull_request": {
                "html_url": "https://github.com/acme/widget/pull/7",
                "number": 7,
                "merged": true
            }
        })
        .to_string()
    }

    async fn seed_contribution(state: &crate::api::SharedState) -> i64 {
        state
            .db
            .call(|db| {
                let repo = db.create_repository(
                    "acme/widget",
                    "https://github.com/acme/widget",
                    None,
                )?;
                let issue = db.create_issue(repo.id, 42, "Login crash", "", &[])?;
                db.set_issue_status(issue.id, &IssueStatus::PrOpen)?;
                db.upsert_contribution(
                    issue.id,
                    None,
                    "fix/issue-42",
                    Some("https://github.com/acme/widget/pull/7"),
                    Some(7),
                    &ContributionStatus::PrOpen,
                    None,
                )?;
                Ok(issue.id)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_merge_event_applies() {
        let state = test_state_with_secret(Some(SECRET));
        let issue_id = seed_contribution(&state).await;
        let app = test_router(state.clone());

        let body = merged_close_body();
        let signature = sign_body(SECRET, body.as_bytes());
        let resp = app
            .oneshot(event_request(&body, Some(&signature)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let result: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(result["outcome"], "applied");

        let issue = state
            .db
            .call(move |db| db.get_issue(issue_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(issue.status, IssueStatus::Fixed);
    }

    #[tokio::test]
    async fn test_bad_signature_is_401_with_no_state_change() {
        let state = test_state_with_secret(Some(SECRET));
        let issue_id = seed_contribution(&state).await;
        let app = test_router(state.clone());

        let body = merged_close_body();
        let signature = sign_body("wrong-secret", body.as_bytes());
        let resp = app
            .oneshot(event_request(&body, Some(&signature)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // No webhook row, no issue/contribution mutation.
        let (hooks, issue) = state
            .db
            .call(move |db| Ok((db.list_webhooks()?, db.get_issue(issue_id)?)))
            .await
            .unwrap();
        assert!(hooks.is_empty());
        assert_eq!(issue.unwrap().status, IssueStatus::PrOpen);
    }

    #[tokio::test]
    async fn test_missing_signature_is_401() {
        let state = test_state_with_secret(Some(SECRET));
        let app = test_router(state);
        let resp = app
            .oneshot(event_request(&merged_close_body(), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_secret_configuration_is_500() {
        let state = test_state_with_secret(None);
        let app = test_router(state);
        let body = merged_close_body();
        let signature = sign_body(SECRET, body.as_bytes());
        let resp = app
            .oneshot(event_request(&body, Some(&signature)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_invalid_json_after_valid_signature_is_400() {
        let state = test_state_with_secret(Some(SECRET));
        let app = test_router(state);
        let body = "this is not json";
        let signature = sign_body(SECRET, body.as_bytes());
        let resp = app
            .oneshot(event_request(body, Some(&signature)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unroutable_event_stored_and_listed() {
        let state = test_state_with_secret(Some(SECRET));
        let app = test_router(state.clone());
        let body = serde_json::json!({
            "action": "closed",
            "pull_request": {
                "html_url": "https://github.com/acme/widget/pull/999",
                "number": 999,
                "merged": true
            }
        })
        .to_string();
        let signature = sign_body(SECRET, body.as_bytes());
        let resp = app
            .clone()
            .oneshot(event_request(&body, Some(&signature)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let result: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(result["outcome"], "unroutable");

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/webhooks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let hooks: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(hooks.as_array().unwrap().len(), 1);
        assert_eq!(hooks[0]["processed"], false);
    }
}
