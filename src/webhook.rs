//! Provider event reconciliation.
//!
//! Inbound events are verified against the shared secret before parsing:
//! the HMAC-SHA256 of the raw request body must match the
//! `x-hub-signature-256` header. Verified events are stored for audit and,
//! for `pull_request` events, applied to contribution and issue state.

use anyhow::Result;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::db::models::{ContributionStatus, IssueStatus, Webhook};
use crate::db::UcoderDb;
use crate::runner::logs::pr_number_from_url;

type HmacSha256 = Hmac<Sha256>;

/// Verify a `sha256=<hex>` signature over the raw body. Comparison is
/// constant-time via the MAC verifier; buffer-length mismatches are
/// rejected before any byte comparison happens.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Sign a body the way the provider does (tests, outbound simulation).
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// What applying an event did, echoed back to the sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Contribution (and possibly issue) state advanced.
    Applied,
    /// Stored for audit; the action carries no state change.
    Stored,
    /// No contribution matched the PR; stored for later reconciliation.
    Unroutable,
}

/// Store a verified event and apply `pull_request` semantics. The raw
/// payload is persisted even when nothing matches.
pub fn apply_event(
    db: &UcoderDb,
    event_type: &str,
    payload: &serde_json::Value,
    raw_body: &str,
) -> Result<(EventOutcome, Webhook)> {
    let action = payload.get("action").and_then(|a| a.as_str());

    if event_type != "pull_request" {
        let hook = db.insert_webhook(None, event_type, action, raw_body)?;
        return Ok((EventOutcome::Stored, hook));
    }

    let pr = payload.get("pull_request");
    let pr_url = pr
        .and_then(|p| p.get("html_url"))
        .and_then(|u| u.as_str())
        .map(str::to_string);
    let pr_number = pr
        .and_then(|p| p.get("number"))
        .and_then(|n| n.as_i64())
        .or_else(|| pr_url.as_deref().and_then(pr_number_from_url));
    let merged = pr
        .and_then(|p| p.get("merged"))
        .and_then(|m| m.as_bool())
        .unwrap_or(false);

    let contribution = db.find_contribution_by_pr(pr_url.as_deref(), pr_number)?;
    let Some(contribution) = contribution else {
        let hook = db.insert_webhook(None, event_type, action, raw_body)?;
        return Ok((EventOutcome::Unroutable, hook));
    };

    let hook = db.insert_webhook(Some(contribution.id), event_type, action, raw_body)?;
    let outcome = match action {
        Some("closed") if merged => {
            db.update_contribution_status(contribution.id, &ContributionStatus::Merged)?;
            db.set_issue_status(contribution.issue_id, &IssueStatus::Fixed)?;
            EventOutcome::Applied
        }
        Some("closed") => {
            db.update_contribution_status(contribution.id, &ContributionStatus::Closed)?;
            EventOutcome::Applied
        }
        _ => EventOutcome::Stored,
    };
    let hook = db.mark_webhook_processed(hook.id)?;
    Ok((outcome, hook))
}
