//! HTTP client for the sync endpoints.
//!
//! Push/pull only; everything else the app needs happens against local
//! state. Server rejection codes are matched on the response body, never
//! inferred from transport errors, so an offline client can never be
//! mistaken for a rejected one.

use crate::error::SyncError;
use serde_json::Value;
use std::time::Duration;

/// Body marker the server sends with a 403 when the pushed events are
/// not permitted. Only this exact code triggers the drop-and-revert path.
pub const PERMISSION_DENIED_CODE: &str = "TALLY_PERMISSION_DENIED";

/// Body marker for a declined session; the client clears its token.
pub const AUTH_DECLINED_CODE: &str = "TALLY_AUTH_DECLINED";

pub(crate) struct ApiClient {
    http: reqwest::Client,
}

impl ApiClient {
    pub(crate) fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self { http }
    }

    /// GET /api/sync/events[?since=...] — events the server has that we
    /// may not, oldest first.
    pub(crate) async fn pull_events(
        &self,
        base_url: &str,
        token: &str,
        since: Option<&str>,
    ) -> Result<Vec<Value>, SyncError> {
        let url = format!("{}/api/sync/events", base_url);
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(s) = since {
            query.push(("since", s));
        }
        let resp = self
            .http
            .get(&url)
            .query(&query)
            .bearer_auth(token)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify_rejection(status.as_u16(), &text));
        }
        let events: Vec<Value> = serde_json::from_str(&text)
            .map_err(|e| SyncError::Rejected { status: status.as_u16(), body: format!("bad pull body: {}", e) })?;
        Ok(events)
    }

    /// POST /api/sync/events — returns the ids the server accepted.
    pub(crate) async fn push_events(
        &self,
        base_url: &str,
        token: &str,
        events: &[Value],
    ) -> Result<Vec<String>, SyncError> {
        let url = format!("{}/api/sync/events", base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&events)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify_rejection(status.as_u16(), &text));
        }
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| SyncError::Rejected { status: status.as_u16(), body: format!("bad push body: {}", e) })?;
        let accepted = body
            .get("accepted")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        Ok(accepted)
    }
}

fn classify_rejection(status: u16, body: &str) -> SyncError {
    if status == 403 && body.contains(PERMISSION_DENIED_CODE) {
        // Dropped count is filled in by the sync engine once it knows it.
        return SyncError::PermissionDenied { dropped: 0 };
    }
    if status == 401 || body.contains(AUTH_DECLINED_CODE) {
        return SyncError::AuthDeclined;
    }
    SyncError::Rejected { status, body: body.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_code_only_matches_exact_body_marker() {
        assert!(matches!(
            classify_rejection(403, "{\"error\":\"TALLY_PERMISSION_DENIED\"}"),
            SyncError::PermissionDenied { .. }
        ));
        // A plain 403 without the marker is an ordinary rejection.
        assert!(matches!(
            classify_rejection(403, "forbidden"),
            SyncError::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn unauthorized_maps_to_auth_declined() {
        assert!(matches!(classify_rejection(401, ""), SyncError::AuthDeclined));
        assert!(matches!(
            classify_rejection(400, "TALLY_AUTH_DECLINED"),
            SyncError::AuthDeclined
        ));
    }

    #[test]
    fn rate_limit_stays_retryable() {
        let err = classify_rejection(429, "too many requests");
        assert!(err.is_retryable());
    }
}
