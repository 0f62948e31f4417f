use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

use crate::store::{run_blocking, BlacklistEntry};
use crate::workers::refresh_blacklist;
use crate::AppState;

use super::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddBlacklistRequest {
    pub ip: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// 0 or absent blocks permanently
    #[serde(default)]
    pub duration_hours: i64,
}

#[derive(Debug, Serialize)]
pub struct BlacklistCheck {
    pub ip: String,
    pub blocked: bool,
}

#[derive(Debug, Serialize)]
pub struct RefreshResult {
    pub active: usize,
}

fn parse_ip(raw: &str) -> Result<String, ApiError> {
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| ApiError::BadRequest(format!("invalid IP address: {raw}")))
}

/// Reload the cache after a mutation. The mutation already committed, so a
/// failure here is logged rather than returned.
async fn sync_cache(state: &Arc<AppState>) {
    if let Ok(store) = state.persistence.store() {
        if let Err(e) = refresh_blacklist(state, &store).await {
            tracing::warn!(error = %e, "blacklist cache refresh failed");
        }
    }
}

// ─── GET /api/blacklist ──────────────────────────────────────────

pub async fn list_blacklist(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BlacklistEntry>>, ApiError> {
    let store = state.persistence.store()?;
    let entries = run_blocking(state.query.deadline(), move || store.list_blacklist()).await?;
    Ok(Json(entries))
}

// ─── POST /api/blacklist ─────────────────────────────────────────

pub async fn add_blacklist(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddBlacklistRequest>,
) -> Result<(StatusCode, Json<BlacklistEntry>), ApiError> {
    let ip = parse_ip(&req.ip)?;
    if req.duration_hours < 0 {
        return Err(ApiError::BadRequest("durationHours must be >= 0".into()));
    }

    let store = state.persistence.store()?;
    let entry = run_blocking(state.query.deadline(), move || {
        store.add_blacklist(
            &ip,
            req.reason.as_deref(),
            req.duration_hours,
            chrono::Utc::now().timestamp(),
        )
    })
    .await?;

    tracing::info!(ip = %entry.ip, expires_at = entry.expires_at, "blacklist entry added");
    sync_cache(&state).await;
    Ok((StatusCode::CREATED, Json(entry)))
}

// ─── DELETE /api/blacklist/:ip ───────────────────────────────────

pub async fn remove_blacklist(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Result<StatusCode, ApiError> {
    let ip = parse_ip(&ip)?;
    let store = state.persistence.store()?;
    let target = ip.clone();
    let removed =
        run_blocking(state.query.deadline(), move || store.remove_blacklist(&target)).await?;
    if !removed {
        return Err(ApiError::NotFound(format!("{ip} is not blacklisted")));
    }

    tracing::info!(ip = %ip, "blacklist entry removed");
    sync_cache(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

// ─── GET /api/blacklist/:ip ──────────────────────────────────────

/// Answered from the in-memory cache only.
pub async fn check_blacklist(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Result<Json<BlacklistCheck>, ApiError> {
    let ip = parse_ip(&ip)?;
    let blocked = state.blacklist.is_blocked(&ip);
    Ok(Json(BlacklistCheck { ip, blocked }))
}

// ─── POST /api/blacklist/refresh ─────────────────────────────────

pub async fn refresh(State(state): State<Arc<AppState>>) -> Result<Json<RefreshResult>, ApiError> {
    let store = state.persistence.store()?;
    let active = refresh_blacklist(&state, &store).await?;
    Ok(Json(RefreshResult { active }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_ip_addresses() {
        assert_eq!(parse_ip(" 10.0.0.1 ").unwrap(), "10.0.0.1");
        assert_eq!(parse_ip("2001:DB8::1").unwrap(), "2001:db8::1");
        assert!(parse_ip("not-an-ip").is_err());
    }
}
