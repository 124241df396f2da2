// src/api/auth.rs
//! API-key authentication, permission checks and per-key rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};
use chrono::Utc;
use tracing::{debug, warn};

use super::{ApiError, ApiResult, AppState};
use crate::db::api_keys;
use crate::models::AgentApiKey;

pub const SIGNALS_READ: &str = "signals:read";
pub const SIGNALS_WRITE: &str = "signals:write";
pub const SOURCES_READ: &str = "sources:read";
pub const SOURCES_WRITE: &str = "sources:write";
pub const READER_USE: &str = "reader:use";

/// Key from `Authorization: Bearer <key>` or `x-api-key: <key>`.
pub fn presented_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    bearer
        .or(api_key)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// Resolve and rate-limit the caller's key. Permission checks are separate
/// so MCP can report them per tool.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<AgentApiKey> {
    let secret = presented_key(headers)
        .ok_or_else(|| ApiError::Unauthorized("missing api key".into()))?;
    let key = api_keys::find_by_secret(&state.pool, &secret)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("invalid api key".into()))?;

    if !key.enabled {
        debug!(target: "api", key = %key.key_prefix, "disabled key rejected");
        return Err(ApiError::Unauthorized("api key disabled".into()));
    }
    if key.is_expired(Utc::now()) {
        debug!(target: "api", key = %key.key_prefix, "expired key rejected");
        return Err(ApiError::Unauthorized("api key expired".into()));
    }
    if !state.limiter.check(key.id) {
        warn!(target: "api", key = %key.key_prefix, "rate limit exceeded");
        return Err(ApiError::RateLimited);
    }
    if let Err(e) = api_keys::touch_last_used(&state.pool, key.id).await {
        warn!(target: "api", key = %key.key_prefix, error = %e, "touch last_used failed");
    }
    Ok(key)
}

pub fn require(key: &AgentApiKey, permission: &str) -> ApiResult<()> {
    if key.allows(permission) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!("missing permission: {permission}")))
    }
}

/// `authenticate` followed by `require`.
pub async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    permission: &str,
) -> ApiResult<AgentApiKey> {
    let key = authenticate(state, headers).await?;
    require(&key, permission)?;
    Ok(key)
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter per key id. A limit of 0 disables it.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<i64, Window>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Count one request for `key_id`; false when over the limit.
    pub fn check(&self, key_id: i64) -> bool {
        self.check_at(key_id, Instant::now())
    }

    pub fn check_at(&self, key_id: i64, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut map = self.windows.lock().unwrap_or_else(|poisoned| {
            warn!(target: "api", "rate limiter lock poisoned; recovering");
            poisoned.into_inner()
        });
        let window = self.window;
        map.retain(|_, w| now.saturating_duration_since(w.started) < window);
        let w = map.entry(key_id).or_insert(Window {
            started: now,
            count: 0,
        });
        if w.count >= self.limit {
            return false;
        }
        w.count += 1;
        true
    }

    /// Keys with a live window.
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_wins_over_header_and_blank_is_missing() {
        let mut h = HeaderMap::new();
        assert_eq!(presented_key(&h), None);
        h.insert("x-api-key", HeaderValue::from_static("sb_header"));
        assert_eq!(presented_key(&h).as_deref(), Some("sb_header"));
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sb_bearer"));
        assert_eq!(presented_key(&h).as_deref(), Some("sb_bearer"));

        let mut blank = HeaderMap::new();
        blank.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(presented_key(&blank), None);
    }

    #[test]
    fn fixed_window_limits_per_key_and_resets() {
        let rl = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(rl.check_at(1, t0));
        assert!(rl.check_at(1, t0));
        assert!(!rl.check_at(1, t0 + Duration::from_secs(10)));
        // other keys have their own window
        assert!(rl.check_at(2, t0));
        assert!(rl.check_at(1, t0 + Duration::from_secs(61)));
    }

    #[test]
    fn expired_windows_are_dropped() {
        let rl = RateLimiter::new(5, Duration::from_secs(60));
        let t0 = Instant::now();
        for key in 1..=3 {
            assert!(rl.check_at(key, t0));
        }
        assert_eq!(rl.tracked_keys(), 3);
        assert!(rl.check_at(4, t0 + Duration::from_secs(61)));
        assert_eq!(rl.tracked_keys(), 1);
    }

    #[test]
    fn poisoned_lock_keeps_limiting() {
        let rl = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(rl.check_at(9, t0));
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = rl.windows.lock().unwrap();
            panic!("poison the limiter");
        }));
        assert!(poisoned.is_err());
        assert!(rl.windows.is_poisoned());
        assert!(!rl.check_at(9, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let rl = RateLimiter::per_minute(0);
        assert!((0..1000).all(|_| rl.check(7)));
    }
}
