//! Access-token cache for the Firestore client.
//!
//! Tokens are refreshed ahead of expiry under a write lock so concurrent
//! callers share one refresh. If a refresh fails while the old token has
//! not yet expired, the old token keeps being served.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use gcp_auth::TokenProvider;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{FirestoreError, FirestoreResult};

/// Refresh this long before the provider-reported expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed when the provider's expiry cannot be converted.
const FALLBACK_TTL: Duration = Duration::from_secs(50 * 60);

/// OAuth scope granting Firestore REST access.
pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }

    fn usable(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct TokenCache {
    provider: Arc<dyn TokenProvider>,
    slot: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            slot: RwLock::new(None),
        }
    }

    /// Drop the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }

    pub async fn get_token(&self) -> FirestoreResult<String> {
        if let Some(cached) = self.slot.read().await.as_ref() {
            if cached.fresh(Instant::now()) {
                return Ok(cached.value.clone());
            }
        }

        let mut slot = self.slot.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = slot.as_ref() {
            if cached.fresh(Instant::now()) {
                return Ok(cached.value.clone());
            }
        }

        match self.provider.token(&[FIRESTORE_SCOPE]).await {
            Ok(token) => {
                let remaining = token.expires_at() - Utc::now();
                let ttl = if remaining > chrono::Duration::zero() {
                    remaining.to_std().unwrap_or(FALLBACK_TTL)
                } else {
                    Duration::ZERO
                };
                let value = token.as_str().to_string();
                *slot = Some(CachedToken {
                    value: value.clone(),
                    expires_at: Instant::now() + ttl,
                });
                debug!(ttl_secs = ttl.as_secs(), "Refreshed Firestore access token");
                Ok(value)
            }
            Err(e) => match slot.as_ref() {
                Some(cached) if cached.usable(Instant::now()) => {
                    warn!(error = %e, "Token refresh failed, serving cached token");
                    Ok(cached.value.clone())
                }
                _ => Err(FirestoreError::auth_error(format!("Failed to obtain auth token: {}", e))),
            },
        }
    }
}
