//! Pending confirmation tokens.
//!
//! A `RequireConfirmation` decision stores a short base62 token bound to the
//! request hash. The caller obtains operator approval and resubmits the same
//! request with the token; the token is consumed on first successful use.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use super::action::DenyCode;

/// Length of generated confirmation tokens.
const TOKEN_LEN: usize = 8;

/// Base62 alphabet used for tokens.
const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// A token waiting to be redeemed.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    /// Token value.
    pub token: String,
    /// Hash of the request it was issued for.
    pub request_hash: String,
    /// When it was issued.
    pub issued_at: DateTime<Utc>,
    /// When it stops being accepted.
    pub expires_at: DateTime<Utc>,
}

/// Token store.
///
/// Uses a sync [`Mutex`] since the critical section is brief (no awaits).
#[derive(Debug)]
pub struct ConfirmationStore {
    pending: Mutex<HashMap<String, PendingConfirmation>>,
}

impl Default for ConfirmationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a token for `request_hash` valid for `ttl`.
    pub fn issue(&self, request_hash: String, ttl: Duration) -> PendingConfirmation {
        let now = Utc::now();
        let pending = PendingConfirmation {
            token: generate_base62_token(),
            request_hash,
            issued_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(now),
        };
        if let Ok(mut map) = self.pending.lock() {
            map.insert(pending.token.clone(), pending.clone());
        }
        pending
    }

    /// Redeem `token` for `request_hash`.
    ///
    /// A token presented with the wrong request stays pending so the
    /// legitimate request can still use it. Expired tokens are removed.
    ///
    /// # Errors
    ///
    /// Returns the deny code describing why the token was not accepted.
    pub fn redeem(&self, token: &str, request_hash: &str) -> Result<(), DenyCode> {
        let mut map = self
            .pending
            .lock()
            .map_err(|_| DenyCode::ConfirmationInvalid)?;

        let Some(entry) = map.remove(token) else {
            return Err(DenyCode::ConfirmationInvalid);
        };

        if entry.request_hash != request_hash {
            map.insert(token.to_owned(), entry);
            return Err(DenyCode::ConfirmationMismatch);
        }

        if Utc::now() >= entry.expires_at {
            return Err(DenyCode::ConfirmationExpired);
        }

        Ok(())
    }

    /// Withdraw an issued token. Returns whether it was pending.
    pub fn revoke(&self, token: &str) -> bool {
        self.pending
            .lock()
            .map(|mut map| map.remove(token).is_some())
            .unwrap_or(false)
    }

    /// Remove all expired tokens, returning how many were dropped.
    pub fn gc_expired(&self) -> usize {
        let Ok(mut map) = self.pending.lock() else {
            return 0;
        };
        let before = map.len();
        let now = Utc::now();
        map.retain(|_, v| v.expires_at > now);
        before.saturating_sub(map.len())
    }

    /// Number of tokens currently pending.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Generate an 8-character base62 token.
fn generate_base62_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..BASE62_CHARS.len());
            char::from(BASE62_CHARS.get(idx).copied().unwrap_or(b'0'))
        })
        .collect()
}
