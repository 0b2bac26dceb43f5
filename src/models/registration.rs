use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An account registration awaiting email verification.
///
/// Created and verified by the account service; this crate only reclaims
/// rows whose verification window lapsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub id: i64,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl PendingRegistration {
    /// Unverified and past its verification window.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.verified_at.is_none() && self.expires_at < now
    }
}
