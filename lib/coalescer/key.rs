use std::fmt;

use sha2::{Digest, Sha256};

use crate::accounts::Account;
use crate::insights::DayWindow;

/// Hex digest of `salt` and `token`, truncated. Raw tokens never enter cache keys.
pub fn token_fingerprint(salt: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    hex::encode(&hasher.finalize()[..12])
}

/// Identity of one cacheable read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub mode: &'static str,
    pub account_id: String,
    pub page_id: String,
    pub window: DayWindow,
    pub token_fingerprint: String,
}

impl CacheKey {
    pub fn new(
        mode: &'static str,
        account: &Account,
        window: DayWindow,
        token_fingerprint: String,
    ) -> Self {
        Self {
            mode,
            account_id: account.account_id.clone(),
            page_id: account.page_id.clone(),
            window,
            token_fingerprint,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}..{}:{}",
            self.mode,
            self.account_id,
            self.page_id,
            self.window.since,
            self.window.until,
            self.token_fingerprint
        )
    }
}
