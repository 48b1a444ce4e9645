use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

/// Action every composite request token is bound to.
pub const COMPOSITE_ACTION: &str = "generate_composite_image";

/// Issues and verifies time-bucketed HMAC tokens. A token stays valid for the
/// tick it was issued in and the following one, so between one half and one
/// full lifetime.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Arc<str>,
    half_life_secs: u64,
}

impl TokenSigner {
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self {
            secret: Arc::from(secret),
            half_life_secs: (lifetime.as_secs() / 2).max(1),
        }
    }

    pub fn issue(&self, action: &str) -> String {
        self.issue_at(action, unix_now())
    }

    pub fn verify(&self, token: &str, action: &str) -> bool {
        self.verify_at(token, action, unix_now())
    }

    fn issue_at(&self, action: &str, now: u64) -> String {
        self.sign(self.tick(now), action)
    }

    fn verify_at(&self, token: &str, action: &str, now: u64) -> bool {
        let token = token.trim();
        if token.is_empty() {
            return false;
        }
        let tick = self.tick(now);
        [tick, tick.saturating_sub(1)].iter().any(|candidate| {
            let expected = self.sign(*candidate, action);
            bool::from(expected.as_bytes().ct_eq(token.as_bytes()))
        })
    }

    fn tick(&self, now: u64) -> u64 {
        now.div_ceil(self.half_life_secs)
    }

    fn sign(&self, tick: u64, action: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .expect("hmac can take key of any size");
        mac.update(format!("{tick}|{action}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
