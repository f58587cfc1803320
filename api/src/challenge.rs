use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use warden_core::actor::ActorIdentity;

type HmacSha256 = Hmac<Sha256>;

/// Verifies challenge tokens on the hot path.
///
/// The challenge frontend (an external collaborator) runs the actual
/// captcha with its provider and, on success, mints a token for the solved
/// actor via the issuance endpoint. The gate then clears captcha-level
/// short-circuits by checking the token locally — no network round-trip
/// per request.
///
/// Token format: `base64url("<actor>|<unix-expiry>") . hex(hmac-sha256)`,
/// keyed by `WARDEN_CHALLENGE_SECRET`. A token is bound to one actor and
/// one expiry instant.
#[derive(Clone)]
pub struct ChallengeVerifier {
    secret: Option<Vec<u8>>,
}

impl ChallengeVerifier {
    pub fn from_env() -> Self {
        let secret = std::env::var("WARDEN_CHALLENGE_SECRET")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(String::into_bytes);
        if secret.is_none() {
            tracing::warn!(
                "WARDEN_CHALLENGE_SECRET not configured; captcha-level mitigations will hard-challenge every request"
            );
        }
        Self { secret }
    }

    #[cfg(test)]
    pub fn with_secret(secret: &str) -> Self {
        Self {
            secret: Some(secret.as_bytes().to_vec()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Mint a token for an actor that just passed the external challenge.
    pub fn issue(&self, actor: &ActorIdentity, ttl: Duration) -> Option<(String, DateTime<Utc>)> {
        let secret = self.secret.as_deref()?;
        let expires_at = Utc::now() + ttl;
        let payload = format!("{actor}|{}", expires_at.timestamp());
        let mac = sign(secret, payload.as_bytes());
        let token = format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), hex::encode(mac));
        Some((token, expires_at))
    }

    /// Check a presented token: intact signature, unexpired, and bound to
    /// the actor under mitigation. Any malformation is just "invalid".
    pub fn verify(&self, token: &str, actor: &ActorIdentity) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            return false;
        };
        let Some((payload_b64, mac_hex)) = token.split_once('.') else {
            return false;
        };
        let Ok(payload) = URL_SAFE_NO_PAD.decode(payload_b64) else {
            return false;
        };
        let Ok(mac) = hex::decode(mac_hex) else {
            return false;
        };
        let Ok(mut verifier) = HmacSha256::new_from_slice(secret) else {
            return false;
        };
        verifier.update(&payload);
        if verifier.verify_slice(&mac).is_err() {
            return false;
        }

        let Ok(payload) = String::from_utf8(payload) else {
            return false;
        };
        let Some((token_actor, expiry)) = payload.rsplit_once('|') else {
            return false;
        };
        let Ok(expiry) = expiry.parse::<i64>() else {
            return false;
        };
        token_actor == actor.to_string() && expiry > Utc::now().timestamp()
    }
}

fn sign(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .expect("hmac-sha256 accepts keys of any length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}
