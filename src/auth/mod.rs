//! Bearer-token authentication and password hashing.
//!
//! Tokens are `base64url(claims_json).base64url(signature)` where the
//! signature is Ed25519 over the encoded claims. The signing key is derived
//! from the configured secret, so every instance sharing the secret accepts
//! the same tokens.

pub mod extract;

pub use extract::{AdminAffiliate, AuthAffiliate};

use crate::db::Repository;
use crate::domain::{Affiliate, AffiliateId, AffiliateStatus, TimeMs};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error};

const DAY_MS: i64 = 86_400_000;
const HASH_SCHEME: &str = "sha256";
const HASH_ITERATIONS: u32 = 20_000;
const SALT_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("account is not allowed to sign in")]
    AccountUnavailable,
    #[error("admin role required")]
    Forbidden,
    #[error("affiliate lookup failed: {0}")]
    Lookup(#[from] sqlx::Error),
}

/// Claims carried by a token. Status is a snapshot and is revalidated on use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: AffiliateId,
    pub email: String,
    pub status: AffiliateStatus,
    pub iat: TimeMs,
    pub exp: TimeMs,
}

/// Issues and verifies bearer tokens.
#[derive(Clone)]
pub struct TokenSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    ttl_ms: i64,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("ttl_ms", &self.ttl_ms)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: &str, ttl_days: i64) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        let signing_key = SigningKey::from_bytes(&seed);

        Self {
            verifying_key: signing_key.verifying_key(),
            signing_key,
            ttl_ms: ttl_days.saturating_mul(DAY_MS),
        }
    }

    pub fn issue(&self, affiliate: &Affiliate) -> String {
        self.issue_at(affiliate, TimeMs::now())
    }

    /// Issue a token as if the current time were `now`.
    pub fn issue_at(&self, affiliate: &Affiliate, now: TimeMs) -> String {
        let claims = Claims {
            sub: affiliate.id.clone(),
            email: affiliate.email.clone(),
            status: affiliate.status,
            iat: now,
            exp: TimeMs::new(now.as_ms().saturating_add(self.ttl_ms)),
        };
        // Serializing a plain struct of strings and integers cannot fail.
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
        let signature = self.signing_key.sign(payload.as_bytes());
        format!("{}.{}", payload, URL_SAFE_NO_PAD.encode(signature.to_bytes()))
    }

    pub fn verify(&self, token: &str, now: TimeMs) -> Result<Claims, AuthError> {
        let (payload, signature) = token.split_once('.').ok_or(AuthError::Malformed)?;

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| AuthError::Malformed)?;
        self.verifying_key
            .verify(payload.as_bytes(), &signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&claims_bytes).map_err(|_| AuthError::Malformed)?;

        if claims.exp <= now {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

/// Resolve the calling affiliate from an `Authorization` header value.
///
/// The token only names the account. Its current status is read from the
/// store and deleted, suspended or rejected accounts are refused.
pub async fn authenticate(
    repo: &Repository,
    signer: &TokenSigner,
    authorization: Option<&str>,
) -> Result<Affiliate, AuthError> {
    let token = authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;

    let claims = signer.verify(token, TimeMs::now())?;
    let affiliate = repo
        .get_affiliate(&claims.sub)
        .await?
        .ok_or(AuthError::AccountUnavailable)?;

    if !affiliate.status.may_sign_in() {
        debug!(affiliate_id = %affiliate.id, status = %affiliate.status, "Rejected token for unavailable account");
        return Err(AuthError::AccountUnavailable);
    }
    Ok(affiliate)
}

/// Re-read the caller and require the admin role. Any lookup failure denies.
pub async fn require_admin(repo: &Repository, caller: &Affiliate) -> Result<Affiliate, AuthError> {
    let current = match repo.get_affiliate(&caller.id).await {
        Ok(Some(current)) => current,
        Ok(None) => return Err(AuthError::AccountUnavailable),
        Err(e) => {
            error!(affiliate_id = %caller.id, error = %e, "Admin check failed");
            return Err(AuthError::Lookup(e));
        }
    };

    if !current.is_admin() || !current.status.may_sign_in() {
        return Err(AuthError::Forbidden);
    }
    Ok(current)
}

/// Hash a password as `sha256$<iterations>$<salt hex>$<hash hex>`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = derive(&salt, password, HASH_ITERATIONS);
    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        HASH_ITERATIONS,
        hex::encode(salt),
        hex::encode(hash)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != HASH_SCHEME {
        return false;
    }
    let (Ok(iterations), Ok(salt), Ok(expected)) = (
        iterations.parse::<u32>(),
        hex::decode(salt),
        hex::decode(expected),
    ) else {
        return false;
    };
    if iterations == 0 {
        return false;
    }

    constant_time_eq(&derive(&salt, password, iterations), &expected)
}

fn derive(salt: &[u8], password: &str, iterations: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());

    for _ in 1..iterations {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(out);
        out.copy_from_slice(&hasher.finalize());
    }
    out
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
