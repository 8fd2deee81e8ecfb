//! CDN-fronted delivery URLs.
//!
//! When a CDN edge sits in front of the bucket, read URLs are issued as
//! `{base}/{key}?token={payload}.{signature}` where the payload is a
//! base64url JSON [`DeliveryToken`] and the signature is HMAC-SHA256 over the
//! payload. The edge verifies the token with the shared secret.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed expiry (7 days) to prevent long-lived URL leakage.
pub const MAX_EXPIRY_SECS: u64 = 604_800;

/// CDN delivery configuration.
#[derive(Debug, Clone)]
pub struct CdnConfig {
    /// Public base URL of the edge, e.g. `https://cdn.example.com`
    pub base_url: String,
    /// Secret shared with the edge for HMAC signing
    pub signing_secret: String,
}

impl CdnConfig {
    /// Read `CDN_BASE_URL` and `CDN_SIGNING_SECRET`; both must be set.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("CDN_BASE_URL").ok().filter(|s| !s.is_empty())?;
        let signing_secret = std::env::var("CDN_SIGNING_SECRET")
            .ok()
            .filter(|s| !s.is_empty())?;
        Some(Self {
            base_url,
            signing_secret,
        })
    }
}

/// Signed claim that `key` may be read until `exp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryToken {
    /// Object key
    pub key: String,
    /// Expiry timestamp (Unix seconds)
    pub exp: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl DeliveryToken {
    /// Create a token valid for `ttl`, clamped to [`MAX_EXPIRY_SECS`].
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            exp: now_secs() + ttl.as_secs().min(MAX_EXPIRY_SECS),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_secs() >= self.exp
    }

    /// Sign the token with HMAC-SHA256.
    pub fn sign(&self, secret: &str) -> StorageResult<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| StorageError::presign_failed(format!("token encoding: {}", e)))?;
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| StorageError::config_error(format!("Invalid HMAC key: {}", e)))?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!("{}.{}", payload, URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Verify a signed token.
    ///
    /// Returns `None` for malformed, tampered or expired tokens.
    pub fn verify(signed: &str, secret: &str) -> StorageResult<Option<Self>> {
        let Some((payload, sig_encoded)) = signed.split_once('.') else {
            return Ok(None);
        };
        let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(sig_encoded) else {
            return Ok(None);
        };

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| StorageError::config_error(format!("Invalid HMAC key: {}", e)))?;
        mac.update(payload.as_bytes());
        if mac.verify_slice(&sig_bytes).is_err() {
            return Ok(None);
        }

        let token = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<DeliveryToken>(&bytes).ok());

        Ok(token.filter(|t| !t.is_expired()))
    }
}

/// Issues CDN URLs carrying a signed [`DeliveryToken`].
#[derive(Debug, Clone)]
pub struct CdnSigner {
    config: CdnConfig,
}

impl CdnSigner {
    pub fn new(config: CdnConfig) -> Self {
        Self { config }
    }

    /// Signed URL for `key` valid for `ttl`.
    pub fn sign_url(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        let token = DeliveryToken::new(key, ttl).sign(&self.config.signing_secret)?;
        let path = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/{}?token={}",
            self.config.base_url.trim_end_matches('/'),
            path,
            token
        ))
    }

    /// Verify a token taken from a URL issued by [`CdnSigner::sign_url`].
    pub fn verify(&self, token: &str) -> StorageResult<Option<DeliveryToken>> {
        DeliveryToken::verify(token, &self.config.signing_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> CdnSigner {
        CdnSigner::new(CdnConfig {
            base_url: "https://cdn.example.com/".to_string(),
            signing_secret: "secret".to_string(),
        })
    }

    #[test]
    fn test_sign_and_verify() {
        let token = DeliveryToken::new("videos/a/hls/master.m3u8", Duration::from_secs(60));
        let signed = token.sign("secret").unwrap();
        let verified = DeliveryToken::verify(&signed, "secret").unwrap();
        assert_eq!(verified, Some(token));
        assert_eq!(DeliveryToken::verify(&signed, "other").unwrap(), None);
    }

    #[test]
    fn test_tampered_and_malformed_tokens_rejected() {
        let signed = DeliveryToken::new("k", Duration::from_secs(60))
            .sign("secret")
            .unwrap();
        let forged = DeliveryToken::new("other", Duration::from_secs(60))
            .sign("secret")
            .unwrap();
        let (_, sig) = signed.split_once('.').unwrap();
        let (payload, _) = forged.split_once('.').unwrap();
        let spliced = format!("{}.{}", payload, sig);
        assert_eq!(DeliveryToken::verify(&spliced, "secret").unwrap(), None);
        assert_eq!(DeliveryToken::verify("garbage", "secret").unwrap(), None);
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = DeliveryToken {
            key: "k".into(),
            exp: 1,
        };
        let signed = token.sign("secret").unwrap();
        assert_eq!(DeliveryToken::verify(&signed, "secret").unwrap(), None);
    }

    #[test]
    fn test_ttl_is_clamped() {
        let token = DeliveryToken::new("k", Duration::from_secs(MAX_EXPIRY_SECS * 10));
        assert!(token.exp <= now_secs() + MAX_EXPIRY_SECS);
    }

    #[test]
    fn test_sign_url_shape() {
        let signer = signer();
        let url = signer
            .sign_url("videos/a b/hls/master.m3u8", Duration::from_secs(3600))
            .unwrap();
        assert!(url.starts_with("https://cdn.example.com/videos/a%20b/hls/master.m3u8?token="));
        let token = url.split_once("?token=").unwrap().1;
        let verified = signer.verify(token).unwrap().unwrap();
        assert_eq!(verified.key, "videos/a b/hls/master.m3u8");
    }
}
