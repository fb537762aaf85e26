//! Dispatch auth tokens.
//!
//! The scheduler stamps each envelope with HMAC-SHA256(app key, job id),
//! hex-encoded. The router echoes the token back with the webhook call and
//! the processing side validates it by recomputation, so a forged envelope
//! cannot trigger deliveries.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("App key is not configured")]
    AppKeyNotConfigured,
    #[error("Invalid auth token")]
    InvalidToken,
}

#[derive(Clone)]
pub struct DispatchAuth {
    app_key: Option<String>,
}

impl DispatchAuth {
    pub fn new(app_key: Option<String>) -> Self {
        Self {
            app_key: app_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.app_key.is_some()
    }

    /// Hex-encoded HMAC-SHA256 token scoped to one job id.
    pub fn generate_token(&self, job_id: &str) -> Result<String, AuthError> {
        let key = self.app_key.as_ref().ok_or(AuthError::AppKeyNotConfigured)?;

        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(job_id.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time token validation.
    pub fn validate_token(&self, job_id: &str, token: &str) -> Result<(), AuthError> {
        if token.is_empty() || job_id.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        let expected = self.generate_token(job_id)?;
        if expected.as_bytes().ct_eq(token.as_bytes()).into() {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let auth = DispatchAuth::new(Some("test-secret-key".to_string()));
        let token = auth.generate_token("0HZXEQ5Y8JY5Z").unwrap();
        assert_eq!(token.len(), 64);

        assert!(auth.validate_token("0HZXEQ5Y8JY5Z", &token).is_ok());
        assert!(auth.validate_token("0HZXEQ5Y8JY5Z", "wrong").is_err());
        assert!(auth.validate_token("OTHER-JOB", &token).is_err());
    }

    #[test]
    fn unconfigured_key_rejected() {
        assert!(DispatchAuth::new(None).generate_token("j").is_err());
        assert!(!DispatchAuth::new(Some(String::new())).is_configured());
    }

    #[test]
    fn tokens_are_deterministic() {
        let auth = DispatchAuth::new(Some("secret".to_string()));
        assert_eq!(
            auth.generate_token("job1").unwrap(),
            auth.generate_token("job1").unwrap()
        );
    }
}
