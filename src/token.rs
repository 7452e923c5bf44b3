//! Scan tokens.
//!
//! A scan token is an HS256 JWT asserting that a file, identified by name and
//! size, went through the scanner. Claims: `name`, `size`, `safe`, `iat`,
//! `exp`. Tokens are stateless; a token stays usable until it expires.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TokenConfig;
use crate::error::{ConfigError, TokenError};

/// Lifetime of a scan token in seconds.
pub const TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    name: String,
    size: u64,
    safe: bool,
    iat: i64,
    exp: i64,
}

/// Decoded scan token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustToken {
    /// Name of the scanned file.
    pub filename: String,
    /// Size of the scanned file in bytes.
    pub size: u64,
    /// Whether the file was scanned and found clean.
    pub safe: bool,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
    /// When the token stops being accepted.
    pub expires_at: DateTime<Utc>,
}

impl TrustToken {
    /// Build token contents issued at `now`, truncated to whole seconds.
    pub fn new(filename: impl Into<String>, size: u64, safe: bool, now: DateTime<Utc>) -> Self {
        let issued_at = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        Self {
            filename: filename.into(),
            size,
            safe,
            issued_at,
            expires_at: issued_at + Duration::seconds(TOKEN_TTL_SECS),
        }
    }

    /// A token is expired from the instant `expires_at` is reached.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the token was issued for this exact file.
    pub fn matches(&self, filename: &str, size: u64) -> bool {
        self.filename == filename && self.size == size
    }

    fn claims(&self) -> Claims {
        Claims {
            name: self.filename.clone(),
            size: self.size,
            safe: self.safe,
            iat: self.issued_at.timestamp(),
            exp: self.expires_at.timestamp(),
        }
    }

    fn from_claims(claims: Claims) -> Result<Self, TokenError> {
        let timestamp = |secs: i64| {
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| TokenError::Malformed(format!("timestamp out of range: {secs}")))
        };
        Ok(Self {
            filename: claims.name,
            size: claims.size,
            safe: claims.safe,
            issued_at: timestamp(claims.iat)?,
            expires_at: timestamp(claims.exp)?,
        })
    }
}

/// Issues and verifies scan tokens with the process-wide secret.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    /// Create a signer from the configured secret.
    pub fn new(config: &TokenConfig) -> Result<Self, ConfigError> {
        if config.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }

        let secret = config.secret.as_bytes();

        // Expiry is checked against an explicit clock in `verify_at`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Issue a token for a file that was just scanned.
    pub fn issue(&self, filename: &str, size: u64, safe: bool) -> Result<String, TokenError> {
        self.issue_at(filename, size, safe, Utc::now())
    }

    /// Issue a token as of `now`.
    pub fn issue_at(
        &self,
        filename: &str,
        size: u64,
        safe: bool,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let token = TrustToken::new(filename, size, safe, now);
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &token.claims(), &self.encoding)
            .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    /// Check the signature and decode the token without any other check.
    pub fn decode(&self, token: &str) -> Result<TrustToken, TokenError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed(e.to_string()),
            })?;
        TrustToken::from_claims(data.claims)
    }

    /// Verify a presented token against the file being uploaded.
    pub fn verify(&self, token: &str, filename: &str, size: u64) -> Result<TrustToken, TokenError> {
        self.verify_at(token, filename, size, Utc::now())
    }

    /// Verify as of `now`. Checks run in order: signature, expiry, safe flag,
    /// file identity.
    pub fn verify_at(
        &self,
        token: &str,
        filename: &str,
        size: u64,
        now: DateTime<Utc>,
    ) -> Result<TrustToken, TokenError> {
        let decoded = self.decode(token)?;

        if decoded.is_expired_at(now) {
            debug!(expires_at = %decoded.expires_at, "Scan token expired");
            return Err(TokenError::Expired);
        }

        if !decoded.safe {
            return Err(TokenError::Unsafe);
        }

        if !decoded.matches(filename, size) {
            debug!(
                token_name = %decoded.filename,
                token_size = decoded.size,
                filename = %filename,
                size = size,
                "Scan token issued for another file"
            );
            return Err(TokenError::FileMismatch);
        }

        Ok(decoded)
    }

    /// Boolean form of [`TokenSigner::verify`].
    pub fn is_trusted(&self, token: &str, filename: &str, size: u64) -> bool {
        self.verify(token, filename, size).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(secret: &str) -> TokenSigner {
        TokenSigner::new(&TokenConfig {
            secret: secret.to_string(),
        })
        .unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let signer = signer("secret");
        let token = signer.issue("a.txt", 100, true).unwrap();

        let decoded = signer.verify(&token, "a.txt", 100).unwrap();
        assert_eq!(decoded.filename, "a.txt");
        assert_eq!(decoded.size, 100);
        assert!(decoded.safe);
        assert!(signer.is_trusted(&token, "a.txt", 100));
    }

    #[test]
    fn test_expiry_is_one_hour_after_issue() {
        let token = TrustToken::new("a.txt", 100, true, at(1_700_000_000));
        assert_eq!(token.expires_at - token.issued_at, Duration::seconds(3600));
    }

    #[test]
    fn test_rejected_after_ttl() {
        let signer = signer("secret");
        let issued = at(1_700_000_000);
        let token = signer.issue_at("a.txt", 100, true, issued).unwrap();

        let later = issued + Duration::seconds(TOKEN_TTL_SECS + 1);
        assert_eq!(
            signer.verify_at(&token, "a.txt", 100, later),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_rejected_exactly_at_expiry() {
        let signer = signer("secret");
        let issued = at(1_700_000_000);
        let token = signer.issue_at("a.txt", 100, true, issued).unwrap();

        let expiry = issued + Duration::seconds(TOKEN_TTL_SECS);
        assert_eq!(
            signer.verify_at(&token, "a.txt", 100, expiry),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_accepted_just_before_expiry() {
        let signer = signer("secret");
        let issued = at(1_700_000_000);
        let token = signer.issue_at("a.txt", 100, true, issued).unwrap();

        let almost = issued + Duration::seconds(TOKEN_TTL_SECS - 1);
        assert!(signer.verify_at(&token, "a.txt", 100, almost).is_ok());
    }

    #[test]
    fn test_unsafe_token_never_trusted() {
        let signer = signer("secret");
        let token = signer.issue("a.txt", 100, false).unwrap();

        assert_eq!(
            signer.verify(&token, "a.txt", 100),
            Err(TokenError::Unsafe)
        );
        assert!(!signer.is_trusted(&token, "a.txt", 100));
    }

    #[test]
    fn test_bound_to_filename_and_size() {
        let signer = signer("secret");
        let token = signer.issue("a.txt", 100, true).unwrap();

        assert_eq!(
            signer.verify(&token, "b.txt", 100),
            Err(TokenError::FileMismatch)
        );
        assert_eq!(
            signer.verify(&token, "a.txt", 200),
            Err(TokenError::FileMismatch)
        );
    }

    #[test]
    fn test_replay_within_ttl() {
        let signer = signer("secret");
        let token = signer.issue("a.txt", 100, true).unwrap();

        assert!(signer.is_trusted(&token, "a.txt", 100));
        assert!(signer.is_trusted(&token, "a.txt", 100));
    }

    #[test]
    fn test_other_secret_rejected() {
        let token = signer("secret").issue("a.txt", 100, true).unwrap();

        assert_eq!(
            signer("other").verify(&token, "a.txt", 100),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_swapped_payload_rejected() {
        let signer = signer("secret");
        let unsafe_token = signer.issue("a.txt", 100, false).unwrap();
        let safe_token = signer.issue("a.txt", 100, true).unwrap();

        // Payload of the safe token with the signature of the unsafe one.
        let unsafe_parts: Vec<&str> = unsafe_token.split('.').collect();
        let safe_parts: Vec<&str> = safe_token.split('.').collect();
        let forged = format!("{}.{}.{}", unsafe_parts[0], safe_parts[1], unsafe_parts[2]);

        assert_eq!(
            signer.verify(&forged, "a.txt", 100),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_garbage_rejected() {
        let signer = signer("secret");
        assert!(matches!(
            signer.verify("not-a-token", "a.txt", 100),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_secret_refused() {
        let result = TokenSigner::new(&TokenConfig::default());
        assert!(matches!(result, Err(ConfigError::MissingSecret)));
    }
}
