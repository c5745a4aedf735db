//! Signed access tokens
//!
//! Compact JWS tokens signed with HMAC-SHA256 (`HS256`), claims `{sub, iat, exp}`.
//! Verification is a pure function of `(token, now, secret)`: the server keeps no
//! session table and has no revocation list, so expiry is the only invalidation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::AuthError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

impl Header {
    fn hs256() -> Self {
        Self {
            alg: ALGORITHM.to_string(),
            typ: Some("JWT".to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    iat: i64,
    exp: i64,
}

/// An issued token together with its decoded claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub subject: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// The encoded `header.claims.signature` string handed to the caller
    pub encoded: String,
}

/// Issues and verifies tokens with a server-held symmetric secret
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
    lifetime: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("secret", &"<redacted>")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl TokenIssuer {
    pub fn new(secret: impl Into<Vec<u8>>, lifetime: Duration) -> Self {
        Self {
            secret: secret.into(),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Issue a token for `subject` expiring one lifetime from now
    pub fn issue(&self, subject: &str) -> Result<AccessToken, AuthError> {
        self.issue_at(subject, Utc::now())
    }

    /// Issue a token as if the current time were `now`
    pub fn issue_at(&self, subject: &str, now: DateTime<Utc>) -> Result<AccessToken, AuthError> {
        let issued_at = truncate_to_seconds(now);
        let expires_at = issued_at + self.lifetime;
        let claims = Claims {
            sub: Some(subject.to_string()),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        let header = encode_segment(&Header::hs256())?;
        let payload = encode_segment(&claims)?;
        let signing_input = format!("{}.{}", header, payload);
        let signature = self.sign(&signing_input)?;

        Ok(AccessToken {
            subject: subject.to_string(),
            issued_at,
            expires_at,
            encoded: format!("{}.{}", signing_input, signature),
        })
    }

    /// Verify `token` against the current time and return its subject
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify `token` as of `now` and return its subject.
    ///
    /// Signature is checked before any claim is trusted; the token is expired
    /// from the instant `now >= exp`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let mut parts = token.split('.');
        let (header, payload, signature) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None) => (h, p, s),
                _ => return Err(AuthError::Malformed),
            };

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;
        self.mac(format!("{}.{}", header, payload).as_bytes())?
            .verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let header: Header = decode_segment(header)?;
        if header.alg != ALGORITHM {
            return Err(AuthError::InvalidSignature);
        }

        let claims: Claims = decode_segment(payload)?;
        if now.timestamp() >= claims.exp {
            return Err(AuthError::Expired);
        }

        match claims.sub {
            Some(sub) if !sub.is_empty() => Ok(sub),
            _ => Err(AuthError::MissingSubject),
        }
    }

    fn sign(&self, signing_input: &str) -> Result<String, AuthError> {
        let tag = self.mac(signing_input.as_bytes())?.finalize().into_bytes();
        Ok(URL_SAFE_NO_PAD.encode(tag))
    }

    fn mac(&self, data: &[u8]) -> Result<HmacSha256, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        mac.update(data);
        Ok(mac)
    }
}

fn truncate_to_seconds(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now)
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, AuthError> {
    let json = serde_json::to_vec(value).map_err(|e| AuthError::Signing(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("test-secret", Duration::minutes(30))
    }

    #[test]
    fn test_issue_then_verify() {
        let issuer = issuer();
        let token = issuer.issue("agent_user").unwrap();
        assert_eq!(token.expires_at - token.issued_at, Duration::minutes(30));
        assert_eq!(issuer.verify(&token.encoded).unwrap(), "agent_user");
    }

    #[test]
    fn test_expiry_boundary() {
        let issuer = issuer();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let token = issuer.issue_at("agent_user", now).unwrap();

        let just_before = now + Duration::minutes(30) - Duration::seconds(1);
        assert!(issuer.verify_at(&token.encoded, just_before).is_ok());
        assert!(issuer.verify_at(&token.encoded, now).is_ok());

        let at_expiry = now + Duration::minutes(30);
        assert!(matches!(
            issuer.verify_at(&token.encoded, at_expiry),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn test_tokens_differ_over_time() {
        let issuer = issuer();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let a = issuer.issue_at("agent_user", now).unwrap();
        let b = issuer.issue_at("agent_user", now + Duration::seconds(5)).unwrap();
        let c = issuer.issue_at("agent_user", now).unwrap();
        assert_ne!(a.encoded, b.encoded);
        assert_eq!(a.encoded, c.encoded);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let issuer = issuer();
        let token = issuer.issue("agent_user").unwrap();
        let parts: Vec<&str> = token.encoded.split('.').collect();

        let forged_claims = Claims {
            sub: Some("admin".to_string()),
            iat: 0,
            exp: i64::MAX,
        };
        let forged = format!(
            "{}.{}.{}",
            parts[0],
            encode_segment(&forged_claims).unwrap(),
            parts[2]
        );
        assert!(matches!(
            issuer.verify(&forged),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issuer().issue("agent_user").unwrap();
        let other = TokenIssuer::new("other-secret", Duration::minutes(30));
        assert!(matches!(
            other.verify(&token.encoded),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_missing_subject() {
        let issuer = issuer();
        let claims = Claims {
            sub: None,
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 60,
        };
        let signing_input = format!(
            "{}.{}",
            encode_segment(&Header::hs256()).unwrap(),
            encode_segment(&claims).unwrap()
        );
        let signature = issuer.sign(&signing_input).unwrap();
        let token = format!("{}.{}", signing_input, signature);

        assert!(matches!(
            issuer.verify(&token),
            Err(AuthError::MissingSubject)
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let issuer = issuer();
        assert!(matches!(issuer.verify("not-a-token"), Err(AuthError::Malformed)));
        assert!(matches!(issuer.verify("a.b.c.d"), Err(AuthError::Malformed)));
        assert!(matches!(issuer.verify("a.b.!!!"), Err(AuthError::Malformed)));
    }
}
