use anyhow::{anyhow, bail, Context};
use courier_common::types::UserId;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{IdentityError, IdentityVerifier};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    exp: i64,
}

/// HS256 bearer tokens whose `sub` claim is the decimal user id.
#[derive(Clone)]
pub struct JwtIdentityVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_token(&self, user_id: UserId) -> anyhow::Result<String> {
        self.issue_token_at(user_id, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, user_id: UserId, issued_at: i64) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            iat: Some(issued_at),
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }
}

impl IdentityVerifier for JwtIdentityVerifier {
    fn verify(&self, credential: &str) -> Result<UserId, IdentityError> {
        let claims = decode::<AccessTokenClaims>(credential, &self.decoding_key, &self.validation)
            .map_err(|error| match error.kind() {
                ErrorKind::ExpiredSignature => IdentityError::Expired,
                _ => IdentityError::Invalid,
            })?
            .claims;

        claims.sub.parse::<UserId>().map_err(|_| IdentityError::Invalid)
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, JwtIdentityVerifier, ACCESS_TOKEN_TTL_SECONDS};
    use crate::auth::{IdentityError, IdentityVerifier};
    use courier_common::types::UserId;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;

    const TEST_SECRET: &str = "courier_test_secret_that_is_definitely_long_enough";

    #[test]
    fn rejects_short_secrets() {
        assert!(JwtIdentityVerifier::new("too-short").is_err());
    }

    #[test]
    fn issues_and_verifies_tokens() {
        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = verifier.issue_token(UserId(42)).expect("token should be issued");

        assert_eq!(verifier.verify(&token), Ok(UserId(42)));
    }

    #[test]
    fn rejects_tampered_tokens() {
        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = verifier.issue_token(UserId(1)).expect("token should be issued");

        assert_eq!(verifier.verify(&format!("{token}x")), Err(IdentityError::Invalid));
        assert_eq!(verifier.verify("not-a-jwt"), Err(IdentityError::Invalid));
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let issuer = JwtIdentityVerifier::new("another_secret_that_is_also_long_enough_for_hs256")
            .expect("issuer should initialize");
        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = issuer.issue_token(UserId(3)).expect("token should be issued");

        assert_eq!(verifier.verify(&token), Err(IdentityError::Invalid));
    }

    #[test]
    fn rejects_expired_tokens() {
        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token =
            verifier.issue_token_at(UserId(5), issued_at).expect("token should be issued");

        assert_eq!(verifier.verify(&token), Err(IdentityError::Expired));
    }

    #[test]
    fn rejects_tokens_with_non_numeric_subject() {
        #[derive(Serialize)]
        struct InvalidSubjectClaims {
            sub: &'static str,
            iat: i64,
            exp: i64,
        }

        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let claims = InvalidSubjectClaims {
            sub: "alice@example.com",
            iat: now,
            exp: now + ACCESS_TOKEN_TTL_SECONDS,
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert_eq!(verifier.verify(&token), Err(IdentityError::Invalid));
    }

    #[test]
    fn verifies_tokens_without_iat() {
        #[derive(Serialize)]
        struct MinimalClaims {
            sub: &'static str,
            exp: i64,
        }

        let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token = encode(
            &Header::new(Algorithm::HS256),
            &MinimalClaims { sub: "7", exp: now + 600 },
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert_eq!(verifier.verify(&token), Ok(UserId(7)));
    }
}
