//! Identity boundary.
//!
//! Sign-in itself happens at an external OAuth provider; the library only
//! builds the authorize URL, holds the resulting access token, and turns it
//! into a [`UserId`]. Anything that cannot produce an identity reports
//! [`AuthError::Unauthenticated`], which the view treats as "redirect to
//! sign-in".

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::errors::AuthError;
use crate::types::session::UserId;

/// Where the view sends users without an identity.
pub const SIGN_IN_PATH: &str = "/login";

/// Bearer token issued by the identity provider. Wiped from memory on drop
/// and never printed by `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Decodes the JWT payload without verifying the signature. Verification
    /// is the backend's job; this is only used to learn who we are.
    pub fn claims(&self) -> Result<TokenClaims, AuthError> {
        parse_claims(&self.0)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Claims the client cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub subject: String,
    pub email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenClaims {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[derive(Deserialize)]
struct RawClaims {
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

/// Parses the payload segment of a JWT.
pub fn parse_claims(jwt: &str) -> Result<TokenClaims, AuthError> {
    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::InvalidToken("JWT must have 3 parts".into()));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| AuthError::InvalidToken(format!("base64 decode failed: {}", e)))?;
    let raw: RawClaims = serde_json::from_slice(&payload)
        .map_err(|e| AuthError::InvalidToken(format!("JSON parse failed: {}", e)))?;

    let subject = raw
        .sub
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::InvalidToken("missing sub claim".into()))?;
    let expires_at = match raw.exp {
        Some(secs) => Some(
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| AuthError::InvalidToken(format!("bad exp claim: {}", secs)))?,
        ),
        None => None,
    };

    Ok(TokenClaims {
        subject,
        email: raw.email,
        expires_at,
    })
}

/// Source of the current user's identity.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Result<UserId, AuthError>;

    /// Token to revoke on sign-out, if the identity came from one.
    fn access_token(&self) -> Option<&AccessToken> {
        None
    }
}

/// Fixed identity, for the embedded backend and tests.
pub struct StaticIdentity(Option<UserId>);

impl StaticIdentity {
    pub fn signed_in(user: UserId) -> Self {
        Self(Some(user))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Result<UserId, AuthError> {
        self.0.clone().ok_or(AuthError::Unauthenticated)
    }
}

/// Identity read from a held access token. An expired token counts as
/// signed out.
pub struct TokenIdentity {
    token: AccessToken,
    claims: TokenClaims,
}

impl TokenIdentity {
    pub fn new(token: AccessToken) -> Result<Self, AuthError> {
        let claims = token.claims()?;
        Ok(Self { token, claims })
    }

    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }
}

impl IdentityProvider for TokenIdentity {
    fn current_user(&self) -> Result<UserId, AuthError> {
        if self.claims.is_expired_at(Utc::now()) {
            return Err(AuthError::Unauthenticated);
        }
        Ok(UserId::new(self.claims.subject.clone()))
    }

    fn access_token(&self) -> Option<&AccessToken> {
        Some(&self.token)
    }
}

/// User record returned by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// HTTP client for the hosted identity provider (`/auth/v1/*`).
pub struct AuthClient {
    client: Client,
    base_url: Url,
    anon_key: String,
}

impl AuthClient {
    pub fn new(base_url: &str, anon_key: &str, timeout: Duration) -> Result<Self, AuthError> {
        let mut base_url = Url::parse(base_url).map_err(|e| AuthError::Provider(format!("bad auth url: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            anon_key: anon_key.to_string(),
        })
    }

    /// Browser URL that starts the OAuth flow with `provider` and returns
    /// to `redirect_to` afterwards.
    pub fn authorize_url(&self, provider: &str, redirect_to: &str) -> Result<Url, AuthError> {
        let mut url = self.endpoint("auth/v1/authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("redirect_to", redirect_to);
        Ok(url)
    }

    /// Resolves a token to the user it belongs to. A rejected token is
    /// `Unauthenticated`.
    pub async fn fetch_user(&self, token: &AccessToken) -> Result<AuthUser, AuthError> {
        let response = self
            .client
            .get(self.endpoint("auth/v1/user")?)
            .header("apikey", &self.anon_key)
            .header(AUTHORIZATION, format!("Bearer {}", token.expose()))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let user: AuthUser = response
                    .json()
                    .await
                    .map_err(|e| AuthError::Provider(format!("invalid user response: {}", e)))?;
                debug!(user = %user.id, "resolved access token");
                Ok(user)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Unauthenticated),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(AuthError::Provider(format!("status {}: {}", status, text)))
            }
        }
    }

    /// Revokes the session behind `token`. An already-invalid token is
    /// treated as signed out.
    pub async fn sign_out(&self, token: &AccessToken) -> Result<(), AuthError> {
        let mut url = self.endpoint("auth/v1/logout")?;
        url.query_pairs_mut().append_pair("scope", "local");
        let response = self
            .client
            .post(url)
            .header("apikey", &self.anon_key)
            .header(AUTHORIZATION, format!("Bearer {}", token.expose()))
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND {
            info!("signed out");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(AuthError::Provider(format!("status {}: {}", status, text)))
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path)
            .map_err(|e| AuthError::Provider(format!("bad auth endpoint '{}': {}", path, e)))
    }
}
