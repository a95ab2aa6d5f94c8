use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use chrono::{DateTime, Duration, Utc};
use hmac_sha256::HMAC;
use log::debug;
use reqwest::blocking::Client;
use serde::Deserialize;
use url::Url;

use crate::error::AuthError;

pub const EXPIRY_MARGIN_SECS: i64 = 60;

const MAX_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// Hands out bearer tokens for an account.
pub trait TokenSource: Send + Sync {
    fn acquire(&self, account: &str, secret: &str) -> Result<String, AuthError>;
}

/// Exchanges account credentials for a fresh token.
pub trait IdentityProvider: Send + Sync {
    fn exchange(&self, username: &str, password: &str) -> Result<IssuedToken, AuthError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: i64
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64
}

/// OAuth2 password-grant client for a single tenant.
pub struct IdentityClient {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    scope: String
}

impl IdentityClient {

    pub fn new(http: Client, token_url: Url, client_id: &str, client_secret: &str, scopes: &[String]) -> Self {
        Self {
            http,
            token_url,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scope: scopes.join(" ")
        }
    }

}

impl IdentityProvider for IdentityClient {

    fn exchange(&self, username: &str, password: &str) -> Result<IssuedToken, AuthError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
            ("username", username),
            ("password", password),
            ("grant_type", "password"),
        ];

        let res = self.http
            .post(self.token_url.clone())
            .form(&params)
            .send()?;

        let status = res.status();
        let body = res.text()?;

        if !status.is_success() {
            return Err(AuthError::Rejected { status, body });
        }

        let token: TokenResponse = match serde_json::from_str(&body) {
            Ok(token) => token,
            Err(source) => return Err(AuthError::Malformed { source, body })
        };

        if token.access_token.is_empty() {
            return Err(AuthError::MissingToken { body });
        }

        debug!("OAuth2 token retrieved for {username}, expires in {}s", token.expires_in);

        Ok(IssuedToken {
            access_token: token.access_token,
            expires_in: token.expires_in
        })
    }

}

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
    credential: [u8; 32]
}

/// Per-account token cache shared by every connection.
///
/// Entries are swapped whole under the write lock, so a reader sees either
/// the old token and expiry or the new ones. Concurrent misses for the same
/// account each go to the provider and the last one to finish wins.
pub struct TokenCache<P> {
    provider: P,
    entries: RwLock<HashMap<String, Arc<CachedToken>>>,
    digest_key: [u8; 16]
}

impl<P: IdentityProvider> TokenCache<P> {

    pub fn new(provider: P) -> Self {
        Self {
            provider,
            entries: RwLock::new(HashMap::new()),
            digest_key: *uuid::Uuid::new_v4().as_bytes()
        }
    }

    fn acquire_at(&self, now: DateTime<Utc>, account: &str, secret: &str) -> Result<String, AuthError> {
        let credential = self.digest(secret);

        let cached = self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account)
            .cloned();

        if let Some(entry) = cached {
            if now < entry.expires_at && entry.credential == credential {
                debug!("Using cached OAuth2 token for {account}, expires at {}", entry.expires_at);
                return Ok(entry.token.clone());
            }
        }

        let issued = self.provider.exchange(account, secret)?;
        let lifetime = issued.expires_in.clamp(0, MAX_LIFETIME_SECS) - EXPIRY_MARGIN_SECS;
        let entry = Arc::new(CachedToken {
            token: issued.access_token,
            expires_at: now + Duration::seconds(lifetime),
            credential
        });

        debug!("New OAuth2 token cached for {account}, expires at {}", entry.expires_at);

        let token = entry.token.clone();

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.to_string(), entry);

        Ok(token)
    }

    // Keyed so the map never holds a plain hash of a password.
    fn digest(&self, secret: &str) -> [u8; 32] {
        let mut hmac = HMAC::new(self.digest_key);

        hmac.update(secret.as_bytes());
        hmac.finalize()
    }

}

impl<P: IdentityProvider> TokenSource for TokenCache<P> {

    fn acquire(&self, account: &str, secret: &str) -> Result<String, AuthError> {
        self.acquire_at(Utc::now(), account, secret)
    }

}
