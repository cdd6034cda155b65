//! OAuth2 client-credentials token cache shared by the HTTP-family
//! protocols.
//!
//! Tokens are cached per client id and reused until their server-declared
//! lifetime passes; a refreshed token replaces the cache entry atomically.
//! Access to the cache is serialized.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use utcp_core::OAuth2Auth;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at.map_or(true, |expiry| Instant::now() < expiry)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Default)]
pub struct OAuth2TokenCache {
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl OAuth2TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a bearer token for `auth`, fetching one when the cache has
    /// no fresh entry for the client id.
    pub async fn bearer_token(
        &self,
        client: &reqwest::Client,
        auth: &OAuth2Auth,
    ) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        if let Some(cached) = tokens.get(&auth.client_id) {
            if cached.is_fresh() {
                return Ok(cached.access_token.clone());
            }
            debug!(client_id = %auth.client_id, "cached OAuth2 token expired");
        }

        let fetched = fetch_token(client, auth).await?;
        tokens.insert(auth.client_id.clone(), fetched.clone());
        Ok(fetched.access_token)
    }
}

/// Fetch a token with the credentials in the form body; some providers
/// only accept them in a basic-auth header, so that is tried second.
async fn fetch_token(client: &reqwest::Client, auth: &OAuth2Auth) -> Result<CachedToken> {
    let mut form = vec![
        ("grant_type", "client_credentials"),
        ("client_id", auth.client_id.as_str()),
        ("client_secret", auth.client_secret.as_str()),
    ];
    if let Some(scope) = &auth.scope {
        form.push(("scope", scope.as_str()));
    }

    let response = client
        .post(&auth.token_url)
        .form(&form)
        .send()
        .await
        .with_context(|| format!("cannot reach OAuth2 token endpoint '{}'", auth.token_url))?;

    let response = if response.status().is_success() {
        response
    } else {
        debug!(
            status = %response.status(),
            "token endpoint rejected body credentials, retrying with basic auth"
        );
        let mut form = vec![("grant_type", "client_credentials")];
        if let Some(scope) = &auth.scope {
            form.push(("scope", scope.as_str()));
        }
        let retry = client
            .post(&auth.token_url)
            .basic_auth(&auth.client_id, Some(&auth.client_secret))
            .form(&form)
            .send()
            .await
            .with_context(|| {
                format!("cannot reach OAuth2 token endpoint '{}'", auth.token_url)
            })?;
        if !retry.status().is_success() {
            return Err(anyhow!(
                "OAuth2 token request to '{}' failed with status {}",
                auth.token_url,
                retry.status()
            ));
        }
        retry
    };

    let token: TokenResponse = response
        .json()
        .await
        .context("OAuth2 token endpoint returned an invalid response")?;
    Ok(CachedToken {
        access_token: token.access_token,
        expires_at: token
            .expires_in
            .map(|seconds| Instant::now() + Duration::from_secs(seconds)),
    })
}
