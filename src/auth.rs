//! Bearer token providers.
//!
//! The engine asks for a token once per connection attempt (and per request
//! in the HTTP polling client). `OidcAuthenticator` caches the token and
//! refreshes it one minute before it expires.

use crate::error::{Result, VaasError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Refresh a cached token this long before it expires
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Timeout for one token endpoint request
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn get_token(&self) -> Result<String>;
}

/// Fixed token, for tests and for callers that manage tokens themselves.
#[derive(Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl Authenticator for StaticToken {
    async fn get_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// OAuth grant used against the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum Grant {
    ClientCredentials {
        client_id: String,
        client_secret: String,
    },
    Password {
        client_id: String,
        user_name: String,
        password: String,
    },
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Grant::ClientCredentials { client_id, .. } => f
                .debug_struct("ClientCredentials")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Grant::Password {
                client_id,
                user_name,
                ..
            } => f
                .debug_struct("Password")
                .field("client_id", client_id)
                .field("user_name", user_name)
                .finish_non_exhaustive(),
        }
    }
}

impl Grant {
    fn form(&self) -> Vec<(&'static str, &str)> {
        match self {
            Grant::ClientCredentials {
                client_id,
                client_secret,
            } => vec![
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ],
            Grant::Password {
                client_id,
                user_name,
                password,
            } => vec![
                ("client_id", client_id.as_str()),
                ("username", user_name.as_str()),
                ("password", password.as_str()),
                ("grant_type", "password"),
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

struct CachedToken {
    access_token: String,
    expires: Instant,
}

impl CachedToken {
    fn should_refresh(&self) -> bool {
        Instant::now() + REFRESH_MARGIN >= self.expires
    }
}

/// Token provider for an OpenID Connect token endpoint.
pub struct OidcAuthenticator {
    http: reqwest::Client,
    token_url: String,
    grant: Grant,
    cached: Mutex<Option<CachedToken>>,
}

impl OidcAuthenticator {
    pub fn new(grant: Grant, token_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VaasError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            token_url: token_url.into(),
            grant,
            cached: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<CachedToken> {
        tracing::debug!(endpoint = %self.token_url, "requesting access token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&self.grant.form())
            .send()
            .await
            .map_err(|e| VaasError::AuthenticationFailed(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| VaasError::AuthenticationFailed(e.to_string()))?;

        if !status.is_success() {
            let message = match serde_json::from_slice::<TokenErrorResponse>(&body) {
                Ok(err) if err.error_description.is_empty() => err.error,
                Ok(err) => format!("{}: {}", err.error, err.error_description),
                Err(_) => format!("token endpoint returned {}", status),
            };
            return Err(VaasError::AuthenticationFailed(message));
        }

        let token: TokenResponse = serde_json::from_slice(&body).map_err(|e| {
            VaasError::AuthenticationFailed(format!("invalid token response: {}", e))
        })?;

        Ok(CachedToken {
            access_token: token.access_token,
            expires: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    async fn get_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if !token.should_refresh() {
                return Ok(token.access_token.clone());
            }
        }
        let token = self.fetch().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Form, Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/token", addr)
    }

    #[tokio::test]
    async fn test_static_token() {
        let auth = StaticToken("abc".into());
        assert_eq!(auth.get_token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_client_credentials_token_is_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(form.get("grant_type").map(String::as_str), Some("client_credentials"));
                    assert_eq!(form.get("client_id").map(String::as_str), Some("id"));
                    Json(serde_json::json!({ "access_token": "tok", "expires_in": 300 }))
                }
            }),
        );
        let url = serve(router).await;

        let auth = OidcAuthenticator::new(
            Grant::ClientCredentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
            },
            url,
        )
        .unwrap();

        assert_eq!(auth.get_token().await.unwrap(), "tok");
        assert_eq!(auth.get_token().await.unwrap(), "tok");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_lived_token_is_refreshed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/token",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "access_token": "tok", "expires_in": 30 }))
                }
            }),
        );
        let url = serve(router).await;
        let auth = OidcAuthenticator::new(
            Grant::Password {
                client_id: "vaas-customer".into(),
                user_name: "u".into(),
                password: "p".into(),
            },
            url,
        )
        .unwrap();

        auth.get_token().await.unwrap();
        auth.get_token().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let router = Router::new().route(
            "/token",
            post(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({
                        "error": "unauthorized_client",
                        "error_description": "Invalid client secret"
                    })),
                )
            }),
        );
        let url = serve(router).await;
        let auth = OidcAuthenticator::new(
            Grant::ClientCredentials {
                client_id: "id".into(),
                client_secret: "wrong".into(),
            },
            url,
        )
        .unwrap();

        match auth.get_token().await {
            Err(VaasError::AuthenticationFailed(msg)) => {
                assert_eq!(msg, "unauthorized_client: Invalid client secret");
            }
            other => panic!("expected AuthenticationFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_grant_debug_hides_secrets() {
        let grant = Grant::ClientCredentials {
            client_id: "id".into(),
            client_secret: "hunter2".into(),
        };
        assert!(!format!("{:?}", grant).contains("hunter2"));
    }
}
