//! Supabase Auth (GoTrue) as the session's authentication service.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::client::{build_http_client, SupabaseEndpoint};
use super::ApiError;
use crate::auth::{AccessToken, AuthError, AuthProvider, Credential, RefreshError, Renewal, UserIdentity};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Unix seconds
    #[serde(default)]
    expires_at: Option<i64>,
    user: TokenUser,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl TokenResponse {
    /// `None` when the service sent no expiry or one outside chrono's range.
    fn expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| {
                self.expires_in
                    .and_then(Duration::try_seconds)
                    .and_then(|ttl| now.checked_add_signed(ttl))
            })
    }
}

/// GoTrue error bodies vary by endpoint and version.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

fn error_message(body: &str) -> String {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    parsed
        .error_description
        .or(parsed.msg)
        .or(parsed.message)
        .or(parsed.error)
        .unwrap_or_else(|| ApiError::truncate_body(body))
}

#[derive(Clone)]
pub struct SupabaseAuth {
    client: Client,
    endpoint: SupabaseEndpoint,
}

impl SupabaseAuth {
    pub fn new(endpoint: SupabaseEndpoint) -> Result<Self, ApiError> {
        Ok(Self::with_client(build_http_client()?, endpoint))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, endpoint: SupabaseEndpoint) -> Self {
        Self { client, endpoint }
    }

    async fn token_request(
        &self,
        grant_type: &str,
        body: &serde_json::Value,
    ) -> Result<Response, reqwest::Error> {
        let url = self.endpoint.auth_url("token");
        debug!(url = %url, grant_type = grant_type, "Requesting token");

        self.client
            .post(&url)
            .query(&[("grant_type", grant_type)])
            .header("apikey", self.endpoint.anon_key())
            .json(body)
            .send()
            .await
    }

    async fn password_grant(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        let body = json!({ "email": email, "password": password });
        let response = self
            .token_request("password", &body)
            .await
            .map_err(auth_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(auth_transport_error)?;

        if !status.is_success() {
            let message = error_message(&text);
            warn!(status = %status, "Password sign-in rejected");
            return Err(match status {
                StatusCode::BAD_REQUEST
                | StatusCode::UNAUTHORIZED
                | StatusCode::FORBIDDEN
                | StatusCode::UNPROCESSABLE_ENTITY => AuthError::InvalidCredentials(message),
                StatusCode::TOO_MANY_REQUESTS => AuthError::Service(format!("rate limited: {message}")),
                _ => AuthError::Service(format!("HTTP {status}: {message}")),
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&text).map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
        let expires_at = token
            .expiry(Utc::now())
            .ok_or_else(|| AuthError::MalformedResponse("invalid token expiry".to_string()))?;

        Ok(Credential {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at,
            identity: UserIdentity {
                id: token.user.id,
                email: token.user.email,
            },
        })
    }

    async fn refresh_grant(&self, current: &Credential) -> Result<Renewal, RefreshError> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| RefreshError::Revoked("no refresh token available".to_string()))?;

        let body = json!({ "refresh_token": refresh_token });
        let response = self
            .token_request("refresh_token", &body)
            .await
            .map_err(refresh_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(refresh_transport_error)?;

        if !status.is_success() {
            let message = error_message(&text);
            warn!(status = %status, "Token refresh rejected");
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    RefreshError::Revoked(message)
                }
                _ => RefreshError::Service(format!("HTTP {status}: {message}")),
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&text).map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;
        let expires_at = token
            .expiry(Utc::now())
            .ok_or_else(|| RefreshError::MalformedResponse("invalid token expiry".to_string()))?;

        if token.user.id != current.identity.id {
            return Err(RefreshError::MalformedResponse(
                "renewed token belongs to a different user".to_string(),
            ));
        }

        Ok(Renewal {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at,
        })
    }

    /// Revoke the session server-side. Best effort: local sign-out does not
    /// depend on it.
    pub async fn logout(&self, access_token: &AccessToken) -> Result<(), ApiError> {
        let url = self.endpoint.auth_url("logout");
        let response = self
            .client
            .post(&url)
            .header("apikey", self.endpoint.anon_key())
            .bearer_auth(access_token.as_str())
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}

impl AuthProvider for SupabaseAuth {
    fn authenticate<'a>(
        &'a self,
        identifier: &'a str,
        secret: &'a str,
    ) -> BoxFuture<'a, Result<Credential, AuthError>> {
        self.password_grant(identifier, secret).boxed()
    }

    fn renew<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, Result<Renewal, RefreshError>> {
        self.refresh_grant(current).boxed()
    }
}

fn auth_transport_error(e: reqwest::Error) -> AuthError {
    if e.is_timeout() {
        AuthError::Timeout
    } else {
        AuthError::Network(e.to_string())
    }
}

fn refresh_transport_error(e: reqwest::Error) -> RefreshError {
    if e.is_timeout() {
        RefreshError::Timeout
    } else {
        RefreshError::Network(e.to_string())
    }
}
