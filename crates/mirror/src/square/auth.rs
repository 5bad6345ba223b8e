//! OAuth token refresh
//!
//! Uses synchronous HTTP (ureq) so it can run on any thread.

use anyhow::{Context, Result};
use serde_json::json;

use super::{API_VERSION, BASE_URL};
use crate::models::TokenGrant;
use crate::token::TokenEndpoint;

/// Client for the Square OAuth token endpoint
pub struct SquareAuth {
    application_id: String,
    application_secret: Option<String>,
    token_url: String,
}

impl SquareAuth {
    /// Create a client for the production token endpoint
    ///
    /// `application_secret` may be omitted for PKCE-issued credentials.
    pub fn new(application_id: impl Into<String>, application_secret: Option<String>) -> Self {
        Self {
            application_id: application_id.into(),
            application_secret,
            token_url: format!("{}/oauth2/token", BASE_URL),
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    fn refresh_body(&self, refresh_secret: &str) -> serde_json::Value {
        let mut body = json!({
            "client_id": self.application_id,
            "grant_type": "refresh_token",
            "refresh_token": refresh_secret,
        });
        if let Some(secret) = &self.application_secret {
            body["client_secret"] = json!(secret);
        }
        body
    }
}

impl TokenEndpoint for SquareAuth {
    fn refresh(&self, refresh_secret: &str) -> Result<TokenGrant> {
        let mut response = ureq::post(&self.token_url)
            .header("Square-Version", API_VERSION)
            .send_json(self.refresh_body(refresh_secret))
            .context("Failed to refresh access token")?;

        let grant: TokenGrant = response
            .body_mut()
            .read_json()
            .context("Failed to parse refresh token response")?;

        Ok(grant)
    }
}
