//! OAuth refresh-token exchange for the vehicle cloud API. The token
//! manager only ever refreshes an already-provisioned token — there is no
//! interactive login flow here, just the refresh-token grant and the
//! authenticated-client builder it feeds.

use anyhow::{anyhow, Error};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::BASE_URL;

/// Response body of a refresh-token grant against the vehicle cloud's OAuth
/// token endpoint.
#[derive(Deserialize, Debug, Clone)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

/// The refresh-token exchange itself, parameterized by the credentials in
/// `config::VehicleCredentials`. Kept free of any stored-token state; the
/// token manager owns the lifecycle, this is just the wire call.
pub struct TokenExchange {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
}

impl TokenExchange {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        TokenExchange {
            client: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    #[tracing::instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, Error> {
        let mut data = std::collections::HashMap::<&str, &str>::default();
        data.insert("grant_type", "refresh_token");
        data.insert("client_id", &self.client_id);
        data.insert("client_secret", &self.client_secret);
        data.insert("refresh_token", refresh_token);

        let response = self
            .client
            .post(format!("{}/oauth/token", BASE_URL))
            .json(&data)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "refresh-token exchange failed with status {}",
                response.status()
            ));
        }

        Ok(response.json::<RefreshResponse>().await?)
    }

    /// Build an authenticated client for the gateway.
    pub(crate) fn authenticated_client(access_token: &str, user_agent: &str) -> reqwest::Client {
        use reqwest::header;
        let mut headers = header::HeaderMap::new();
        let mut auth_value =
            header::HeaderValue::from_str(&format!("Bearer {}", access_token)).unwrap();
        auth_value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth_value);

        reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .unwrap()
    }
}

/// `access_expires_at` from an `expires_in` duration read at `now`.
pub fn expires_at(now: DateTime<Utc>, expires_in_secs: i64) -> DateTime<Utc> {
    now + chrono::Duration::seconds(expires_in_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_relative_to_observation_time() {
        let now = Utc::now();
        let exp = expires_at(now, 3600);
        assert_eq!((exp - now).num_seconds(), 3600);
    }
}
