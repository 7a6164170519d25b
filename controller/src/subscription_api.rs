//! Client for the subscription API (spec §6.3). A narrow contract: we only
//! read `uuid` and `hwidDeviceLimit` off the user record and only ever call
//! two action endpoints. Per design note §9 ("dynamic duck-typed records"),
//! the response is modeled as a small fixed record that tolerates unknown
//! fields rather than deserialized generically.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub uuid: String,
    #[serde(default)]
    pub hwid_device_limit: Option<u32>,
    #[serde(default)]
    pub status: Option<String>,
}

/// The subscription API wraps the record in `{"response": {...}}` in some
/// deployments and returns it bare in others (original_source's client
/// handles both); we do the same rather than assume one shape.
#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum UserResponse {
    Wrapped { response: UserRecord },
    Bare(UserRecord),
}

impl UserResponse {
    fn into_record(self) -> UserRecord {
        match self {
            UserResponse::Wrapped { response } => response,
            UserResponse::Bare(record) => record,
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl SubscriptionApiClient {
    pub fn new(base_url: String, token: String) -> SubscriptionApiClient {
        SubscriptionApiClient {
            client: reqwest::Client::new(),
            base_url,
            token,
        }
    }

    pub async fn get_user(&self, subscriber_id: &str) -> Result<UserRecord, ApiError> {
        let resp = self
            .client
            .get(format!("{}/api/users/by-id/{}", self.base_url, subscriber_id))
            .bearer_auth(&self.token)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status().as_u16()));
        }
        let parsed: UserResponse = resp.json().await?;
        Ok(parsed.into_record())
    }

    pub async fn disable(&self, uuid: &str) -> Result<(), ApiError> {
        let resp = self
            .client
            .post(format!("{}/api/users/{}/actions/disable", self.base_url, uuid))
            .bearer_auth(&self.token)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    pub async fn enable(&self, uuid: &str) -> Result<(), ApiError> {
        let resp = self
            .client
            .post(format!("{}/api/users/{}/actions/enable", self.base_url, uuid))
            .bearer_auth(&self.token)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}
