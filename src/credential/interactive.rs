//! Interactive login through the OAuth2 device code flow.
//!
//! The verification URL and user code are written to the log at warn level;
//! the credential then polls the token endpoint until the user completes the
//! login, the device code expires, or the chain's timeout fires.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    describe_error_body, AccessToken, CredentialKind, CredentialSource, SourceError,
    TokenEndpointResponse, TokenErrorResponse,
};

/// Public client registered for developer tooling logins
const DEVELOPER_CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";
const DEFAULT_TENANT: &str = "organizations";
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const SLOW_DOWN_INCREMENT_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    message: String,
    expires_in: u64,
    #[serde(default = "DeviceCodeResponse::default_interval")]
    interval: u64,
}

impl DeviceCodeResponse {
    fn default_interval() -> u64 {
        5
    }

    /// When the device code stops being accepted
    fn deadline(&self, now: Instant) -> Result<Instant, SourceError> {
        now.checked_add(Duration::from_secs(self.expires_in)).ok_or_else(|| {
            SourceError::InvalidResponse(format!("device code expires_in out of range: {}", self.expires_in))
        })
    }
}

pub struct InteractiveCredential {
    client: reqwest::Client,
    authority: String,
    client_id: String,
    timeout: Duration,
}

impl InteractiveCredential {
    pub fn new(
        client: reqwest::Client,
        authority_host: &str,
        tenant_id: Option<&str>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            authority: format!(
                "{}/{}",
                authority_host.trim_end_matches('/'),
                tenant_id.unwrap_or(DEFAULT_TENANT)
            ),
            client_id: DEVELOPER_CLIENT_ID.to_string(),
            timeout,
        }
    }

    async fn request_device_code(&self, scope: &str) -> Result<DeviceCodeResponse, SourceError> {
        let response = self
            .client
            .post(format!("{}/oauth2/v2.0/devicecode", self.authority))
            .form(&[("client_id", self.client_id.as_str()), ("scope", scope)])
            .send()
            .await?;
        super::read_json(response).await
    }

    async fn poll_for_token(&self, device: &DeviceCodeResponse) -> Result<AccessToken, SourceError> {
        let deadline = device.deadline(Instant::now())?;
        let mut interval = Duration::from_secs(device.interval);

        loop {
            tokio::time::sleep(interval).await;
            if Instant::now() >= deadline {
                return Err(SourceError::TimedOut(Duration::from_secs(device.expires_in)));
            }

            let response = self
                .client
                .post(format!("{}/oauth2/v2.0/token", self.authority))
                .form(&[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", device.device_code.as_str()),
                ])
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<TokenEndpointResponse>()
                    .await
                    .map_err(|e| SourceError::InvalidResponse(e.to_string()))?
                    .into_token();
            }

            let body = response.text().await.unwrap_or_default();
            match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) if err.error == "authorization_pending" => continue,
                Ok(err) if err.error == "slow_down" => {
                    interval = interval.saturating_add(Duration::from_secs(SLOW_DOWN_INCREMENT_SECS));
                }
                _ => {
                    return Err(SourceError::Rejected {
                        status: status.as_u16(),
                        message: describe_error_body(&body),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl CredentialSource for InteractiveCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Interactive
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, SourceError> {
        let device = self.request_device_code(scope).await?;
        tracing::warn!(login = %device.message, "Interactive login required");
        self.poll_for_token(&device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_device_code_flow_polls_until_authorized() {
        let polls = Arc::new(AtomicUsize::new(0));
        let polls_handler = polls.clone();

        let router = Router::new()
            .route(
                "/tenant-1/oauth2/v2.0/devicecode",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    assert_eq!(form["client_id"], DEVELOPER_CLIENT_ID);
                    Json(serde_json::json!({
                        "device_code": "dev-code",
                        "user_code": "ABCD-EFGH",
                        "verification_uri": "https://microsoft.com/devicelogin",
                        "expires_in": 60,
                        "interval": 0,
                        "message": "To sign in, enter ABCD-EFGH"
                    }))
                }),
            )
            .route(
                "/tenant-1/oauth2/v2.0/token",
                post(move |Form(form): Form<HashMap<String, String>>| {
                    let polls = polls_handler.clone();
                    async move {
                        assert_eq!(form["device_code"], "dev-code");
                        if polls.fetch_add(1, Ordering::SeqCst) < 2 {
                            (
                                http::StatusCode::BAD_REQUEST,
                                Json(serde_json::json!({"error": "authorization_pending"})),
                            )
                        } else {
                            (
                                http::StatusCode::OK,
                                Json(serde_json::json!({
                                    "access_token": "interactive-token",
                                    "expires_in": 3600
                                })),
                            )
                        }
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let credential = InteractiveCredential::new(
            reqwest::Client::new(),
            &format!("http://{}", addr),
            Some("tenant-1"),
            Duration::from_secs(30),
        );
        let token = credential.get_token("db.scope").await.unwrap();
        assert_eq!(token.secret(), "interactive-token");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_device_code_deadline_out_of_range() {
        let device = DeviceCodeResponse {
            device_code: "dev-code".into(),
            message: "sign in".into(),
            expires_in: u64::MAX,
            interval: 5,
        };
        let now = Instant::now();
        assert!(matches!(device.deadline(now), Err(SourceError::InvalidResponse(_))));

        let device = DeviceCodeResponse {
            expires_in: 900,
            ..device
        };
        assert_eq!(device.deadline(now).unwrap(), now + Duration::from_secs(900));
    }

    #[test]
    fn test_interactive_uses_own_timeout() {
        let credential = InteractiveCredential::new(
            reqwest::Client::new(),
            "https://login.example.com/",
            None,
            Duration::from_secs(90),
        );
        assert_eq!(credential.attempt_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(credential.authority, "https://login.example.com/organizations");
    }
}
