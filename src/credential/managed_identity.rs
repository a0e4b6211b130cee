//! Managed identity credential.
//!
//! Uses the App Service identity endpoint when `IDENTITY_ENDPOINT` and
//! `IDENTITY_HEADER` are present, and the Azure Instance Metadata Service
//! otherwise. No secret is held by the process.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    read_json, scope_to_resource, AccessToken, CredentialKind, CredentialSource,
    EpochOrSeconds, SourceError,
};

const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEndpoint {
    /// App Service / Functions local identity endpoint
    AppService { url: String, header: String },
    /// VM / AKS instance metadata service
    Imds { url: String },
}

#[derive(Debug, Deserialize)]
struct ManagedIdentityResponse {
    access_token: String,
    expires_on: EpochOrSeconds,
}

pub struct ManagedIdentityCredential {
    client: reqwest::Client,
    endpoint: IdentityEndpoint,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    pub fn new(
        client: reqwest::Client,
        endpoint: IdentityEndpoint,
        client_id: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            client_id,
        }
    }

    /// Pick the endpoint the hosting environment exposes
    pub fn from_env(client: reqwest::Client, client_id: Option<String>) -> Self {
        let endpoint = match (
            std::env::var("IDENTITY_ENDPOINT").ok(),
            std::env::var("IDENTITY_HEADER").ok(),
        ) {
            (Some(url), Some(header)) => IdentityEndpoint::AppService { url, header },
            _ => IdentityEndpoint::Imds {
                url: IMDS_TOKEN_URL.to_string(),
            },
        };
        Self::new(client, endpoint, client_id)
    }
}

#[async_trait]
impl CredentialSource for ManagedIdentityCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::ManagedIdentity
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, SourceError> {
        let resource = scope_to_resource(scope);

        let request = match &self.endpoint {
            IdentityEndpoint::AppService { url, header } => self
                .client
                .get(url)
                .header("X-IDENTITY-HEADER", header)
                .query(&[("api-version", APP_SERVICE_API_VERSION), ("resource", resource)]),
            IdentityEndpoint::Imds { url } => self
                .client
                .get(url)
                .header("Metadata", "true")
                .query(&[("api-version", IMDS_API_VERSION), ("resource", resource)]),
        };
        let request = match &self.client_id {
            Some(client_id) => request.query(&[("client_id", client_id.as_str())]),
            None => request,
        };

        let response = request.send().await?;
        let body: ManagedIdentityResponse = read_json(response).await?;
        Ok(AccessToken::new(
            body.access_token,
            body.expires_on.as_datetime()?,
        ))
    }
}
