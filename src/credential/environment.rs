//! Client-secret credential read from `AZURE_*` environment variables.

use async_trait::async_trait;

use super::{
    read_json, AccessToken, CredentialKind, CredentialSource, SourceError,
    TokenEndpointResponse,
};

const TENANT_ID_VAR: &str = "AZURE_TENANT_ID";
const CLIENT_ID_VAR: &str = "AZURE_CLIENT_ID";
const CLIENT_SECRET_VAR: &str = "AZURE_CLIENT_SECRET";

/// Service principal settings for the client credentials grant
#[derive(Clone)]
pub struct ClientSecretSettings {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

pub struct EnvironmentCredential {
    client: reqwest::Client,
    authority_host: String,
    settings: Option<ClientSecretSettings>,
}

impl EnvironmentCredential {
    pub fn new(
        client: reqwest::Client,
        authority_host: &str,
        settings: Option<ClientSecretSettings>,
    ) -> Self {
        Self {
            client,
            authority_host: authority_host.trim_end_matches('/').to_string(),
            settings,
        }
    }

    /// Capture the service principal from the process environment.
    /// The source stays in the chain but reports itself unavailable if
    /// any of the three variables is missing.
    pub fn from_env(client: reqwest::Client, authority_host: &str) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let settings = match (var(TENANT_ID_VAR), var(CLIENT_ID_VAR), var(CLIENT_SECRET_VAR)) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Some(ClientSecretSettings {
                tenant_id,
                client_id,
                client_secret,
            }),
            _ => None,
        };
        Self::new(client, authority_host, settings)
    }

    fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority_host, tenant_id)
    }
}

#[async_trait]
impl CredentialSource for EnvironmentCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Environment
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, SourceError> {
        let settings = self.settings.as_ref().ok_or_else(|| {
            SourceError::Unavailable(format!(
                "{}, {} and {} must all be set",
                TENANT_ID_VAR, CLIENT_ID_VAR, CLIENT_SECRET_VAR
            ))
        })?;

        let response = self
            .client
            .post(self.token_url(&settings.tenant_id))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", settings.client_id.as_str()),
                ("client_secret", settings.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await?;

        read_json::<TokenEndpointResponse>(response).await?.into_token()
    }
}
