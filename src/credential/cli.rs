//! Developer login cached by the Azure CLI (`az login`).

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::process::Command;

use super::{scope_to_resource, AccessToken, CredentialKind, CredentialSource, EpochOrSeconds, SourceError};

const AZ_PROGRAM: &str = "az";

/// `az account get-access-token --output json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenOutput {
    access_token: String,
    /// Local time, e.g. "2024-05-01 13:45:10.000000"
    expires_on: Option<String>,
    /// Unix epoch (CLI 2.54+)
    #[serde(rename = "expires_on")]
    expires_on_epoch: Option<EpochOrSeconds>,
}

pub struct DeveloperCliCredential {
    program: String,
}

impl Default for DeveloperCliCredential {
    fn default() -> Self {
        Self::new()
    }
}

impl DeveloperCliCredential {
    pub fn new() -> Self {
        Self::with_program(AZ_PROGRAM)
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for DeveloperCliCredential {
    fn kind(&self) -> CredentialKind {
        CredentialKind::DeveloperCli
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, SourceError> {
        let output = Command::new(&self.program)
            .args(["account", "get-access-token", "--output", "json", "--resource"])
            .arg(scope_to_resource(scope))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    SourceError::Unavailable(format!("'{}' is not installed", self.program))
                }
                _ => SourceError::Command(e.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(describe_cli_failure(&stderr));
        }

        parse_cli_output(&output.stdout)
    }
}

fn describe_cli_failure(stderr: &str) -> SourceError {
    if stderr.contains("az login") {
        return SourceError::Unavailable("not logged in, run 'az login'".to_string());
    }
    let first_line = stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output");
    SourceError::Command(first_line.to_string())
}

fn parse_cli_output(stdout: &[u8]) -> Result<AccessToken, SourceError> {
    let output: CliTokenOutput = serde_json::from_slice(stdout)
        .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;

    let expires_at = match (&output.expires_on_epoch, &output.expires_on) {
        (Some(epoch), _) => epoch.as_datetime()?,
        (None, Some(local)) => parse_local_expiry(local)?,
        (None, None) => {
            return Err(SourceError::InvalidResponse(
                "token output has no expiry".to_string(),
            ))
        }
    };

    Ok(AccessToken::new(output.access_token, expires_at))
}

fn parse_local_expiry(value: &str) -> Result<DateTime<Utc>, SourceError> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| SourceError::InvalidResponse(format!("bad expiresOn '{}': {}", value, e)))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| SourceError::InvalidResponse(format!("ambiguous expiresOn '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output_prefers_epoch() {
        let json = br#"{
            "accessToken": "cli-token",
            "expiresOn": "2000-01-01 00:00:00.000000",
            "expires_on": 4102444800,
            "subscription": "sub",
            "tenant": "tenant",
            "tokenType": "Bearer"
        }"#;
        let token = parse_cli_output(json).unwrap();
        assert_eq!(token.secret(), "cli-token");
        assert_eq!(token.expires_at().timestamp(), 4102444800);
    }

    #[test]
    fn test_parse_output_with_local_expiry_only() {
        let json = br#"{"accessToken": "cli-token", "expiresOn": "2099-12-31 23:00:00.123456"}"#;
        let token = parse_cli_output(json).unwrap();
        assert!(token.expires_at() > Utc::now());
    }

    #[test]
    fn test_parse_output_without_expiry() {
        let json = br#"{"accessToken": "cli-token"}"#;
        assert!(matches!(
            parse_cli_output(json),
            Err(SourceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_not_logged_in() {
        let err = describe_cli_failure("ERROR: Please run 'az login' to setup account.\n");
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[test]
    fn test_other_cli_failure_keeps_first_line() {
        let err = describe_cli_failure("\nERROR: AADSTS50076: MFA required\nmore detail\n");
        assert_eq!(err.to_string(), "command failed: ERROR: AADSTS50076: MFA required");
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let credential = DeveloperCliCredential::with_program("stockroom-no-such-az-binary");
        let err = credential.get_token("db.scope").await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }
}
