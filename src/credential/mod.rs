//! Access token acquisition for the SQL dependency.
//!
//! `CredentialProvider` walks an ordered chain of credential sources
//! (environment secret, managed identity, developer CLI login, interactive
//! device code) and caches the first usable token per scope. Concurrent
//! callers for the same scope share one in-flight fetch: the moka cache
//! runs a single initializer per key and every waiter receives its result.

mod cli;
mod environment;
mod interactive;
mod managed_identity;

pub use cli::DeveloperCliCredential;
pub use environment::{ClientSecretSettings, EnvironmentCredential};
pub use interactive::InteractiveCredential;
pub use managed_identity::ManagedIdentityCredential;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use moka::future::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::instrument;

use crate::config::{CredentialsConfig, MAX_TOKEN_EXPIRY_SKEW_SECS, TOKEN_CACHE_CAPACITY};

/// A bearer token for one scope. The value is never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Token valid for `seconds` from now, clamped to the representable range
    pub fn expiring_in(value: impl Into<String>, seconds: i64) -> Self {
        let expires_at = expiry_after(seconds).unwrap_or(if seconds < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        });
        Self::new(value, expires_at)
    }

    pub fn secret(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// A token is stale once `now >= expires_at - skew`
    pub fn is_stale_at(&self, now: DateTime<Utc>, skew: TimeDelta) -> bool {
        self.expires_at
            .checked_sub_signed(skew)
            .map_or(true, |refresh_at| now >= refresh_at)
    }

    pub fn is_stale(&self, skew: TimeDelta) -> bool {
        self.is_stale_at(Utc::now(), skew)
    }

    /// Time left before the token becomes stale (zero if already stale)
    pub fn fresh_for(&self, skew: TimeDelta, now: DateTime<Utc>) -> Duration {
        self.expires_at
            .checked_sub_signed(skew)
            .and_then(|refresh_at| (refresh_at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

/// `now + seconds`, or None when that falls outside chrono's range
fn expiry_after(seconds: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_seconds(seconds).and_then(|delta| Utc::now().checked_add_signed(delta))
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credential source identity, in chain priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Environment,
    ManagedIdentity,
    DeveloperCli,
    Interactive,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Environment => "EnvironmentCredential",
            CredentialKind::ManagedIdentity => "ManagedIdentityCredential",
            CredentialKind::DeveloperCli => "DeveloperCliCredential",
            CredentialKind::Interactive => "InteractiveCredential",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error from a single credential source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("identity endpoint returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// One failed attempt, kept for the aggregated error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: CredentialKind,
    pub reason: String,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.reason)
    }
}

fn join_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error returned when no credential source produced a usable token
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("no credential sources are enabled")]
    NoSources,

    #[error("failed to acquire token for '{scope}': {}", join_failures(.failures))]
    Exhausted {
        scope: String,
        failures: Vec<SourceFailure>,
    },
}

/// A single way of obtaining tokens from the identity service
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn kind(&self) -> CredentialKind;

    /// Per-attempt timeout override; the chain default applies when None
    fn attempt_timeout(&self) -> Option<Duration> {
        None
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, SourceError>;
}

/// Ordered list of credential sources tried until one succeeds
pub struct CredentialChain {
    sources: Vec<Arc<dyn CredentialSource>>,
    attempt_timeout: Duration,
    skew: TimeDelta,
}

impl CredentialChain {
    pub fn new(
        sources: Vec<Arc<dyn CredentialSource>>,
        attempt_timeout: Duration,
        skew: TimeDelta,
    ) -> Self {
        Self {
            sources,
            attempt_timeout,
            skew,
        }
    }

    pub fn source_kinds(&self) -> Vec<CredentialKind> {
        self.sources.iter().map(|s| s.kind()).collect()
    }

    /// Try each source once, in order. No retries.
    async fn acquire(&self, scope: &str) -> Result<AccessToken, AuthError> {
        if self.sources.is_empty() {
            return Err(AuthError::NoSources);
        }

        let mut failures = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let limit = source.attempt_timeout().unwrap_or(self.attempt_timeout);
            let reason = match tokio::time::timeout(limit, source.get_token(scope)).await {
                Ok(Ok(token)) if !token.is_stale(self.skew) => {
                    tracing::debug!(
                        source = %source.kind(),
                        %scope,
                        expires_at = %token.expires_at(),
                        "Acquired access token"
                    );
                    return Ok(token);
                }
                Ok(Ok(token)) => format!("returned a token expiring at {}", token.expires_at()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => SourceError::TimedOut(limit).to_string(),
            };

            tracing::debug!(
                source = %source.kind(),
                %scope,
                %reason,
                "Credential source failed, trying next"
            );
            failures.push(SourceFailure {
                source: source.kind(),
                reason,
            });
        }

        Err(AuthError::Exhausted {
            scope: scope.to_string(),
            failures,
        })
    }
}

/// Expires cached tokens at `expires_at - skew`
struct TokenExpiry {
    skew: TimeDelta,
}

impl Expiry<String, AccessToken> for TokenExpiry {
    fn expire_after_create(
        &self,
        _scope: &String,
        token: &AccessToken,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(token.fresh_for(self.skew, Utc::now()))
    }
}

/// Credential chain plus a per-scope token cache with single-flight fetches.
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct CredentialProvider {
    chain: Arc<CredentialChain>,
    cache: Cache<String, AccessToken>,
    skew: TimeDelta,
}

impl CredentialProvider {
    pub fn new(chain: CredentialChain) -> Self {
        let skew = chain.skew;
        let cache = Cache::builder()
            .max_capacity(TOKEN_CACHE_CAPACITY)
            .expire_after(TokenExpiry { skew })
            .build();

        Self {
            chain: Arc::new(chain),
            cache,
            skew,
        }
    }

    /// Build the default chain from configuration, skipping excluded sources.
    pub fn from_config(config: &CredentialsConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let mut sources: Vec<Arc<dyn CredentialSource>> = Vec::new();
        if !config.exclude_environment {
            sources.push(Arc::new(EnvironmentCredential::from_env(
                client.clone(),
                &config.authority_host,
            )));
        }
        if !config.exclude_managed_identity {
            sources.push(Arc::new(ManagedIdentityCredential::from_env(
                client.clone(),
                config.managed_identity_client_id.clone(),
            )));
        }
        if !config.exclude_developer_cli {
            sources.push(Arc::new(DeveloperCliCredential::new()));
        }
        if !config.exclude_interactive {
            sources.push(Arc::new(InteractiveCredential::new(
                client,
                &config.authority_host,
                config.tenant_id.as_deref(),
                Duration::from_secs(config.interactive_timeout_seconds),
            )));
        }

        let chain = CredentialChain::new(
            sources,
            Duration::from_secs(config.attempt_timeout_seconds),
            TimeDelta::seconds(config.expiry_skew_seconds.min(MAX_TOKEN_EXPIRY_SKEW_SECS) as i64),
        );
        Ok(Self::new(chain))
    }

    pub fn source_kinds(&self) -> Vec<CredentialKind> {
        self.chain.source_kinds()
    }

    /// Return a cached token for `scope`, or fetch one through the chain.
    #[instrument(name = "credential.get_token", skip(self), fields(cache_hit = true))]
    pub async fn get_token(&self, scope: &str) -> Result<AccessToken, AuthError> {
        if let Some(token) = self.cache.get(scope).await {
            if !token.is_stale(self.skew) {
                return Ok(token);
            }
            self.cache.invalidate(scope).await;
        }

        let chain = Arc::clone(&self.chain);
        let requested = scope.to_string();
        self.cache
            .try_get_with(scope.to_string(), async move {
                tracing::Span::current().record("cache_hit", false);
                chain.acquire(&requested).await
            })
            .await
            .map_err(|e| (*e).clone())
    }
}

/// Successful response from an OAuth2 token endpoint
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: EpochOrSeconds,
}

impl TokenEndpointResponse {
    fn into_token(self) -> Result<AccessToken, SourceError> {
        let seconds = self.expires_in.as_i64()?;
        let expires_at = expiry_after(seconds).ok_or_else(|| {
            SourceError::InvalidResponse(format!("expires_in out of range: {}", seconds))
        })?;
        Ok(AccessToken::new(self.access_token, expires_at))
    }
}

/// Error body returned by the identity service
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Identity endpoints send numeric fields either as JSON numbers or strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EpochOrSeconds {
    Number(i64),
    Text(String),
}

impl EpochOrSeconds {
    fn as_i64(&self) -> Result<i64, SourceError> {
        match self {
            EpochOrSeconds::Number(n) => Ok(*n),
            EpochOrSeconds::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| SourceError::InvalidResponse(format!("not a number: '{}'", s))),
        }
    }

    fn as_datetime(&self) -> Result<DateTime<Utc>, SourceError> {
        let epoch = self.as_i64()?;
        DateTime::from_timestamp(epoch, 0)
            .ok_or_else(|| SourceError::InvalidResponse(format!("invalid timestamp {}", epoch)))
    }
}

/// Decode a token endpoint reply, turning error statuses into `Rejected`.
async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SourceError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| SourceError::InvalidResponse(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    Err(SourceError::Rejected {
        status: status.as_u16(),
        message: describe_error_body(&body),
    })
}

fn describe_error_body(body: &str) -> String {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(TokenErrorResponse {
            error,
            error_description: Some(description),
        }) => format!("{}: {}", error, description.lines().next().unwrap_or_default()),
        Ok(TokenErrorResponse { error, .. }) => error,
        Err(_) if body.trim().is_empty() => "empty response body".to_string(),
        Err(_) => body.trim().chars().take(200).collect(),
    }
}

/// Azure AD v1 resource identifier for a v2 `.default` scope
fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source that returns a fixed result and counts calls
    pub(crate) struct FakeSource {
        pub kind: CredentialKind,
        pub calls: Arc<AtomicUsize>,
        pub result: fn() -> Result<AccessToken, SourceError>,
        pub delay: Duration,
    }

    impl FakeSource {
        pub fn ok(kind: CredentialKind) -> Self {
            Self {
                kind,
                calls: Arc::new(AtomicUsize::new(0)),
                result: || Ok(AccessToken::expiring_in("token", 3600)),
                delay: Duration::ZERO,
            }
        }

        pub fn failing(kind: CredentialKind) -> Self {
            Self {
                result: || Err(SourceError::Unavailable("not here".into())),
                ..Self::ok(kind)
            }
        }
    }

    #[async_trait]
    impl CredentialSource for FakeSource {
        fn kind(&self) -> CredentialKind {
            self.kind
        }

        async fn get_token(&self, _scope: &str) -> Result<AccessToken, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.result)()
        }
    }

    pub(crate) fn provider_with(sources: Vec<Arc<dyn CredentialSource>>) -> CredentialProvider {
        CredentialProvider::new(CredentialChain::new(
            sources,
            Duration::from_secs(5),
            TimeDelta::seconds(300),
        ))
    }

    #[test]
    fn test_token_staleness_uses_skew() {
        let now = Utc::now();
        let token = AccessToken::new("t", now + TimeDelta::seconds(200));
        assert!(token.is_stale_at(now, TimeDelta::seconds(300)));
        assert!(!token.is_stale_at(now, TimeDelta::seconds(100)));
        assert!(token.is_stale_at(now + TimeDelta::seconds(100), TimeDelta::seconds(100)));
    }

    #[test]
    fn test_fresh_for_is_zero_when_stale() {
        let now = Utc::now();
        let token = AccessToken::new("t", now);
        assert_eq!(token.fresh_for(TimeDelta::seconds(60), now), Duration::ZERO);
        let token = AccessToken::new("t", now + TimeDelta::seconds(120));
        assert_eq!(token.fresh_for(TimeDelta::seconds(60), now), Duration::from_secs(60));
    }

    #[test]
    fn test_out_of_range_expiry_is_invalid_response() {
        for expires_in in [i64::MAX, i64::MIN, 1_000_000_000_000_000] {
            let response = TokenEndpointResponse {
                access_token: "t".into(),
                expires_in: EpochOrSeconds::Number(expires_in),
            };
            assert!(matches!(response.into_token(), Err(SourceError::InvalidResponse(_))));
        }
    }

    #[test]
    fn test_extreme_expiry_does_not_panic() {
        let now = Utc::now();
        let skew = TimeDelta::seconds(300);

        let ancient = AccessToken::new("t", DateTime::<Utc>::MIN_UTC);
        assert!(ancient.is_stale_at(now, skew));
        assert_eq!(ancient.fresh_for(skew, now), Duration::ZERO);

        let forever = AccessToken::expiring_in("t", i64::MAX);
        assert_eq!(forever.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(!forever.is_stale_at(now, skew));
    }

    #[test]
    fn test_debug_redacts_token_value() {
        let token = AccessToken::expiring_in("super-secret", 60);
        let debug = format!("{:?}", token);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_scope_to_resource() {
        assert_eq!(
            scope_to_resource("https://database.windows.net/.default"),
            "https://database.windows.net"
        );
        assert_eq!(scope_to_resource("api://thing"), "api://thing");
    }

    #[test]
    fn test_describe_error_body() {
        let body = r#"{"error":"invalid_client","error_description":"AADSTS7000215: Invalid client secret.\r\nTrace ID: x"}"#;
        assert_eq!(
            describe_error_body(body),
            "invalid_client: AADSTS7000215: Invalid client secret."
        );
        assert_eq!(describe_error_body(""), "empty response body");
        assert_eq!(describe_error_body("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_epoch_or_seconds_accepts_both_shapes() {
        let n: EpochOrSeconds = serde_json::from_str("3599").unwrap();
        let s: EpochOrSeconds = serde_json::from_str("\"3599\"").unwrap();
        assert_eq!(n.as_i64().unwrap(), 3599);
        assert_eq!(s.as_i64().unwrap(), 3599);
        let bad: EpochOrSeconds = serde_json::from_str("\"soon\"").unwrap();
        assert!(bad.as_i64().is_err());
    }

    #[tokio::test]
    async fn test_first_successful_source_wins() {
        let failing = FakeSource::failing(CredentialKind::Environment);
        let ok = FakeSource::ok(CredentialKind::ManagedIdentity);
        let never = FakeSource::ok(CredentialKind::DeveloperCli);
        let never_calls = never.calls.clone();

        let provider = provider_with(vec![Arc::new(failing), Arc::new(ok), Arc::new(never)]);
        let token = provider.get_token("db.scope").await.unwrap();

        assert_eq!(token.secret(), "token");
        assert_eq!(never_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_sources_failing_aggregates_reasons() {
        let provider = provider_with(vec![
            Arc::new(FakeSource::failing(CredentialKind::Environment)),
            Arc::new(FakeSource::failing(CredentialKind::ManagedIdentity)),
        ]);

        let err = provider.get_token("db.scope").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("EnvironmentCredential: unavailable: not here"));
        assert!(message.contains("ManagedIdentityCredential: unavailable: not here"));
        match err {
            AuthError::Exhausted { failures, scope } => {
                assert_eq!(scope, "db.scope");
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_sources_enabled() {
        let provider = provider_with(Vec::new());
        assert!(matches!(
            provider.get_token("db.scope").await,
            Err(AuthError::NoSources)
        ));
    }

    #[tokio::test]
    async fn test_stale_token_from_source_is_rejected() {
        let stale = FakeSource {
            result: || Ok(AccessToken::expiring_in("old", 10)),
            ..FakeSource::ok(CredentialKind::Environment)
        };
        let fresh = FakeSource::ok(CredentialKind::ManagedIdentity);

        let provider = provider_with(vec![Arc::new(stale), Arc::new(fresh)]);
        let token = provider.get_token("db.scope").await.unwrap();
        assert_eq!(token.secret(), "token");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out() {
        let slow = FakeSource {
            delay: Duration::from_secs(30),
            ..FakeSource::ok(CredentialKind::ManagedIdentity)
        };
        let provider = provider_with(vec![Arc::new(slow)]);

        let err = provider.get_token("db.scope").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_token_is_cached_per_scope() {
        let source = FakeSource::ok(CredentialKind::Environment);
        let calls = source.calls.clone();
        let provider = provider_with(vec![Arc::new(source)]);

        provider.get_token("a").await.unwrap();
        provider.get_token("a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        provider.get_token("b").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let source = FakeSource::failing(CredentialKind::Environment);
        let calls = source.calls.clone();
        let provider = provider_with(vec![Arc::new(source)]);

        assert!(provider.get_token("a").await.is_err());
        assert!(provider.get_token("a").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_fetch() {
        let source = FakeSource {
            delay: Duration::from_millis(200),
            ..FakeSource::ok(CredentialKind::ManagedIdentity)
        };
        let calls = source.calls.clone();
        let provider = provider_with(vec![Arc::new(source)]);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.get_token("db.scope").await })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap().secret(), "token");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
