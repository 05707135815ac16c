//! Cloudflare client API: account listing and the daily usage GraphQL query.

use crate::account::{Credentials, ProxyConfig};
use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use reqwest::{Client, Proxy, RequestBuilder};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// Resolved ids are trusted for this long before re-validation.
pub const CACHE_TTL_HOURS: i64 = 24;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(8);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-account failure taxonomy. Errors are data: they live inside snapshot
/// entries and events rather than aborting sibling work.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UsageError {
    #[error("no usable credentials (set email and global key, or an API token)")]
    Credentials,

    #[error("account id lookup failed: {0}")]
    Resolution(String),

    #[error("usage query failed: {0}")]
    Query(String),
}

/// A successful usage readout for one account over the current UTC day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageStats {
    pub total_requests: u64,
    pub worker_requests: u64,
    pub page_requests: u64,
    pub account_id: String,
}

pub type UsageResult = Result<UsageStats, UsageError>;

/// Outcome of an account-id lookup.
#[derive(Debug, Clone)]
pub struct ResolvedId {
    pub id: String,
    /// True when the id came from the network rather than the TTL cache.
    pub refreshed: bool,
}

/// True while a cached id is still inside its trust window.
pub fn cache_is_fresh(resolved_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(resolved_at) < chrono::Duration::hours(CACHE_TTL_HOURS)
}

/// The UTC calendar-day query window: midnight today up to `now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UsageWindow {
    pub fn today(now: DateTime<Utc>) -> Self {
        let start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        Self { start, end: now }
    }
}

const USAGE_QUERY: &str = r#"
query getBillingMetrics($AccountID: String!, $filter: AccountWorkersInvocationsAdaptiveFilter_InputObject) {
    viewer {
        accounts(filter: {accountTag: $AccountID}) {
            pagesFunctionsInvocationsAdaptiveGroups(limit: 500, filter: $filter) {
                sum { requests }
            }
            workersInvocationsAdaptive(limit: 5000, filter: $filter) {
                sum { requests }
            }
        }
    }
}"#;

#[derive(Debug, Deserialize)]
struct AccountsEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Vec<AccountEntry>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlEnvelope {
    data: Option<GraphqlData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct GraphqlData {
    #[serde(default)]
    viewer: Viewer,
}

#[derive(Debug, Default, Deserialize)]
struct Viewer {
    #[serde(default)]
    accounts: Vec<AccountBuckets>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountBuckets {
    #[serde(rename = "pagesFunctionsInvocationsAdaptiveGroups", default)]
    pages: Vec<BucketGroup>,
    #[serde(rename = "workersInvocationsAdaptive", default)]
    workers: Vec<BucketGroup>,
}

#[derive(Debug, Default, Deserialize)]
struct BucketGroup {
    #[serde(default)]
    sum: BucketSum,
}

#[derive(Debug, Default, Deserialize)]
struct BucketSum {
    #[serde(default)]
    requests: u64,
}

/// HTTP client for the two endpoints, optionally routed through a proxy.
/// One shared 5 s connect timeout; each call carries its own total timeout.
#[derive(Clone)]
pub struct CfClient {
    base_url: String,
    client: Client,
}

impl CfClient {
    pub fn new(proxy: &ProxyConfig) -> Result<Self, reqwest::Error> {
        Self::with_base_url(DEFAULT_BASE_URL, proxy)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        proxy: &ProxyConfig,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(url) = proxy.url() {
            let mut p = Proxy::all(&url)?;
            if let Some((user, pass)) = proxy.basic_auth() {
                p = p.basic_auth(user, pass);
            }
            builder = builder.proxy(p);
            tracing::debug!("routing API calls through {url}");
        }
        let base_url: String = base_url.into();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: builder.build()?,
        })
    }

    fn with_auth(request: RequestBuilder, credentials: &Credentials) -> RequestBuilder {
        match credentials {
            Credentials::ApiToken { token } => {
                request.header("Authorization", format!("Bearer {token}"))
            }
            Credentials::GlobalKey { email, key } => {
                request.header("X-AUTH-EMAIL", email).header("X-AUTH-KEY", key)
            }
        }
    }

    /// Resolve the account id, honoring the 24 h cache. Resolution is pure:
    /// writing a refreshed id back into the registry is the caller's job.
    pub async fn resolve_account_id(
        &self,
        credentials: &Credentials,
        cached: Option<(&str, DateTime<Utc>)>,
    ) -> Result<ResolvedId, UsageError> {
        if let Some((id, resolved_at)) = cached {
            if !id.is_empty() && cache_is_fresh(resolved_at, Utc::now()) {
                return Ok(ResolvedId { id: id.to_string(), refreshed: false });
            }
        }

        let response = Self::with_auth(
            self.client.get(format!("{}/accounts", self.base_url)),
            credentials,
        )
        .timeout(RESOLVE_TIMEOUT)
        .send()
        .await
        .map_err(|e| UsageError::Resolution(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UsageError::Resolution(format!("HTTP {}", response.status())));
        }
        let envelope: AccountsEnvelope = response
            .json()
            .await
            .map_err(|e| UsageError::Resolution(e.to_string()))?;
        if !envelope.success || envelope.result.is_empty() {
            return Err(UsageError::Resolution("account listing came back empty".into()));
        }

        let entry = pick_account(&envelope.result, credentials.email().unwrap_or(""));
        Ok(ResolvedId { id: entry.id.clone(), refreshed: true })
    }

    /// Run the usage query for an already-resolved account over the current
    /// UTC day.
    pub async fn query_usage(
        &self,
        credentials: &Credentials,
        account_id: &str,
    ) -> Result<UsageStats, UsageError> {
        let window = UsageWindow::today(Utc::now());
        let body = serde_json::json!({
            "query": USAGE_QUERY,
            "variables": {
                "AccountID": account_id,
                "filter": {
                    "datetime_geq": window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                    "datetime_leq": window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
                }
            }
        });

        let response = Self::with_auth(
            self.client.post(format!("{}/graphql", self.base_url)),
            credentials,
        )
        .timeout(QUERY_TIMEOUT)
        .json(&body)
        .send()
        .await
        .map_err(|e| UsageError::Query(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UsageError::Query(format!("HTTP {}", response.status())));
        }
        let envelope: GraphqlEnvelope =
            response.json().await.map_err(|e| UsageError::Query(e.to_string()))?;
        sum_usage(envelope, account_id)
    }
}

/// Prefer the entry whose name starts with the caller's email
/// (case-insensitive); otherwise the first entry. `entries` must be
/// non-empty.
fn pick_account<'a>(entries: &'a [AccountEntry], email: &str) -> &'a AccountEntry {
    let email = email.to_lowercase();
    entries
        .iter()
        .find(|e| !email.is_empty() && e.name.to_lowercase().starts_with(&email))
        .unwrap_or(&entries[0])
}

fn sum_usage(envelope: GraphqlEnvelope, account_id: &str) -> Result<UsageStats, UsageError> {
    if let Some(err) = envelope.errors.first() {
        return Err(UsageError::Query(format!("GraphQL error: {}", err.message)));
    }
    let accounts = envelope.data.unwrap_or_default().viewer.accounts;
    let Some(buckets) = accounts.into_iter().next() else {
        return Err(UsageError::Query("no usage data for this account".into()));
    };
    let pages: u64 = buckets.pages.iter().map(|g| g.sum.requests).sum();
    let workers: u64 = buckets.workers.iter().map(|g| g.sum.requests).sum();
    Ok(UsageStats {
        total_requests: pages + workers,
        worker_requests: workers,
        page_requests: pages,
        account_id: account_id.to_string(),
    })
}
