//! Authenticated HTTP gateway to the intelligence API.
//!
//! Translates block queries into API calls and classifies every response
//! into a typed [`Outcome`]. Rate limiting (429) is surfaced as its own
//! variant because the pipeline must halt on it; everything else that goes
//! wrong at the transport or server level is a transient error that costs
//! one block's data, never the run.

use crate::auth::AuthToken;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Request timeout for individual API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One reported listing for an address within a queried block.
///
/// `(ipaddress, listed, rule)` is the storage primary key; the remaining
/// fields are enrichment the API may or may not populate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    #[serde(default)]
    pub dataset: String,
    pub ipaddress: String,
    pub listed: i64,
    pub rule: String,
    #[serde(default)]
    pub asn: Option<i64>,
    #[serde(default)]
    pub cc: Option<String>,
    #[serde(default)]
    pub seen: Option<i64>,
    #[serde(default)]
    pub valid_until: Option<i64>,
    #[serde(default)]
    pub botname: Option<String>,
    #[serde(default)]
    pub botname_malpedia: Option<String>,
    #[serde(default)]
    pub dstport: Option<i64>,
    #[serde(default)]
    pub heuristic: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub srcip: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub helo: Option<String>,
    #[serde(default)]
    pub detection: Option<String>,
}

/// Classified result of one block query.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// 200 with a non-empty `results` array
    Matches(Vec<Listing>),
    /// 200 with no `results`
    Empty,
    /// 404 - nothing known about this block; callers treat it like `Empty`
    NotFound,
    /// 429 - fatal for the run, never retried
    RateLimited,
    /// Any other non-200 status or a transport failure; the block is
    /// skipped for this run but still marked scanned in live mode
    TransientError,
}

/// Whether a scan queries current listings or a historical window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanKind {
    Live,
    /// Inclusive epoch-second bounds
    History { since: i64, until: i64 },
}

impl ScanKind {
    /// Path segment used by the byobject endpoint.
    pub fn path_segment(&self) -> &'static str {
        match self {
            ScanKind::Live => "live",
            ScanKind::History { .. } => "history",
        }
    }
}

/// Fixed query parameters for one scan.
#[derive(Debug, Clone)]
pub struct Query {
    pub dataset: String,
    pub mode: String,
    pub limit: u32,
    pub kind: ScanKind,
}

/// Source of listings for the scan pipeline. Implemented by [`ApiClient`];
/// tests substitute a stub.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_listings(&self, block: &str, query: &Query) -> Outcome;
}

#[derive(Debug, Deserialize)]
struct ListingsResponse {
    #[serde(default)]
    #[allow(dead_code)]
    code: Option<i64>,
    #[serde(default)]
    results: Vec<Listing>,
}

/// Long-lived API client. Holds the one shared HTTP session for a scan;
/// the bearer token is attached as a default header and never changes
/// mid-scan.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &AuthToken) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            token.token
        ))
        .context("Token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch and print the account's usage and limit figures.
    /// Informational only; limits are never enforced client-side.
    pub async fn check_limits(&self) -> Result<String> {
        let url = format!("{}/api/intel/v1/limits", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to query account limits")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("limits endpoint returned status {}", status);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse limits response")?;
        Ok(format_limits_report(&body))
    }
}

#[async_trait]
impl ListingSource for ApiClient {
    async fn fetch_listings(&self, block: &str, query: &Query) -> Outcome {
        let url = format!(
            "{}/api/intel/v1/byobject/cidr/{}/{}/{}/{}",
            self.base_url,
            query.dataset,
            query.mode,
            query.kind.path_segment(),
            block
        );

        let mut req = self.http.get(&url).query(&[("limit", query.limit)]);
        if let ScanKind::History { since, until } = query.kind {
            req = req.query(&[("since", since), ("until", until)]);
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Network error querying {}: {}", block, e);
                return Outcome::TransientError;
            }
        };

        match resp.status().as_u16() {
            200 => match resp.json::<ListingsResponse>().await {
                Ok(body) if !body.results.is_empty() => Outcome::Matches(body.results),
                Ok(_) => Outcome::Empty,
                Err(e) => {
                    tracing::warn!("Unparseable response body for {}: {}", block, e);
                    Outcome::TransientError
                }
            },
            404 => Outcome::NotFound,
            429 => {
                tracing::error!("429 - TOO MANY REQUESTS. API rate limit hit.");
                Outcome::RateLimited
            }
            status => {
                tracing::warn!("API returned status {} for block {}", status, block);
                Outcome::TransientError
            }
        }
    }
}

fn field(value: &serde_json::Value, section: &str, key: &str) -> String {
    match &value[section][key] {
        serde_json::Value::Null => "N/A".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render the limits payload as a human-readable account status report.
fn format_limits_report(body: &serde_json::Value) -> String {
    let mut report = String::from("ACCOUNT:\n");
    report.push_str(&format!("  - User: {}\n", field(body, "account", "usr")));
    report.push_str(&format!(
        "  - Subscription ID: {}\n\n",
        field(body, "account", "sub")
    ));
    report.push_str("GLOBAL LIMITS:\n");
    report.push_str(&format!(
        "  - Allowed Datasets: {}\n",
        field(body, "limits", "ads")
    ));
    report.push_str(&format!(
        "  - Access Level: {}\n",
        field(body, "limits", "trs")
    ));
    report.push_str(&format!(
        "  - Queries/Month (Soft Limit): {}\n",
        field(body, "limits", "qms")
    ));
    report.push_str(&format!(
        "  - Queries/Month (Hard Limit): {}\n\n",
        field(body, "limits", "qmh")
    ));
    report.push_str("RATE LIMITS (Per Time Period):\n");
    report.push_str(&format!(
        "  - Per Second: {}\n",
        field(body, "limits", "rl_qps")
    ));
    report.push_str(&format!(
        "  - Per Minute: {}\n",
        field(body, "limits", "rl_qpm")
    ));
    report.push_str(&format!(
        "  - Per Hour:   {}\n\n",
        field(body, "limits", "rl_qph")
    ));
    report.push_str("CURRENT USAGE:\n");
    report.push_str(&format!(
        "  - This Month: {}\n",
        field(body, "current", "qpm")
    ));
    report.push_str(&format!(
        "  - Today:      {}\n",
        field(body, "current", "qpd")
    ));
    report
}
