//! Native `reqwest` HTTP client for the GitHub REST API.
//!
//! Uses a shared `reqwest::Client` with connection pooling, reads rate-limit
//! headers proactively, and retries transient failures with exponential
//! backoff. Retrying happens here so that callers above the adapter never
//! see a rate limit or a flaky connection.

use super::types::{
    GitHubCheckRuns, GitHubComment, GitHubIssue, GitHubLabel, GitHubPullRequest, GitHubRepo,
};
use crate::backoff::{is_rate_limit_error, is_transient, RetryPolicy};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header, Client, Method, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const GITHUB_API: &str = "https://api.github.com";
const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_DIFF: &str = "application/vnd.github.v3.diff";

// ── Rate-limit state ─────────────────────────────────────────────────

/// Proactive rate-limit state derived from `X-RateLimit-*` response headers.
struct RateLimit {
    /// Remaining requests in the current window.
    remaining: Option<u32>,
    /// UTC epoch second when the window resets.
    reset_at: Option<u64>,
    /// Exponential backoff after a 403/429 (fallback when headers are absent).
    backoff_until: Option<Instant>,
    backoff_delay: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl RateLimit {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            remaining: None,
            reset_at: None,
            backoff_until: None,
            backoff_delay: Duration::ZERO,
            backoff_base: base,
            backoff_max: max,
        }
    }

    /// Update state from response headers.
    fn update_from_headers(&mut self, headers: &header::HeaderMap) {
        if let Some(v) = headers.get("x-ratelimit-remaining") {
            self.remaining = v.to_str().ok().and_then(|s| s.parse().ok());
        }
        if let Some(v) = headers.get("x-ratelimit-reset") {
            self.reset_at = v.to_str().ok().and_then(|s| s.parse().ok());
        }
    }

    /// Record a successful call and reset backoff.
    fn record_success(&mut self) {
        if self.backoff_delay > Duration::ZERO {
            tracing::info!("GitHub backoff cleared after successful API call");
        }
        self.backoff_delay = Duration::ZERO;
        self.backoff_until = None;
    }

    /// Record a rate-limit response and escalate exponential backoff.
    fn record_rate_limit(&mut self) {
        self.backoff_delay = if self.backoff_delay.is_zero() {
            self.backoff_base
        } else {
            (self.backoff_delay * 2).min(self.backoff_max)
        };
        self.backoff_until = Some(Instant::now() + self.backoff_delay);
        tracing::warn!(
            delay_secs = self.backoff_delay.as_secs(),
            "GitHub rate limit hit, backing off"
        );
    }

    /// Returns remaining backoff/pause duration, or None if free to proceed.
    fn is_active(&self) -> Option<Duration> {
        if let Some(until) = self.backoff_until {
            let now = Instant::now();
            if now < until {
                return Some(until - now);
            }
        }
        // Proactive pause: nothing left in the window, wait until reset
        if self.remaining == Some(0) {
            if let Some(reset_epoch) = self.reset_at {
                let now_epoch = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                if now_epoch < reset_epoch {
                    return Some(Duration::from_secs(reset_epoch - now_epoch));
                }
            }
        }
        None
    }
}

// ── GhHttp client ────────────────────────────────────────────────────

/// A successful response body plus the next-page link, if any.
struct Page {
    text: String,
    next: Option<String>,
}

/// Native HTTP client for the GitHub API with connection pooling,
/// proactive rate-limit avoidance and local retries.
#[derive(Clone)]
pub struct GhHttp {
    client: Client,
    token: String,
    retry: RetryPolicy,
    rate: Arc<Mutex<RateLimit>>,
}

impl GhHttp {
    pub fn new(token: String, retry: RetryPolicy) -> anyhow::Result<Self> {
        if token.is_empty() {
            anyhow::bail!("no GitHub token found: set GH_TOKEN or GITHUB_TOKEN");
        }
        let client = Client::builder()
            .user_agent(concat!("sdlc-orch/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            token,
            retry,
            rate: Arc::new(Mutex::new(RateLimit::new(retry.base, retry.max))),
        })
    }

    // ── Rate-limit helpers ───────────────────────────────────────

    fn check_backoff(&self) -> anyhow::Result<()> {
        let active = self.rate.lock().ok().and_then(|rl| rl.is_active());
        if let Some(remaining) = active {
            anyhow::bail!(
                "GitHub API rate-limited, backoff active for {}s",
                remaining.as_secs()
            );
        }
        Ok(())
    }

    fn record(&self, status: StatusCode, headers: &header::HeaderMap, body: Option<&str>) {
        let Ok(mut rl) = self.rate.lock() else {
            return;
        };
        rl.update_from_headers(headers);
        // Not every 403 is a rate limit; only those whose body says so
        let limited = status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN && body.is_some_and(is_rate_limit_error));
        if limited {
            rl.record_rate_limit();
        } else if status.is_success() {
            rl.record_success();
        }
    }

    // ── Low-level HTTP helpers ────────────────────────────────────

    /// One attempt: send, record rate-limit state, fail on non-2xx.
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
        accept: &str,
    ) -> anyhow::Result<Page> {
        self.check_backoff()?;
        let mut req = self
            .client
            .request(method.clone(), url)
            .query(query)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(json) = body {
            req = req.json(json);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp.text().await.unwrap_or_default();
        self.record(status, &headers, Some(&text));
        if !status.is_success() {
            anyhow::bail!("GitHub API {method} {url} failed ({status}): {text}");
        }
        Ok(Page {
            text,
            next: parse_link_next(&headers),
        })
    }

    /// Send with local retries for transient failures.
    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
        accept: &str,
    ) -> anyhow::Result<Page> {
        let what = format!("{method} {url}");
        let this = self;
        self.retry
            .run(&what, is_transient, move || {
                this.send_once(method.clone(), url, query, body, accept)
            })
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<T> {
        let page = self.send(Method::GET, url, query, None, ACCEPT_JSON).await?;
        Ok(serde_json::from_str(&page.text)?)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<T> {
        let page = self.send(Method::POST, url, &[], Some(body), ACCEPT_JSON).await?;
        Ok(serde_json::from_str(&page.text)?)
    }

    /// Paginated GET following Link: <next> headers.
    async fn get_all_pages<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<Vec<T>> {
        let mut all: Vec<T> = Vec::new();
        let mut page = self.send(Method::GET, url, query, None, ACCEPT_JSON).await?;
        loop {
            let items: Vec<T> = serde_json::from_str(&page.text)?;
            all.extend(items);
            match page.next.take() {
                // The next link already carries the query string
                Some(next) => page = self.send(Method::GET, &next, &[], None, ACCEPT_JSON).await?,
                None => break,
            }
        }
        Ok(all)
    }

    // ── Endpoints ────────────────────────────────────────────────

    /// Verify the token by fetching the authenticated user.
    pub async fn auth_status(&self) -> anyhow::Result<()> {
        let _: serde_json::Value = self.get_json(&format!("{GITHUB_API}/user"), &[]).await?;
        Ok(())
    }

    pub async fn get_repo(&self, repo: &str) -> anyhow::Result<GitHubRepo> {
        self.get_json(&format!("{GITHUB_API}/repos/{repo}"), &[]).await
    }

    pub async fn get_issue(&self, repo: &str, number: u64) -> anyhow::Result<GitHubIssue> {
        self.get_json(&format!("{GITHUB_API}/repos/{repo}/issues/{number}"), &[])
            .await
    }

    /// Open issues and PRs updated since `since`, oldest update first.
    pub async fn list_open_issues(
        &self,
        repo: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<GitHubIssue>> {
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.get_all_pages(
            &format!("{GITHUB_API}/repos/{repo}/issues"),
            &[
                ("state", "open"),
                ("since", &since),
                ("sort", "updated"),
                ("direction", "asc"),
                ("per_page", "100"),
            ],
        )
        .await
    }

    pub async fn list_open_pulls(&self, repo: &str) -> anyhow::Result<Vec<GitHubPullRequest>> {
        self.get_all_pages(
            &format!("{GITHUB_API}/repos/{repo}/pulls"),
            &[
                ("state", "open"),
                ("sort", "updated"),
                ("direction", "desc"),
                ("per_page", "100"),
            ],
        )
        .await
    }

    /// Open PRs whose head is `owner:branch`.
    pub async fn find_open_pulls_for_branch(
        &self,
        repo: &str,
        branch: &str,
    ) -> anyhow::Result<Vec<GitHubPullRequest>> {
        let owner = repo.split('/').next().unwrap_or(repo);
        let head = format!("{owner}:{branch}");
        self.get_json(
            &format!("{GITHUB_API}/repos/{repo}/pulls"),
            &[("state", "open"), ("head", &head)],
        )
        .await
    }

    /// Repository-wide issue and PR comments created since `since`.
    pub async fn list_comments_since(
        &self,
        repo: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<GitHubComment>> {
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.get_all_pages(
            &format!("{GITHUB_API}/repos/{repo}/issues/comments"),
            &[
                ("since", &since),
                ("sort", "created"),
                ("direction", "asc"),
                ("per_page", "100"),
            ],
        )
        .await
    }

    pub async fn list_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> anyhow::Result<Vec<GitHubComment>> {
        self.get_all_pages(
            &format!("{GITHUB_API}/repos/{repo}/issues/{number}/comments"),
            &[("per_page", "100")],
        )
        .await
    }

    pub async fn get_labels(&self, repo: &str, number: u64) -> anyhow::Result<Vec<GitHubLabel>> {
        self.get_all_pages(
            &format!("{GITHUB_API}/repos/{repo}/issues/{number}/labels"),
            &[("per_page", "100")],
        )
        .await
    }

    pub async fn add_labels(&self, repo: &str, number: u64, labels: &[&str]) -> anyhow::Result<()> {
        let _: Vec<GitHubLabel> = self
            .post_json(
                &format!("{GITHUB_API}/repos/{repo}/issues/{number}/labels"),
                &serde_json::json!({ "labels": labels }),
            )
            .await?;
        Ok(())
    }

    /// Remove a label; 404 (label not present) is treated as success.
    pub async fn remove_label(&self, repo: &str, number: u64, label: &str) -> anyhow::Result<()> {
        let url = format!(
            "{GITHUB_API}/repos/{repo}/issues/{number}/labels/{}",
            urlencoding::encode(label)
        );
        match self.send(Method::DELETE, &url, &[], None, ACCEPT_JSON).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("(404") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn add_comment(&self, repo: &str, number: u64, body: &str) -> anyhow::Result<()> {
        let _: serde_json::Value = self
            .post_json(
                &format!("{GITHUB_API}/repos/{repo}/issues/{number}/comments"),
                &serde_json::json!({ "body": body }),
            )
            .await?;
        Ok(())
    }

    pub async fn create_review(
        &self,
        repo: &str,
        pr: u64,
        event: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        let _: serde_json::Value = self
            .post_json(
                &format!("{GITHUB_API}/repos/{repo}/pulls/{pr}/reviews"),
                &serde_json::json!({ "event": event, "body": body }),
            )
            .await?;
        Ok(())
    }

    pub async fn get_check_runs(&self, repo: &str, sha: &str) -> anyhow::Result<GitHubCheckRuns> {
        self.get_json(
            &format!("{GITHUB_API}/repos/{repo}/commits/{sha}/check-runs"),
            &[("per_page", "100")],
        )
        .await
    }

    pub async fn create_pull(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> anyhow::Result<GitHubPullRequest> {
        self.post_json(
            &format!("{GITHUB_API}/repos/{repo}/pulls"),
            &serde_json::json!({ "head": head, "base": base, "title": title, "body": body }),
        )
        .await
    }

    pub async fn update_pull(
        &self,
        repo: &str,
        pr: u64,
        title: &str,
        body: &str,
    ) -> anyhow::Result<GitHubPullRequest> {
        let page = self
            .send(
                Method::PATCH,
                &format!("{GITHUB_API}/repos/{repo}/pulls/{pr}"),
                &[],
                Some(&serde_json::json!({ "title": title, "body": body })),
                ACCEPT_JSON,
            )
            .await?;
        Ok(serde_json::from_str(&page.text)?)
    }

    pub async fn get_pull_diff(&self, repo: &str, pr: u64) -> anyhow::Result<String> {
        let page = self
            .send(
                Method::GET,
                &format!("{GITHUB_API}/repos/{repo}/pulls/{pr}"),
                &[],
                None,
                ACCEPT_DIFF,
            )
            .await?;
        Ok(page.text)
    }
}

// ── Link header parser ───────────────────────────────────────────────

/// Parse the `Link` header to find the `rel="next"` URL.
fn parse_link_next(headers: &header::HeaderMap) -> Option<String> {
    let link = headers.get("link")?.to_str().ok()?;
    for part in link.split(',') {
        let part = part.trim();
        if part.contains("rel=\"next\"") {
            let start = part.find('<')? + 1;
            let end = part.find('>')?;
            return Some(part[start..end].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(base: u64, max: u64) -> RateLimit {
        RateLimit::new(Duration::from_secs(base), Duration::from_secs(max))
    }

    #[test]
    fn parse_link_next_finds_next_url() {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "link",
            "<https://api.github.com/repos/foo/bar/issues?page=2>; rel=\"next\", <https://api.github.com/repos/foo/bar/issues?page=5>; rel=\"last\""
                .parse()
                .unwrap(),
        );
        assert_eq!(
            parse_link_next(&headers),
            Some("https://api.github.com/repos/foo/bar/issues?page=2".to_string())
        );
    }

    #[test]
    fn parse_link_next_none_when_no_next() {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "link",
            "<https://api.github.com/repos/foo/bar/issues?page=1>; rel=\"prev\""
                .parse()
                .unwrap(),
        );
        assert_eq!(parse_link_next(&headers), None);
        assert_eq!(parse_link_next(&header::HeaderMap::new()), None);
    }

    #[test]
    fn rate_limit_backoff_doubles_and_caps() {
        let mut rl = limiter(5, 12);
        assert!(rl.is_active().is_none());
        rl.record_rate_limit();
        assert!(rl.is_active().is_some());
        assert_eq!(rl.backoff_delay, Duration::from_secs(5));
        rl.record_rate_limit();
        assert_eq!(rl.backoff_delay, Duration::from_secs(10));
        rl.record_rate_limit();
        assert_eq!(rl.backoff_delay, Duration::from_secs(12));
    }

    #[test]
    fn rate_limit_success_resets() {
        let mut rl = limiter(5, 60);
        rl.record_rate_limit();
        rl.record_success();
        assert!(rl.is_active().is_none());
        assert_eq!(rl.backoff_delay, Duration::ZERO);
    }

    #[test]
    fn rate_limit_proactive_pause_from_headers() {
        let mut rl = limiter(30, 900);
        let reset = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 60;
        let mut headers = header::HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
        headers.insert("x-ratelimit-reset", reset.to_string().parse().unwrap());
        rl.update_from_headers(&headers);
        let pause = rl.is_active().unwrap();
        assert!(pause.as_secs() <= 61);
    }

    #[test]
    fn only_rate_limited_403s_trigger_backoff() {
        let gh = GhHttp::new("t".into(), RetryPolicy::default()).unwrap();
        let headers = header::HeaderMap::new();
        gh.record(StatusCode::FORBIDDEN, &headers, Some("Resource not accessible"));
        assert!(gh.check_backoff().is_ok());
        gh.record(StatusCode::FORBIDDEN, &headers, Some("You have exceeded a secondary rate limit"));
        assert!(gh.check_backoff().is_err());
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(GhHttp::new(String::new(), RetryPolicy::default()).is_err());
    }
}
