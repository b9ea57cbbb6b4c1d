//! Portal session: one authenticated identity, its cookie jar, and all
//! network sequencing.

use super::{
    parse_retry_after, read_body_limited, retry_backoff_ms, OperationResult, PortalConfig,
    PortalError,
};
use crate::dom::{parse_html, DomNode};
use crate::form::{self, ActionDescriptor, ActionKind};
use reqwest::blocking::Client;
use reqwest::cookie::CookieStore;
use reqwest::header::RETRY_AFTER;
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use url::Url;

/// Login identity for one session. Supplied per session, never persisted,
/// never logged.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

/// One comment on a package page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub content: String,
}

/// One news article with its full body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub url: String,
    pub full_content: String,
}

/// Package metadata from the portal's RPC endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Description", default)]
    pub description: Option<String>,
    #[serde(rename = "Maintainer", default)]
    pub maintainer: Option<String>,
    #[serde(rename = "NumVotes", default)]
    pub num_votes: u64,
    #[serde(rename = "Popularity", default)]
    pub popularity: f64,
    #[serde(rename = "OutOfDate", default)]
    pub out_of_date: Option<i64>,
    #[serde(rename = "LastModified", default)]
    pub last_modified: i64,
}

#[derive(Deserialize)]
struct RpcInfoResponse {
    #[serde(default)]
    results: Vec<PackageInfo>,
}

/// A portal session owning one authenticated identity's cookies. One
/// instance per logical actor; the struct holds mutable state with no
/// internal locking, so concurrent callers need one instance each.
pub struct Session {
    client: Client,
    config: PortalConfig,
    jar: Arc<reqwest::cookie::Jar>,
    authenticated: bool,
    last_request: Option<Instant>,
}

impl Session {
    pub fn new() -> Result<Self, PortalError> {
        Self::with_config(PortalConfig::default())
    }

    pub fn with_config(config: PortalConfig) -> Result<Self, PortalError> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let max_redirects = config.max_redirects;
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(Policy::custom(move |attempt| {
                if attempt.previous().len() >= max_redirects {
                    return attempt.stop();
                }
                attempt.follow()
            }))
            .cookie_provider(jar.clone())
            .build()
            .map_err(|e| PortalError::Network(e.to_string()))?;

        Ok(Self {
            client,
            config,
            jar,
            authenticated: false,
            last_request: None,
        })
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Log in to the portal. Success is classified solely by the presence
    /// of the session cookie afterwards: the portal answers HTTP 200 to
    /// rejected logins too, so the status code proves nothing.
    pub fn login(&mut self, credentials: &Credentials) -> OperationResult {
        self.authenticated = false;
        let base = match self.base_url() {
            Ok(url) => url,
            Err(e) => return OperationResult::transport(e),
        };

        // Baseline request first: the portal may hand out pre-auth cookies
        // the login submission must echo.
        if let Err(e) = self.get_page(&base) {
            return OperationResult::transport(e);
        }

        let login_url = match base.join("login") {
            Ok(url) => url,
            Err(e) => return OperationResult::transport(PortalError::InvalidUrl(e.to_string())),
        };
        let html = match self.get_page(&login_url) {
            Ok(html) => html,
            Err(e) => return OperationResult::transport(e),
        };

        let document = parse_html(&html);
        let resolved = match form::resolve(&document, &login_url, &ActionDescriptor::login()) {
            Ok(resolved) => resolved,
            Err(e) => {
                return OperationResult::ResolutionFailure {
                    reason: format!("{} at {}", e, login_url),
                }
            }
        };

        // Resolver-discovered defaults stay authoritative for everything
        // except the identity, secret, and remember keys.
        let overrides = vec![
            (self.config.identity_field.clone(), credentials.username.clone()),
            (self.config.secret_field.clone(), credentials.secret.clone()),
            (self.config.remember_field.clone(), "on".to_string()),
        ];
        let payload = resolved.merged_with(&overrides);

        tracing::debug!(url = %resolved.action, fields = payload.len(), "submitting login form");
        let response = match self.client.post(resolved.action.as_str()).form(&payload).send() {
            Ok(response) => response,
            Err(e) => {
                return OperationResult::TransportFailure {
                    reason: format!("{}: {}", resolved.action, e),
                }
            }
        };
        self.last_request = Some(Instant::now());
        let status = response.status();
        drop(response); // classification is cookie-based, the body is irrelevant

        if self.has_session_cookie(&base) {
            self.authenticated = true;
            tracing::info!("portal session established");
            OperationResult::Success {
                detail: "authenticated".to_string(),
            }
        } else {
            OperationResult::AuthFailure {
                reason: format!(
                    "no {} cookie after login (status {})",
                    self.config.session_cookie,
                    status.as_u16()
                ),
            }
        }
    }

    /// Execute a mutating portal action: fetch the action's page, resolve
    /// its form, merge caller fields over the discovered defaults, submit
    /// once, classify. Requires a prior successful login.
    pub fn perform(&mut self, action: &ActionDescriptor) -> OperationResult {
        if !self.authenticated {
            return OperationResult::AuthFailure {
                reason: "not logged in".to_string(),
            };
        }

        let page_url = match self.action_page_url(action) {
            Ok(url) => url,
            Err(e) => return OperationResult::transport(e),
        };
        let html = match self.get_page(&page_url) {
            Ok(html) => html,
            Err(e) => return OperationResult::transport(e),
        };

        let document = parse_html(&html);
        let resolved = match form::resolve(&document, &page_url, action) {
            Ok(resolved) => resolved,
            Err(e) => {
                return OperationResult::ResolutionFailure {
                    reason: format!("{} at {}", e, page_url),
                }
            }
        };
        if resolved.token_field.is_none() {
            tracing::warn!(url = %resolved.action, "no anti-forgery token in resolved form");
        }
        let payload = resolved.merged_with(&action.fields);

        // Submitted exactly once: a timeout here must surface to the caller,
        // not trigger a blind replay of a non-idempotent action.
        tracing::debug!(url = %resolved.action, kind = ?action.kind, "submitting action form");
        let response = match self.client.post(resolved.action.as_str()).form(&payload).send() {
            Ok(response) => response,
            Err(e) => {
                return OperationResult::TransportFailure {
                    reason: format!("{}: {}", resolved.action, e),
                }
            }
        };
        self.last_request = Some(Instant::now());

        let status = response.status();
        if matches!(status.as_u16(), 401 | 403) {
            return OperationResult::AuthFailure {
                reason: format!("{} rejected with {}", resolved.action, status.as_u16()),
            };
        }
        if !status.is_success() {
            return OperationResult::TransportFailure {
                reason: format!("{} returned {}", resolved.action, status.as_u16()),
            };
        }

        // Marker matching is best-effort against third-party markup: a 2xx
        // without the marker is an ambiguous success, not a failure.
        let body = read_body_limited(response, self.config.max_response_bytes).unwrap_or_default();
        let confirmed = action
            .kind
            .confirm_marker()
            .map(|marker| body.to_lowercase().contains(marker))
            .unwrap_or(false);
        OperationResult::Success {
            detail: if confirmed { "confirmed" } else { "unconfirmed" }.to_string(),
        }
    }

    /// Login-then-perform convenience used by the tool dispatchers.
    pub fn login_and_perform(
        &mut self,
        credentials: &Credentials,
        action: &ActionDescriptor,
    ) -> OperationResult {
        let login = self.login(credentials);
        if !login.is_success() {
            return login;
        }
        self.perform(action)
    }

    /// Fetch the comments shown on a package page. No login required.
    pub fn comments(&mut self, package: &str) -> Result<Vec<Comment>, PortalError> {
        let url = self.package_page_url(package)?;
        let html = self.get_page(&url)?;
        Ok(extract_comments_from(&parse_html(&html)))
    }

    /// Fetch the latest news articles, following each index link for the
    /// full body. Sequential article fetches are spaced by the rate gate.
    pub fn news(&mut self, limit: usize) -> Result<Vec<NewsItem>, PortalError> {
        let index_url =
            Url::parse(&self.config.news_url).map_err(|e| PortalError::InvalidUrl(e.to_string()))?;
        let html = self.get_page(&index_url)?;
        let links = extract_news_links_from(&parse_html(&html), &index_url);

        let mut items = Vec::new();
        for (title, url) in links.into_iter().take(limit) {
            // Index metadata still has value when one article fetch fails.
            let full_content = match self.get_page(&url) {
                Ok(article) => extract_article_body_from(&parse_html(&article)),
                Err(e) => {
                    tracing::warn!(%url, error = %e, "news article fetch failed");
                    String::new()
                }
            };
            items.push(NewsItem {
                title,
                url: url.to_string(),
                full_content,
            });
        }
        Ok(items)
    }

    /// Fetch package metadata over the RPC endpoint, which publishes a
    /// stable JSON contract unlike the scraped surfaces.
    pub fn package_info(&mut self, package: &str) -> Result<PackageInfo, PortalError> {
        let base = self.base_url()?;
        let url = base
            .join(&format!("rpc/v5/info/{}", package))
            .map_err(|e| PortalError::InvalidUrl(e.to_string()))?;

        self.wait_rate_gate();
        let response = self
            .client
            .get(url.as_str())
            .send()
            .map_err(|e| PortalError::Network(format!("{}: {}", url, e)))?;
        self.last_request = Some(Instant::now());

        let status = response.status();
        if !status.is_success() {
            return Err(PortalError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = read_body_limited(response, self.config.max_response_bytes)?;
        let rpc: RpcInfoResponse =
            serde_json::from_str(&body).map_err(|e| PortalError::Decode(e.to_string()))?;
        rpc.results
            .into_iter()
            .next()
            .ok_or_else(|| PortalError::NotFound(format!("package {}", package)))
    }

    fn base_url(&self) -> Result<Url, PortalError> {
        Url::parse(&self.config.base_url).map_err(|e| PortalError::InvalidUrl(e.to_string()))
    }

    fn package_page_url(&self, package: &str) -> Result<Url, PortalError> {
        self.base_url()?
            .join(&format!("packages/{}", package))
            .map_err(|e| PortalError::InvalidUrl(e.to_string()))
    }

    /// The page whose markup carries the form for this action.
    fn action_page_url(&self, action: &ActionDescriptor) -> Result<Url, PortalError> {
        let path = match action.kind {
            ActionKind::Login => "login".to_string(),
            ActionKind::AddComment => {
                format!("packages/{}", Self::required_package(action)?)
            }
            ActionKind::EditComment => {
                let id = action.comment_id.ok_or_else(|| {
                    PortalError::InvalidUrl("edit-comment needs a comment id".to_string())
                })?;
                format!("pkgbase/{}/comments/{}/edit", Self::required_package(action)?, id)
            }
            ActionKind::SubmitRequest => {
                format!("pkgbase/{}/request", Self::required_package(action)?)
            }
        };
        self.base_url()?
            .join(&path)
            .map_err(|e| PortalError::InvalidUrl(e.to_string()))
    }

    fn required_package(action: &ActionDescriptor) -> Result<&str, PortalError> {
        action.package.as_deref().ok_or_else(|| {
            PortalError::InvalidUrl(format!("{:?} needs a target package", action.kind))
        })
    }

    fn has_session_cookie(&self, base: &Url) -> bool {
        let Some(header) = self.jar.cookies(base) else {
            return false;
        };
        let needle = format!("{}=", self.config.session_cookie);
        header
            .to_str()
            .map(|cookies| cookies.split("; ").any(|c| c.starts_with(&needle)))
            .unwrap_or(false)
    }

    /// Rate-gated GET with bounded backoff. Only used for idempotent page
    /// reads; mutating POSTs go out exactly once.
    fn get_page(&mut self, url: &Url) -> Result<String, PortalError> {
        let max_attempts = self.config.retry_attempts + 1;
        let mut attempts = 0usize;
        loop {
            self.wait_rate_gate();
            let response = self
                .client
                .get(url.as_str())
                .send()
                .map_err(|e| PortalError::Network(format!("{}: {}", url, e)))?;
            self.last_request = Some(Instant::now());

            let status = response.status();
            if status.is_success() {
                return read_body_limited(response, self.config.max_response_bytes);
            }

            let retry_after = response.headers().get(RETRY_AFTER).and_then(parse_retry_after);
            attempts += 1;
            let retryable = matches!(status.as_u16(), 403 | 408 | 429 | 500 | 502 | 503 | 504);
            if attempts >= max_attempts || !retryable {
                return Err(PortalError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            let delay = retry_backoff_ms(self.config.retry_delay_ms, attempts - 1, retry_after);
            tracing::debug!(%url, status = status.as_u16(), delay_ms = delay, "retrying page fetch");
            thread::sleep(Duration::from_millis(delay));
        }
    }

    /// Cooperative spacing between sequential requests. A wait, not a lock:
    /// the session is single-actor by contract.
    fn wait_rate_gate(&mut self) {
        let min = Duration::from_millis(self.config.min_request_delay_ms);
        if min.is_zero() {
            return;
        }
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < min {
                thread::sleep(min - elapsed);
            }
        }
    }
}

// ---- Package page comment parser ----

/// Parse package-page comments from a DOM tree. Public for testing.
pub fn extract_comments_from(dom: &DomNode) -> Vec<Comment> {
    let mut comments = Vec::new();
    collect_comments(dom, &mut comments);
    comments
}

fn collect_comments(node: &DomNode, comments: &mut Vec<Comment>) {
    let children = &node.children;
    for (i, child) in children.iter().enumerate() {
        if !(child.is_element("h4") && child.has_class("comment-header")) {
            continue;
        }
        let author = comment_author(child);
        // The body is the next article-content sibling before another header.
        let mut content = String::new();
        for sibling in &children[i + 1..] {
            if sibling.is_element("h4") && sibling.has_class("comment-header") {
                break;
            }
            if sibling.has_class("article-content") {
                content = sibling.text_content();
                break;
            }
        }
        if !author.is_empty() || !content.is_empty() {
            comments.push(Comment { author, content });
        }
    }
    for child in children {
        collect_comments(child, comments);
    }
}

/// The author link inside a comment header, falling back to the header's
/// first word for markup that inlines the name.
fn comment_author(header: &DomNode) -> String {
    if let Some(link) = header.find(&|n| n.is_element("a")) {
        let text = link.text_content();
        if !text.is_empty() {
            return text;
        }
    }
    header
        .text_content()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string()
}

// ---- News parser ----

/// Parse article links out of the news index. Public for testing.
/// Returns `(title, absolute url)` pairs in page order, deduplicated.
pub fn extract_news_links_from(dom: &DomNode, base: &Url) -> Vec<(String, Url)> {
    let mut links: Vec<(String, Url)> = Vec::new();
    for anchor in dom.find_all(&|n| n.is_element("a") && n.get_attr("href").is_some()) {
        let href = anchor.get_attr("href").unwrap_or("");
        let Ok(mut url) = base.join(href) else {
            continue;
        };
        url.set_fragment(None);
        if !url.path().starts_with("/news/") {
            continue;
        }
        // The index root and pagination links carry no article slug.
        let slug = url.path().trim_start_matches("/news/").trim_end_matches('/');
        if slug.is_empty() {
            continue;
        }
        let title = anchor.text_content();
        if title.is_empty() {
            continue;
        }
        if links.iter().any(|(_, existing)| existing == &url) {
            continue;
        }
        links.push((title, url));
    }
    links
}

/// Pull the article body out of a news page. Public for testing.
pub fn extract_article_body_from(dom: &DomNode) -> String {
    dom.find(&|n| n.has_class("article-content"))
        .map(|n| n.text_content())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::parse_html;

    fn quiet_session(min_delay_ms: u64) -> Session {
        Session::with_config(PortalConfig {
            min_request_delay_ms: min_delay_ms,
            ..PortalConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn perform_before_login_fails_without_network() {
        // An unroutable base URL proves no request is attempted.
        let mut session = Session::with_config(PortalConfig {
            base_url: "http://aur.invalid".to_string(),
            ..PortalConfig::default()
        })
        .unwrap();
        let result = session.perform(&ActionDescriptor::add_comment("yay", "hi"));
        assert_eq!(
            result,
            OperationResult::AuthFailure {
                reason: "not logged in".to_string()
            }
        );
    }

    #[test]
    fn rate_gate_spaces_sequential_requests() {
        let mut session = quiet_session(50);
        session.last_request = Some(Instant::now());
        let started = Instant::now();
        session.wait_rate_gate();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn rate_gate_is_a_noop_when_disabled_or_idle() {
        let mut session = quiet_session(0);
        session.last_request = Some(Instant::now());
        let started = Instant::now();
        session.wait_rate_gate();
        assert!(started.elapsed() < Duration::from_millis(10));

        let mut session = quiet_session(5_000);
        let started = Instant::now();
        session.wait_rate_gate(); // no prior request, nothing to space
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn session_cookie_detection_is_name_exact() {
        let session = quiet_session(0);
        let base = Url::parse("https://aur.archlinux.org").unwrap();
        assert!(!session.has_session_cookie(&base));

        session
            .jar
            .add_cookie_str("AURTZ=UTC; Path=/", &base);
        assert!(!session.has_session_cookie(&base));

        session
            .jar
            .add_cookie_str("AURSID=abc123; Path=/", &base);
        assert!(session.has_session_cookie(&base));
    }

    #[test]
    fn action_page_urls_follow_the_descriptor() {
        let session = quiet_session(0);
        let url = session
            .action_page_url(&ActionDescriptor::add_comment("yay", "hi"))
            .unwrap();
        assert_eq!(url.as_str(), "https://aur.archlinux.org/packages/yay");

        let url = session
            .action_page_url(&ActionDescriptor::edit_comment("yay", 42, "hi"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://aur.archlinux.org/pkgbase/yay/comments/42/edit"
        );

        let mut orphaned = ActionDescriptor::add_comment("yay", "hi");
        orphaned.package = None;
        assert!(session.action_page_url(&orphaned).is_err());
    }

    #[test]
    fn comment_extraction_pairs_headers_with_bodies() {
        let html = r#"
        <html><body>
        <div id="comments" class="comments package-comments">
            <h4 id="comment-900001" class="comment-header">
                <a href="/account/alice">alice</a> commented on 2026-07-01
            </h4>
            <div id="comment-900001-content" class="article-content">
                <p>Builds fine on aarch64.</p>
            </div>
            <h4 id="comment-900002" class="comment-header">
                <a href="/account/bob">bob</a> commented on 2026-07-02
            </h4>
            <div id="comment-900002-content" class="article-content">
                <p>Please bump to 2.1 — upstream fixed the CVE.</p>
            </div>
        </div>
        </body></html>"#;
        let comments = extract_comments_from(&parse_html(html));
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].author, "alice");
        assert_eq!(comments[0].content, "Builds fine on aarch64.");
        assert_eq!(comments[1].author, "bob");
        assert!(comments[1].content.contains("2.1"));
    }

    #[test]
    fn comment_extraction_tolerates_missing_bodies() {
        let html = r#"
        <div class="comments">
            <h4 class="comment-header"><a>carol</a> commented</h4>
            <h4 class="comment-header"><a>dave</a> commented</h4>
            <div class="article-content">only dave has a body</div>
        </div>"#;
        let comments = extract_comments_from(&parse_html(html));
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].author, "carol");
        assert_eq!(comments[0].content, "");
        assert_eq!(comments[1].content, "only dave has a body");
    }

    #[test]
    fn news_link_extraction_skips_index_and_pagination() {
        let base = Url::parse("https://archlinux.org/news/").unwrap();
        let html = r#"
        <html><body>
        <a href="/news/">News</a>
        <a href="/news/?page=2">Next</a>
        <table>
            <tr><td><a href="/news/critical-openssl-update/">Critical OpenSSL update</a></td></tr>
            <tr><td><a href="/news/mirror-maintenance/">Mirror maintenance</a></td></tr>
            <tr><td><a href="/news/critical-openssl-update/">Critical OpenSSL update</a></td></tr>
        </table>
        <a href="https://wiki.archlinux.org/">Wiki</a>
        </body></html>"#;
        let links = extract_news_links_from(&parse_html(html), &base);
        let titles: Vec<_> = links.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(titles, vec!["Critical OpenSSL update", "Mirror maintenance"]);
        assert_eq!(
            links[0].1.as_str(),
            "https://archlinux.org/news/critical-openssl-update/"
        );
    }

    #[test]
    fn article_body_extraction() {
        let html = r#"
        <html><body>
        <h2 class="title">Critical OpenSSL update</h2>
        <div class="article-content">
            <p>Update immediately.</p><p>Details follow.</p>
        </div>
        </body></html>"#;
        let body = extract_article_body_from(&parse_html(html));
        assert_eq!(body, "Update immediately. Details follow.");

        assert_eq!(extract_article_body_from(&parse_html("<p>nothing</p>")), "");
    }

    #[test]
    fn rpc_payload_decodes_into_package_info() {
        let body = r#"{
            "resultcount": 1,
            "results": [{
                "Name": "yay",
                "Version": "12.3.5-1",
                "Description": "Yet another yogurt.",
                "Maintainer": "jguer",
                "NumVotes": 2412,
                "Popularity": 44.21,
                "OutOfDate": null,
                "LastModified": 1753970000
            }],
            "type": "multiinfo",
            "version": 5
        }"#;
        let rpc: RpcInfoResponse = serde_json::from_str(body).unwrap();
        let info = rpc.results.into_iter().next().unwrap();
        assert_eq!(info.name, "yay");
        assert_eq!(info.maintainer.as_deref(), Some("jguer"));
        assert_eq!(info.out_of_date, None);
        assert_eq!(info.num_votes, 2412);
    }
}
