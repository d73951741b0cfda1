//! HTTP client for a Marzban panel, the backend that owns the VPN accounts.
//!
//! The panel authenticates with short-lived bearer tokens. [`TokenCache`] keeps
//! the current one, refreshes it shortly before it lapses, and is shared with
//! the optional background refresher. Any request answered with `401` is
//! retried once with a freshly issued token.

use crate::config::AccountServiceConfig;
use crate::domain::ports::{AccountService, months_to_duration};
use crate::error::AccountError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type AccountResult<T> = std::result::Result<T, AccountError>;

const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 300;
const MIN_TOKEN_TTL_SECS: i64 = 60;
const MIN_REFRESHER_SLEEP: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PanelUser {
    #[serde(default)]
    expire: Option<i64>,
    #[serde(default)]
    subscription_url: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    /// Already shortened by the refresh margin.
    valid_until: DateTime<Utc>,
}

/// How long a freshly issued token is used before it is replaced.
fn token_lifetime(expires_in: Option<i64>) -> TimeDelta {
    let ttl = expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS) - REFRESH_MARGIN_SECS;
    TimeDelta::seconds(ttl.max(MIN_TOKEN_TTL_SECS))
}

/// Admin token for the panel, fetched lazily and renewed before expiry.
pub struct TokenCache {
    http: Client,
    token_url: String,
    username: String,
    password: String,
    current: Mutex<Option<CachedToken>>,
    refresher_started: AtomicBool,
}

impl TokenCache {
    pub fn new(http: Client, config: &AccountServiceConfig) -> Self {
        Self {
            http,
            token_url: format!("{}/api/admin/token", config.base_url.trim_end_matches('/')),
            username: config.username.clone(),
            password: config.password.clone(),
            current: Mutex::new(None),
            refresher_started: AtomicBool::new(false),
        }
    }

    /// Returns the cached token, fetching a new one when none is cached or the
    /// cached one is within the refresh margin of its expiry.
    ///
    /// The cache lock is held across the token request, so concurrent callers
    /// wait for one fetch instead of each starting their own.
    pub async fn get_valid_token(&self) -> AccountResult<String> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref()
            && token.valid_until > Utc::now()
        {
            return Ok(token.value.clone());
        }
        let token = self.fetch().await?;
        let value = token.value.clone();
        *current = Some(token);
        Ok(value)
    }

    /// Unconditionally replaces the cached token. Holds the cache lock across
    /// the request like [`Self::get_valid_token`].
    pub async fn refresh(&self) -> AccountResult<String> {
        let mut current = self.current.lock().await;
        let token = self.fetch().await?;
        let value = token.value.clone();
        *current = Some(token);
        Ok(value)
    }

    async fn fetch(&self) -> AccountResult<CachedToken> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!(%status, "Marzban rejected admin credentials");
            return Err(AccountError::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "Marzban token request failed");
            return Err(AccountError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = resp.json().await?;
        info!("Obtained new Marzban token");
        Ok(CachedToken {
            value: token.access_token,
            valid_until: Utc::now() + token_lifetime(token.expires_in),
        })
    }

    async fn sleep_budget(&self) -> Duration {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(token) => (token.valid_until - Utc::now())
                .to_std()
                .unwrap_or_default()
                .max(MIN_REFRESHER_SLEEP),
            None => Duration::from_secs(60),
        }
    }

    /// Starts the background task that renews the token ahead of expiry.
    ///
    /// Only the first call spawns; later calls return `None`.
    pub fn spawn_refresher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.refresher_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let cache = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(cache.sleep_budget().await).await;
                if let Err(e) = cache.refresh().await {
                    warn!(error = %e, "Background Marzban token refresh failed");
                }
            }
        }))
    }

    #[cfg(test)]
    async fn seed(&self, value: &str, valid_until: DateTime<Utc>) {
        *self.current.lock().await = Some(CachedToken {
            value: value.to_string(),
            valid_until,
        });
    }
}

/// [`AccountService`] backed by the Marzban REST API.
#[derive(Clone)]
pub struct MarzbanClient {
    http: Client,
    base_url: String,
    tokens: Arc<TokenCache>,
}

impl MarzbanClient {
    pub fn new(http: Client, config: &AccountServiceConfig) -> Self {
        let tokens = Arc::new(TokenCache::new(http.clone(), config));
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    pub fn spawn_token_refresher(&self) -> Option<JoinHandle<()>> {
        self.tokens.spawn_refresher()
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        token: &str,
    ) -> AccountResult<Response> {
        let mut request = self.http.request(method.clone(), url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> AccountResult<Response> {
        let url = format!("{}/api{}", self.base_url, path);
        let token = self.tokens.get_valid_token().await?;
        debug!(%method, %url, "Marzban request");

        let resp = self.send_once(&method, &url, body, &token).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        warn!(%method, %url, "Marzban token rejected, refreshing");
        let token = self.tokens.refresh().await?;
        let resp = self.send_once(&method, &url, body, &token).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(AccountError::Unauthorized);
        }
        Ok(resp)
    }

    async fn fetch_user(&self, account_id: &str) -> AccountResult<PanelUser> {
        let resp = self
            .request(Method::GET, &format!("/user/{account_id}"), None)
            .await?;
        Ok(check(resp, account_id).await?.json().await?)
    }

    fn absolute_link(&self, link: String) -> String {
        if link.starts_with('/') {
            format!("{}{}", self.base_url, link)
        } else {
            link
        }
    }
}

async fn check(resp: Response, account_id: &str) -> AccountResult<Response> {
    let status = resp.status();
    match status {
        s if s.is_success() => Ok(resp),
        StatusCode::NOT_FOUND => Err(AccountError::NotFound(account_id.to_string())),
        StatusCode::CONFLICT => Err(AccountError::AlreadyExists(account_id.to_string())),
        StatusCode::FORBIDDEN => Err(AccountError::Unauthorized),
        _ => {
            let body = resp.text().await.unwrap_or_default();
            Err(AccountError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Zero and null both mean "never expires" on the panel.
fn expiry_from_panel(expire: Option<i64>) -> Option<DateTime<Utc>> {
    expire
        .filter(|ts| *ts > 0)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}

#[async_trait]
impl AccountService for MarzbanClient {
    async fn provision(&self, account_id: &str, months: u32) -> AccountResult<()> {
        let expire = months_to_duration(months)
            .and_then(|duration| Utc::now().checked_add_signed(duration))
            .ok_or(AccountError::DurationOutOfRange(months))?
            .timestamp();
        let payload = json!({
            "username": account_id,
            "status": "active",
            "expire": expire,
            "data_limit": 0,
            "data_limit_reset_strategy": "no_reset",
            "proxies": { "vless": {} },
            "note": format!("Paid subscription, {months} mo."),
        });

        let resp = self.request(Method::POST, "/user", Some(&payload)).await?;
        check(resp, account_id).await?;
        info!(account = %account_id, months, "Provisioned Marzban user");
        Ok(())
    }

    async fn expiry(&self, account_id: &str) -> AccountResult<Option<DateTime<Utc>>> {
        Ok(expiry_from_panel(self.fetch_user(account_id).await?.expire))
    }

    async fn extend_to(&self, account_id: &str, until: DateTime<Utc>) -> AccountResult<()> {
        let payload = json!({ "expire": until.timestamp() });
        let resp = self
            .request(Method::PUT, &format!("/user/{account_id}"), Some(&payload))
            .await?;
        check(resp, account_id).await?;
        info!(account = %account_id, %until, "Extended Marzban user");
        Ok(())
    }

    async fn get_link(&self, account_id: &str) -> AccountResult<Option<String>> {
        let user = self.fetch_user(account_id).await?;
        Ok(user
            .subscription_url
            .filter(|link| !link.is_empty())
            .map(|link| self.absolute_link(link)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Mock, Server, ServerGuard};

    fn client(server: &ServerGuard) -> MarzbanClient {
        MarzbanClient::new(
            Client::new(),
            &AccountServiceConfig {
                base_url: server.url(),
                username: "admin".to_string(),
                password: "pw".to_string(),
            },
        )
    }

    async fn token_mock(server: &mut ServerGuard, token: &str) -> Mock {
        server
            .mock("POST", "/api/admin/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("username".into(), "admin".into()),
                Matcher::UrlEncoded("password".into(), "pw".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"access_token":"{token}","token_type":"bearer","expires_in":86400}}"#
            ))
            .create_async()
            .await
    }

    #[test]
    fn test_token_lifetime_keeps_margin_and_floor() {
        assert_eq!(token_lifetime(None), TimeDelta::seconds(3300));
        assert_eq!(token_lifetime(Some(600)), TimeDelta::seconds(300));
        assert_eq!(token_lifetime(Some(120)), TimeDelta::seconds(60));
    }

    #[test]
    fn test_zero_expiry_means_unlimited() {
        assert_eq!(expiry_from_panel(Some(0)), None);
        assert_eq!(expiry_from_panel(None), None);
        assert_eq!(
            expiry_from_panel(Some(1_700_000_000)),
            DateTime::from_timestamp(1_700_000_000, 0)
        );
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let mut server = Server::new_async().await;
        let token = token_mock(&mut server, "t1").await;
        let client = client(&server);

        assert_eq!(client.tokens().get_valid_token().await.unwrap(), "t1");
        assert_eq!(client.tokens().get_valid_token().await.unwrap(), "t1");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_token_fetch() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/api/admin/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"t1","token_type":"bearer","expires_in":86400}"#)
            .expect(1)
            .create_async()
            .await;
        let client = client(&server);
        let tokens = client.tokens();

        let (a, b, c) = tokio::join!(
            tokens.get_valid_token(),
            tokens.get_valid_token(),
            tokens.get_valid_token()
        );
        for fetched in [a, b, c] {
            assert_eq!(fetched.unwrap(), "t1");
        }
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_bad_credentials_are_unauthorized() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("POST", "/api/admin/token")
            .with_status(401)
            .create_async()
            .await;

        let result = client(&server).tokens().get_valid_token().await;
        assert_eq!(result, Err(AccountError::Unauthorized));
    }

    #[tokio::test]
    async fn test_provision_posts_active_user() {
        let mut server = Server::new_async().await;
        let _token = token_mock(&mut server, "t1").await;
        let create = server
            .mock("POST", "/api/user")
            .match_header("authorization", "Bearer t1")
            .match_body(Matcher::PartialJson(json!({
                "username": "paid_42_7",
                "status": "active",
            })))
            .with_status(200)
            .with_body(r#"{"username":"paid_42_7"}"#)
            .create_async()
            .await;

        client(&server).provision("paid_42_7", 2).await.unwrap();
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_provision_conflict_is_already_exists() {
        let mut server = Server::new_async().await;
        let _token = token_mock(&mut server, "t1").await;
        let _create = server
            .mock("POST", "/api/user")
            .with_status(409)
            .with_body(r#"{"detail":"User already exists"}"#)
            .create_async()
            .await;

        let result = client(&server).provision("paid_42_7", 1).await;
        assert_eq!(result, Err(AccountError::AlreadyExists("paid_42_7".into())));
    }

    #[tokio::test]
    async fn test_expiry_and_link() {
        let mut server = Server::new_async().await;
        let _token = token_mock(&mut server, "t1").await;
        let _user = server
            .mock("GET", "/api/user/alice")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"username":"alice","expire":1700000000,"subscription_url":"/sub/abc"}"#)
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/api/user/ghost")
            .with_status(404)
            .with_body(r#"{"detail":"User not found"}"#)
            .create_async()
            .await;
        let client = client(&server);

        assert_eq!(
            client.expiry("alice").await.unwrap(),
            DateTime::from_timestamp(1_700_000_000, 0)
        );
        assert_eq!(
            client.get_link("alice").await.unwrap(),
            Some(format!("{}/sub/abc", server.url()))
        );
        assert_eq!(
            client.expiry("ghost").await,
            Err(AccountError::NotFound("ghost".into()))
        );
    }

    #[tokio::test]
    async fn test_extend_adds_months_to_future_expiry() {
        let mut server = Server::new_async().await;
        let _token = token_mock(&mut server, "t1").await;
        let current = Utc::now().timestamp() + 10 * 86_400;
        let _user = server
            .mock("GET", "/api/user/alice")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"username":"alice","expire":{current}}}"#))
            .create_async()
            .await;
        let update = server
            .mock("PUT", "/api/user/alice")
            .match_body(Matcher::Json(json!({ "expire": current + 60 * 86_400 })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        client(&server).extend("alice", 2).await.unwrap();
        update.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_token_is_refreshed_once() {
        let mut server = Server::new_async().await;
        let token = token_mock(&mut server, "fresh").await;
        let stale = server
            .mock("GET", "/api/user/alice")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/api/user/alice")
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"username":"alice","expire":0,"subscription_url":"https://vpn/sub/x"}"#)
            .create_async()
            .await;
        let client = client(&server);
        client
            .tokens()
            .seed("stale", Utc::now() + TimeDelta::hours(1))
            .await;

        assert_eq!(
            client.get_link("alice").await.unwrap(),
            Some("https://vpn/sub/x".to_string())
        );
        stale.assert_async().await;
        ok.assert_async().await;
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_only_one_refresher_is_spawned() {
        let server = Server::new_async().await;
        let client = client(&server);

        let first = client.spawn_token_refresher();
        assert!(first.is_some());
        assert!(client.spawn_token_refresher().is_none());
        if let Some(handle) = first {
            handle.abort();
        }
    }
}
