//! Per-request throttle policy.
//!
//! [`ThrottleRequests::handle`] decides whether a request may reach the
//! downstream handler. Limits come from an inline `"max,decay"` role, a named
//! preset or the configured defaults, in that order. Two-tier presets count
//! the client address first and then the account named in the request input.

use crate::client_ip::{resolve_client_ip, TrustedProxies};
use crate::config::{ConfigRepository, ThrottleSettings, THROTTLE_CONFIG_ROOT};
use crate::error::ThrottleResult;
use crate::input::{extract_field, wants_json};
use crate::key_generator::{account_key, caller_key, ip_key, normalized_path};
use crate::rate_limit_config::{inline_pair, AccountTier, Limits, Preset};
use crate::rate_limiter::{AttemptOutcome, RateLimiter};
use crate::response::{apply_rate_limit_headers, too_many_requests};
use axum::extract::Request;
use axum::response::Response;
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Derives the throttle key straight from the request.
pub type KeyResolver = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// Selects the limits and the key of a throttled route.
#[derive(Clone, Default)]
pub enum Role {
    /// Configured default limits, keyed by client address.
    #[default]
    Default,
    /// Inline `"max,decay"` limits or the name of a preset.
    Named(String),
    /// Default limits under a caller supplied key. An empty or missing key
    /// falls back to the client address; an over-long key is hashed.
    Key(KeyResolver),
}

impl Role {
    pub fn key<F>(resolver: F) -> Self
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        Role::Key(Arc::new(resolver))
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Role::Named(value.to_string())
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Role::Named(value)
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Default => f.write_str("Default"),
            Role::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Role::Key(_) => f.write_str("Key(..)"),
        }
    }
}

pub struct ThrottleRequests {
    limiter: RateLimiter,
    settings: ThrottleSettings,
    except: Vec<Regex>,
    proxies: TrustedProxies,
    config: Option<Arc<dyn ConfigRepository>>,
}

impl ThrottleRequests {
    pub fn new(limiter: RateLimiter, settings: ThrottleSettings) -> Self {
        let except = settings
            .except
            .iter()
            .filter_map(|pattern| compile_except(pattern))
            .collect();
        let proxies = TrustedProxies::new(settings.trusted_proxies.iter().cloned());

        Self {
            limiter,
            settings,
            except,
            proxies,
            config: None,
        }
    }

    /// Resolve presets from `config`.
    pub fn with_config(mut self, config: Arc<dyn ConfigRepository>) -> Self {
        self.config = Some(config);
        self
    }

    /// Settings and presets both read from `config`.
    pub fn from_config(limiter: RateLimiter, config: Arc<dyn ConfigRepository>) -> Self {
        let settings = ThrottleSettings::from_repository(Some(config.as_ref()));
        Self::new(limiter, settings).with_config(config)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn settings(&self) -> &ThrottleSettings {
        &self.settings
    }

    /// Whether `path` matches one of the exclusion patterns.
    pub fn is_excepted(&self, path: &str) -> bool {
        let path = trim_path(path);
        self.except.iter().any(|pattern| pattern.is_match(path))
    }

    /// Count the request and either run `next` or answer 429.
    ///
    /// Storage failures are returned, never treated as a pass.
    pub async fn handle<F, Fut>(&self, request: Request, next: F, role: &Role) -> ThrottleResult<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        if !self.settings.enabled || self.is_excepted(request.uri().path()) {
            return Ok(next(request).await);
        }

        let defaults = self.settings.defaults;
        match role {
            Role::Default => self.single_tier(request, next, defaults, None).await,
            Role::Key(resolver) => {
                let key = (**resolver)(&request)
                    .filter(|key| !key.is_empty())
                    .map(caller_key);
                self.single_tier(request, next, defaults, key).await
            }
            Role::Named(name) => {
                if let Some(limits) = Limits::parse_inline(name) {
                    return self.single_tier(request, next, limits, None).await;
                }
                if let Some((max_attempts, decay_seconds)) = inline_pair(name) {
                    warn!(
                        role = %name,
                        max_attempts,
                        decay_seconds,
                        "Inline limits must be positive, trying it as a preset name"
                    );
                }

                match self.preset(name) {
                    Some(Preset::TwoTier { ip, account }) => {
                        let ip = ip.unwrap_or_else(|| {
                            warn!(preset = %name, "Preset has no usable IP limits, using defaults");
                            defaults
                        });
                        self.two_tier(request, next, ip, &account).await
                    }
                    Some(Preset::Single(Some(limits))) => self.single_tier(request, next, limits, None).await,
                    Some(Preset::Single(None)) => {
                        warn!(preset = %name, "Preset has no usable limits, using defaults");
                        self.single_tier(request, next, defaults, None).await
                    }
                    None => {
                        warn!(role = %name, "Unknown throttle role, using defaults");
                        self.single_tier(request, next, defaults, None).await
                    }
                }
            }
        }
    }

    async fn single_tier<F, Fut>(
        &self,
        request: Request,
        next: F,
        limits: Limits,
        key: Option<String>,
    ) -> ThrottleResult<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let key = key.unwrap_or_else(|| self.client_key(&request));

        let outcome = self.count(&key, limits).await?;
        if outcome.limited {
            return self.throttled(&key, limits, wants_json(&request)).await;
        }

        self.pass(request, next, &key, limits, outcome).await
    }

    async fn two_tier<F, Fut>(
        &self,
        request: Request,
        next: F,
        ip_limits: Limits,
        account: &AccountTier,
    ) -> ThrottleResult<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let ip_key = self.client_key(&request);
        let wants_json = wants_json(&request);

        let outcome = self.count(&ip_key, ip_limits).await?;
        if outcome.limited {
            return self.throttled(&ip_key, ip_limits, wants_json).await;
        }

        let Some(account_limits) = account.limits else {
            return self.pass(request, next, &ip_key, ip_limits, outcome).await;
        };

        let (request, value) = extract_field(request, &account.field).await?;
        let path = normalized_path(request.uri());
        if let Some(key) = value.and_then(|value| account_key(&value, request.method(), &path)) {
            let account_outcome = self.count(&key, account_limits).await?;
            if account_outcome.limited {
                return self.throttled(&key, account_limits, wants_json).await;
            }
        }

        self.pass(request, next, &ip_key, ip_limits, outcome).await
    }

    async fn count(&self, key: &str, limits: Limits) -> ThrottleResult<AttemptOutcome> {
        let outcome = self
            .limiter
            .attempt(key, limits.max_attempts, limits.decay_seconds)
            .await?;

        debug!(
            key = %key,
            attempts = outcome.attempts,
            limit = limits.max_attempts,
            limited = outcome.limited,
            "Counted request"
        );

        Ok(outcome)
    }

    async fn pass<F, Fut>(
        &self,
        request: Request,
        next: F,
        key: &str,
        limits: Limits,
        outcome: AttemptOutcome,
    ) -> ThrottleResult<Response>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let mut response = next(request).await;

        let reset_at = self.limiter.now() + self.limiter.available_in(key).await?;
        apply_rate_limit_headers(&mut response, limits.max_attempts, outcome.remaining, reset_at);

        Ok(response)
    }

    async fn throttled(&self, key: &str, limits: Limits, wants_json: bool) -> ThrottleResult<Response> {
        let retry_after = self.limiter.available_in(key).await?;
        let reset_at = self.limiter.now() + retry_after;

        warn!(
            key = %key,
            limit = limits.max_attempts,
            retry_after,
            "Request throttled"
        );

        Ok(too_many_requests(wants_json, limits.max_attempts, retry_after, reset_at))
    }

    fn client_key(&self, request: &Request) -> String {
        let ip = resolve_client_ip(request, &self.proxies);
        ip_key(&ip, request.method(), &normalized_path(request.uri()))
    }

    fn preset(&self, name: &str) -> Option<Preset> {
        let presets = self
            .config
            .as_ref()?
            .get(&format!("{}.presets", THROTTLE_CONFIG_ROOT))?;
        Preset::from_value(presets.get(name)?)
    }
}

/// Paths compare without their leading slash; the root is `/`.
fn trim_path(path: &str) -> &str {
    match path.trim_start_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn compile_except(pattern: &str) -> Option<Regex> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return None;
    }

    let source = format!("(?i)^{}$", regex::escape(trim_path(pattern)).replace(r"\*", ".*"));
    Regex::new(&source)
        .map_err(|e| warn!(pattern = %pattern, error = %e, "Ignoring invalid except pattern"))
        .ok()
}
