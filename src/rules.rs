//! Rule-driven cacheability decisions.
//!
//! The rule engine evaluates a request's attributes against the configured
//! reject lists and answers two questions: may this response be cached, and
//! under which variant. Evaluation never fails — a malformed pattern is
//! dropped at compile time with a warning, and an empty rule set means
//! "cacheable, no variant".

use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::RulesSettings;
use crate::error::CacheError;
use crate::hooks::Hooks;
use crate::keys::{CacheKey, DeviceClass, Scheme, VariantKey};

const METRIC_BYPASS_TOTAL: &str = "razzo_cache_bypass_total";

/// Attributes of one inbound request, supplied by the host pipeline.
#[derive(Debug, Clone)]
pub struct RequestAttributes {
    pub path: String,
    pub query: String,
    pub cookie_names: Vec<String>,
    pub user_agent: String,
    pub scheme: Scheme,
    pub device: DeviceClass,
    pub locale: Option<String>,
}

impl RequestAttributes {
    /// A plain anonymous GET: no cookies, desktop, http. The usual starting
    /// point for builders and tests.
    pub fn get(path: &str) -> Self {
        Self {
            path: path.to_string(),
            query: String::new(),
            cookie_names: Vec::new(),
            user_agent: String::new(),
            scheme: Scheme::Http,
            device: DeviceClass::Desktop,
            locale: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>) -> Self {
        self.cookie_names.push(name.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_device(mut self, device: DeviceClass) -> Self {
        self.device = device;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

/// Why a request was declared uncacheable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    ExcludedPath,
    RejectedCookie,
    RejectedUserAgent,
    SslDisabled,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExcludedPath => "excluded_path",
            Self::RejectedCookie => "rejected_cookie",
            Self::RejectedUserAgent => "rejected_user_agent",
            Self::SslDisabled => "ssl_disabled",
        }
    }
}

/// Outcome of rule evaluation. Always definite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Bypass(BypassReason),
    Cacheable(VariantKey),
}

/// Compiled reject lists plus the query-string whitelist.
///
/// Read-only during evaluation; configuration changes rebuild the whole set.
#[derive(Default)]
pub struct RuleSet {
    reject_uri: Vec<Regex>,
    reject_cookies: Vec<Regex>,
    reject_ua: Vec<Regex>,
    reject_assets: Vec<Regex>,
    query_whitelist: HashSet<String>,
}

impl RuleSet {
    /// Compile the configured patterns. Invalid patterns are dropped with a
    /// warning and never abort compilation.
    pub fn compile(rules: &RulesSettings, cdn_reject_files: &[String]) -> Self {
        Self {
            reject_uri: compile_patterns("path", &rules.reject_uri),
            reject_cookies: compile_patterns("cookie", &rules.reject_cookies),
            reject_ua: compile_patterns("user-agent", &rules.reject_ua),
            reject_assets: compile_patterns("cdn-file", cdn_reject_files),
            query_whitelist: rules.cache_query_strings.iter().cloned().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

fn compile_patterns(category: &'static str, raw: &[String]) -> Vec<Regex> {
    raw.iter()
        .filter(|pattern| !pattern.trim().is_empty())
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(compiled) => Some(compiled),
            Err(err) => {
                let err = CacheError::config_invalid(category, pattern.clone(), err.to_string());
                warn!(error = %err, "dropping invalid rule pattern");
                None
            }
        })
        .collect()
}

/// Evaluates requests against an immutable rule set and feature toggles.
pub struct RuleEngine {
    rules: RuleSet,
    cache_mobile: bool,
    cache_ssl: bool,
    hooks: Arc<Hooks>,
}

impl RuleEngine {
    pub fn new(rules: RuleSet, cache_mobile: bool, cache_ssl: bool, hooks: Arc<Hooks>) -> Self {
        Self {
            rules,
            cache_mobile,
            cache_ssl,
            hooks,
        }
    }

    /// Decide cacheability. First match wins, in a fixed order: excluded
    /// path, rejected cookie, rejected user agent, SSL without SSL caching,
    /// otherwise cacheable with a derived variant.
    pub fn decide(&self, request: &RequestAttributes) -> Decision {
        if let Some(decision) = self.hooks.forced_decision(request) {
            debug!(path = %request.path, "decision forced by hook");
            return decision;
        }

        if self.rules.reject_uri.iter().any(|re| re.is_match(&request.path)) {
            return self.bypass(request, BypassReason::ExcludedPath);
        }

        if request.cookie_names.iter().any(|name| {
            self.rules.reject_cookies.iter().any(|re| re.is_match(name))
        }) {
            return self.bypass(request, BypassReason::RejectedCookie);
        }

        if self
            .rules
            .reject_ua
            .iter()
            .any(|re| re.is_match(&request.user_agent))
        {
            return self.bypass(request, BypassReason::RejectedUserAgent);
        }

        if request.scheme.is_ssl() && !self.cache_ssl {
            return self.bypass(request, BypassReason::SslDisabled);
        }

        Decision::Cacheable(self.variant_for(request))
    }

    /// Decision plus key construction in one step; `None` means bypass.
    ///
    /// Only whitelisted query parameters participate in the key — everything
    /// else is stripped so tracking parameters cannot explode the key space.
    pub fn cache_key(&self, request: &RequestAttributes) -> Option<CacheKey> {
        match self.decide(request) {
            Decision::Bypass(_) => None,
            Decision::Cacheable(variant) => {
                let whitelisted = self.whitelisted_query(&request.query);
                let key = CacheKey::new(&request.path, &whitelisted, variant);
                Some(self.hooks.shape_key(key))
            }
        }
    }

    /// Whether an asset URL is excluded from CDN rewriting.
    pub fn should_reject_asset(&self, asset_url: &str) -> bool {
        self.rules
            .reject_assets
            .iter()
            .any(|re| re.is_match(asset_url))
    }

    fn bypass(&self, request: &RequestAttributes, reason: BypassReason) -> Decision {
        counter!(METRIC_BYPASS_TOTAL, "reason" => reason.as_str()).increment(1);
        debug!(path = %request.path, reason = reason.as_str(), "request bypasses cache");
        Decision::Bypass(reason)
    }

    fn variant_for(&self, request: &RequestAttributes) -> VariantKey {
        let device = if self.cache_mobile && request.device == DeviceClass::Mobile {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        };
        let mut variant = VariantKey::new(device, request.scheme);
        if let Some(locale) = &request.locale {
            variant = variant.with_locale(locale.clone());
        }
        variant
    }

    fn whitelisted_query(&self, query: &str) -> Vec<(String, String)> {
        if self.rules.query_whitelist.is_empty() {
            return Vec::new();
        }
        url::form_urlencoded::parse(query.as_bytes())
            .filter(|(name, _)| self.rules.query_whitelist.contains(name.as_ref()))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect()
    }
}
