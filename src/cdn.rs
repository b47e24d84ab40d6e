//! CDN host rewriting for static asset URLs.
//!
//! Hosts are chosen per asset by hashing the asset path modulo the zone's
//! CNAME count, so a given asset always maps to the same edge host no
//! matter which page references it. Rewriting is all-or-nothing per URL:
//! anything that cannot be rewritten safely passes through unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::config::CdnSettings;
use crate::keys::stable_hash;
use crate::rules::RuleEngine;

/// Zone id every other zone falls back to.
const ZONE_ALL: &str = "all";

/// Rewrites asset URLs onto configured CDN hosts.
pub struct CdnRewriter {
    enabled: bool,
    cdn_on_ssl: bool,
    zones: HashMap<String, Vec<String>>,
    rules: Arc<RuleEngine>,
}

impl CdnRewriter {
    pub fn new(settings: &CdnSettings, rules: Arc<RuleEngine>) -> Self {
        Self {
            enabled: settings.enabled,
            cdn_on_ssl: settings.cdn_on_ssl,
            zones: settings.zones.clone(),
            rules,
        }
    }

    /// Map an absolute asset URL onto a CDN host for the given zone.
    ///
    /// Deterministic for a fixed (url, zone, config) triple. Returns the
    /// input unchanged when the rewriter is disabled, the URL is relative
    /// or unparseable, the asset matches a reject pattern, the zone has no
    /// hosts (after falling back to `"all"`), or the URL is https while
    /// CDN-on-SSL is off.
    pub fn rewrite_asset_url(&self, url: &str, zone: &str) -> String {
        if !self.enabled {
            return url.to_string();
        }
        let Ok(mut parsed) = Url::parse(url) else {
            return url.to_string();
        };
        if parsed.scheme() == "https" && !self.cdn_on_ssl {
            return url.to_string();
        }
        if self.rules.should_reject_asset(parsed.path()) {
            debug!(url, "asset matches cdn reject pattern");
            return url.to_string();
        }
        let Some(hosts) = self.zone_hosts(zone) else {
            return url.to_string();
        };

        let index = (stable_hash(parsed.path()) % hosts.len() as u64) as usize;
        if parsed.set_host(Some(&hosts[index])).is_err() {
            return url.to_string();
        }
        parsed.to_string()
    }

    fn zone_hosts(&self, zone: &str) -> Option<&Vec<String>> {
        self.zones
            .get(zone)
            .filter(|hosts| !hosts.is_empty())
            .or_else(|| self.zones.get(ZONE_ALL).filter(|hosts| !hosts.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hooks;
    use crate::rules::RuleSet;

    fn settings(enabled: bool, cdn_on_ssl: bool) -> CdnSettings {
        let mut zones = HashMap::new();
        zones.insert(
            ZONE_ALL.to_string(),
            vec!["cdn-a.example.net".to_string(), "cdn-b.example.net".to_string()],
        );
        zones.insert(
            "images".to_string(),
            vec!["img.example.net".to_string()],
        );
        CdnSettings {
            enabled,
            cdn_on_ssl,
            zones,
            reject_files: vec![r"\.php$".to_string()],
        }
    }

    fn rewriter(enabled: bool, cdn_on_ssl: bool) -> CdnRewriter {
        let cdn = settings(enabled, cdn_on_ssl);
        let rules = RuleSet::compile(&Default::default(), &cdn.reject_files);
        let engine = Arc::new(RuleEngine::new(rules, false, true, Arc::new(Hooks::default())));
        CdnRewriter::new(&cdn, engine)
    }

    #[test]
    fn host_selection_is_stable_across_calls() {
        let cdn = rewriter(true, true);
        let first = cdn.rewrite_asset_url("http://example.com/style.css", ZONE_ALL);
        assert!(
            first.starts_with("http://cdn-a.example.net/")
                || first.starts_with("http://cdn-b.example.net/")
        );
        for _ in 0..100 {
            assert_eq!(
                cdn.rewrite_asset_url("http://example.com/style.css", ZONE_ALL),
                first
            );
        }
    }

    #[test]
    fn named_zone_uses_its_own_hosts() {
        let cdn = rewriter(true, true);
        assert_eq!(
            cdn.rewrite_asset_url("http://example.com/logo.png", "images"),
            "http://img.example.net/logo.png"
        );
    }

    #[test]
    fn unknown_zone_falls_back_to_all() {
        let cdn = rewriter(true, true);
        let rewritten = cdn.rewrite_asset_url("http://example.com/app.js", "videos");
        assert!(rewritten.contains(".example.net/"));
    }

    #[test]
    fn https_passes_through_when_cdn_on_ssl_is_off() {
        let cdn = rewriter(true, false);
        let url = "https://example.com/style.css";
        assert_eq!(cdn.rewrite_asset_url(url, ZONE_ALL), url);
    }

    #[test]
    fn rejected_files_pass_through() {
        let cdn = rewriter(true, true);
        let url = "http://example.com/admin/load.php";
        assert_eq!(cdn.rewrite_asset_url(url, ZONE_ALL), url);
    }

    #[test]
    fn disabled_rewriter_is_identity() {
        let cdn = rewriter(false, true);
        let url = "http://example.com/style.css";
        assert_eq!(cdn.rewrite_asset_url(url, ZONE_ALL), url);
    }

    #[test]
    fn relative_urls_pass_through() {
        let cdn = rewriter(true, true);
        assert_eq!(cdn.rewrite_asset_url("/style.css", ZONE_ALL), "/style.css");
    }
}
