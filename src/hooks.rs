//! Typed extension points.
//!
//! Hooks are registered once at startup and then frozen behind an `Arc`;
//! each decision point has a fixed signature instead of string-keyed
//! callbacks, so a misbehaving extension is caught at compile time.

use crate::keys::CacheKey;
use crate::rules::{Decision, RequestAttributes};

/// Runs before rule evaluation; returning `Some` forces the decision and
/// skips both the remaining hooks and the rule set.
pub type DecisionHook = Box<dyn Fn(&RequestAttributes) -> Option<Decision> + Send + Sync>;

/// Runs after key construction; may reshape the key (e.g. add a variant
/// dimension). Keys are rebuilt, never mutated in place.
pub type KeyHook = Box<dyn Fn(CacheKey) -> CacheKey + Send + Sync>;

/// Runs after content-unit resolution; may append URLs that the host's
/// canonical lookup does not know about.
pub type ResolveHook = Box<dyn Fn(u64, &mut Vec<String>) + Send + Sync>;

#[derive(Default)]
pub struct Hooks {
    decision: Vec<DecisionHook>,
    key: Vec<KeyHook>,
    resolve: Vec<ResolveHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_decision<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestAttributes) -> Option<Decision> + Send + Sync + 'static,
    {
        self.decision.push(Box::new(hook));
        self
    }

    pub fn on_key<F>(mut self, hook: F) -> Self
    where
        F: Fn(CacheKey) -> CacheKey + Send + Sync + 'static,
    {
        self.key.push(Box::new(hook));
        self
    }

    pub fn on_resolve<F>(mut self, hook: F) -> Self
    where
        F: Fn(u64, &mut Vec<String>) + Send + Sync + 'static,
    {
        self.resolve.push(Box::new(hook));
        self
    }

    /// First hook that returns a decision wins.
    pub(crate) fn forced_decision(&self, request: &RequestAttributes) -> Option<Decision> {
        self.decision.iter().find_map(|hook| hook(request))
    }

    pub(crate) fn shape_key(&self, key: CacheKey) -> CacheKey {
        self.key.iter().fold(key, |key, hook| hook(key))
    }

    pub(crate) fn extend_resolution(&self, unit_id: u64, urls: &mut Vec<String>) {
        for hook in &self.resolve {
            hook(unit_id, urls);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{DeviceClass, Scheme, VariantKey};
    use crate::rules::BypassReason;

    #[test]
    fn first_decision_hook_wins() {
        let hooks = Hooks::new()
            .on_decision(|request| {
                request
                    .path
                    .starts_with("/private")
                    .then_some(Decision::Bypass(BypassReason::ExcludedPath))
            })
            .on_decision(|_| Some(Decision::Cacheable(VariantKey::default())));

        let private = RequestAttributes::get("/private/dashboard");
        assert!(matches!(
            hooks.forced_decision(&private),
            Some(Decision::Bypass(BypassReason::ExcludedPath))
        ));

        let public = RequestAttributes::get("/blog");
        assert!(matches!(
            hooks.forced_decision(&public),
            Some(Decision::Cacheable(_))
        ));
    }

    #[test]
    fn key_hooks_apply_in_registration_order() {
        let hooks = Hooks::new().on_key(|key| {
            let variant = VariantKey::new(DeviceClass::Desktop, Scheme::Https).with_locale("it");
            key.with_variant(variant)
        });

        let key = CacheKey::new("/blog", &[], VariantKey::default());
        let shaped = hooks.shape_key(key);
        assert_eq!(shaped.variant().locale.as_deref(), Some("it"));
    }

    #[test]
    fn resolve_hooks_append_urls() {
        let hooks = Hooks::new().on_resolve(|unit_id, urls| {
            urls.push(format!("/amp/{unit_id}/"));
        });

        let mut urls = vec!["/blog/post-7/".to_string()];
        hooks.extend_resolution(7, &mut urls);
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[1], "/amp/7/");
    }
}
