//! Cache key construction and the key → file-system mapping.
//!
//! A `CacheKey` is the deterministic identity of one cacheable response
//! variant: normalized URL path, a digest over the whitelisted query
//! parameters, and a variant discriminator (device class, scheme, locale).
//! Equality defines cache identity.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Request scheme participating in the cache variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn is_ssl(&self) -> bool {
        matches!(self, Self::Https)
    }
}

/// Device class participating in the cache variant when mobile caching is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
        }
    }
}

/// A distinct cacheable rendering of the same logical URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantKey {
    pub device: DeviceClass,
    pub scheme: Scheme,
    pub locale: Option<String>,
}

impl VariantKey {
    pub fn new(device: DeviceClass, scheme: Scheme) -> Self {
        Self {
            device,
            scheme,
            locale: None,
        }
    }

    /// Attach a locale code; codes are lowercased so `FR` and `fr` collapse
    /// into one variant.
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into().to_ascii_lowercase());
        self
    }

    /// Stable tag embedded in stored file names, e.g. `https-mobile-fr`.
    pub(crate) fn tag(&self) -> String {
        match &self.locale {
            Some(locale) => format!(
                "{}-{}-{}",
                self.scheme.as_str(),
                self.device.as_str(),
                locale
            ),
            None => format!("{}-{}", self.scheme.as_str(), self.device.as_str()),
        }
    }
}

impl Default for VariantKey {
    fn default() -> Self {
        Self::new(DeviceClass::Desktop, Scheme::Http)
    }
}

/// Deterministic identifier for one cacheable response variant.
///
/// Immutable once constructed: the path is normalized and the query digest
/// is computed in `new`, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    path: String,
    query_digest: Option<String>,
    variant: VariantKey,
}

impl CacheKey {
    /// Build a key from a raw path, the query parameters that survived the
    /// whitelist filter, and a variant discriminator.
    ///
    /// Parameters are sorted before digesting, so parameter order on the
    /// wire never affects identity.
    pub fn new(path: &str, whitelisted_query: &[(String, String)], variant: VariantKey) -> Self {
        Self {
            path: normalize_path(path),
            query_digest: query_digest(whitelisted_query),
            variant,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_digest(&self) -> Option<&str> {
        self.query_digest.as_deref()
    }

    pub fn variant(&self) -> &VariantKey {
        &self.variant
    }

    /// Replace the variant, producing a new key. This is the seam used by
    /// key hooks; existing keys are never mutated in place.
    pub fn with_variant(self, variant: VariantKey) -> Self {
        Self { variant, ..self }
    }

    /// Directory (relative to the pages root) that holds every variant of
    /// this path. Sub-paths nest beneath it, which is what makes
    /// directory-based prefix deletes possible.
    pub(crate) fn relative_dir(&self) -> PathBuf {
        let mut dir = PathBuf::new();
        for segment in self.path.split('/').filter(|s| !s.is_empty()) {
            dir.push(escape_segment(segment));
        }
        dir
    }

    /// File stem unique per (variant, query digest) within `relative_dir`.
    pub(crate) fn file_stem(&self) -> String {
        match &self.query_digest {
            Some(digest) => format!("page-{}-q{digest}", self.variant.tag()),
            None => format!("page-{}", self.variant.tag()),
        }
    }
}

/// Normalize a raw path: one leading slash, collapsed separators, no
/// trailing slash (except for the root itself), query/fragment stripped.
pub(crate) fn normalize_path(raw: &str) -> String {
    let raw = raw.split(['?', '#']).next().unwrap_or("");
    let mut out = String::with_capacity(raw.len() + 1);
    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn query_digest(pairs: &[(String, String)]) -> Option<String> {
    if pairs.is_empty() {
        return None;
    }
    let mut sorted: Vec<_> = pairs.to_vec();
    sorted.sort();
    let mut canonical = String::new();
    for (name, value) in &sorted {
        if !canonical.is_empty() {
            canonical.push('&');
        }
        canonical.push_str(name);
        canonical.push('=');
        canonical.push_str(value);
    }
    let digest = Sha256::digest(canonical.as_bytes());
    Some(hex::encode(&digest[..8]))
}

/// Escape one path segment into a file-system-safe, invertible form.
///
/// Everything outside `[A-Za-z0-9_-]` is percent-encoded, so `.` and `..`
/// segments can never traverse out of the cache root.
pub(crate) fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Components of a preload/purge URL that matter to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UrlParts {
    pub path: String,
    pub scheme: Scheme,
    pub query: String,
}

/// Split an absolute URL (or a bare path) into normalized parts.
pub(crate) fn split_url(url: &str) -> UrlParts {
    match Url::parse(url) {
        Ok(parsed) if parsed.has_host() => UrlParts {
            path: normalize_path(parsed.path()),
            scheme: if parsed.scheme() == "https" {
                Scheme::Https
            } else {
                Scheme::Http
            },
            query: parsed.query().unwrap_or("").to_string(),
        },
        _ => {
            let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
            UrlParts {
                path: normalize_path(url),
                scheme: Scheme::Http,
                query: query.split('#').next().unwrap_or("").to_string(),
            }
        }
    }
}

/// Deterministic 64-bit hash used where stability across processes matters
/// (CDN host selection). `DefaultHasher` is only stable within one process,
/// so this goes through sha-256 instead.
pub(crate) fn stable_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}
