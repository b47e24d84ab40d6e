//! razzo — file-system-backed HTTP page cache engine.
//!
//! Caches rendered page output on disk and keeps it fresh through
//! purge-driven invalidation:
//!
//! - **Rule engine**: decides per request whether output is cacheable and
//!   under which variant (device class, scheme, locale).
//! - **Page store**: one atomic file pair per cache key, laid out so
//!   prefix purges are directory operations.
//! - **Invalidation**: purge by URL, content unit, locale, or wholesale,
//!   triggered by operators or host change events.
//! - **Preload**: warms the store from a sitemap through the normal
//!   admission path.
//! - **CDN rewriting**: maps asset URLs onto zone CNAMEs.
//!
//! ## Configuration
//!
//! Behavior is controlled via `razzo.toml`:
//!
//! ```toml
//! [cache]
//! root_dir = "cache"
//! domain = "example.com"
//! cache_mobile = true
//! # ... see config for all options
//! ```

pub mod cdn;
pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod keys;
mod lock;
pub mod preload;
pub mod purge;
pub mod rules;
pub mod store;
pub mod telemetry;

pub use cdn::CdnRewriter;
pub use error::CacheError;
pub use events::{ChangeEvent, ChangeKind, Epoch, EventQueue};
pub use hooks::Hooks;
pub use keys::{CacheKey, DeviceClass, Scheme, VariantKey};
pub use preload::{
    FetchedPage, HttpFetcher, JobState, JobStatus, PageFetcher, PreloadScheduler, SitemapSource,
    UrlSource,
};
pub use purge::{
    ContentUnitResolver, Invalidator, PurgeOutcome, PurgeRequest, PurgeScope, PurgeState,
    TemplateResolver,
};
pub use rules::{BypassReason, Decision, RequestAttributes, RuleEngine, RuleSet};
pub use store::{CacheEntry, EntryMeta, PageStore};
