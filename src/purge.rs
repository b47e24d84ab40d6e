//! Cache invalidation.
//!
//! Translates purge requests (operator-issued or event-driven) into store
//! deletions. Purging is the only way entries leave the cache; there is no
//! time-based expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::events::{ChangeKind, EventQueue};
use crate::hooks::Hooks;
use crate::keys::split_url;
use crate::store::PageStore;

const METRIC_REMOVED_TOTAL: &str = "razzo_purge_removed_total";
const METRIC_FAILED_TOTAL: &str = "razzo_purge_failed_total";

/// What a purge request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeScope {
    /// Everything under the domain.
    All,
    /// One URL and its sub-paths (pagination, feed).
    Url(String),
    /// A host content unit; its URLs come from the resolver.
    ContentUnit(u64),
    /// Every entry whose variant carries this locale.
    Locale(String),
}

impl PurgeScope {
    fn as_str(&self) -> &'static str {
        match self {
            PurgeScope::All => "all",
            PurgeScope::Url(_) => "url",
            PurgeScope::ContentUnit(_) => "content_unit",
            PurgeScope::Locale(_) => "locale",
        }
    }
}

/// One invalidation request. Transient; audit trail is the tracing log.
#[derive(Debug, Clone)]
pub struct PurgeRequest {
    pub scope: PurgeScope,
    pub issued_by: String,
    pub timestamp: OffsetDateTime,
}

impl PurgeRequest {
    pub fn new(scope: PurgeScope, issued_by: impl Into<String>) -> Self {
        Self {
            scope,
            issued_by: issued_by.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Lifecycle of a purge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PurgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurgeState::Pending => "pending",
            PurgeState::Running => "running",
            PurgeState::Completed => "completed",
            PurgeState::Failed => "failed",
        }
    }
}

/// Result of a purge, machine-checkable.
#[derive(Debug, Clone)]
pub struct PurgeOutcome {
    pub state: PurgeState,
    pub entries_removed: u64,
    pub duration: Duration,
    /// Per-target failures. Non-empty with `Completed` means partial
    /// success (some units resolved, others did not).
    pub errors: Vec<String>,
}

/// Host-side lookup from content unit to the URLs it renders.
///
/// Implementations return the canonical URL plus its paginated and feed
/// variants. Each returned URL is treated as a purge prefix.
#[async_trait]
pub trait ContentUnitResolver: Send + Sync {
    async fn resolve_urls(&self, unit_id: u64) -> Result<Vec<String>, CacheError>;
}

/// Resolver that expands a configured path template.
///
/// Stands in for a host CMS lookup: `{id}` in the template becomes the
/// unit id, and the feed variant is derived by appending `feed/`.
pub struct TemplateResolver {
    template: String,
}

impl TemplateResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl ContentUnitResolver for TemplateResolver {
    async fn resolve_urls(&self, unit_id: u64) -> Result<Vec<String>, CacheError> {
        let path = self.template.replace("{id}", &unit_id.to_string());
        let base = if path.ends_with('/') {
            path.clone()
        } else {
            format!("{path}/")
        };
        Ok(vec![path, format!("{base}feed/")])
    }
}

/// Executes purge requests against the store.
pub struct Invalidator {
    store: Arc<PageStore>,
    resolver: Arc<dyn ContentUnitResolver>,
    hooks: Arc<Hooks>,
}

impl Invalidator {
    pub fn new(
        store: Arc<PageStore>,
        resolver: Arc<dyn ContentUnitResolver>,
        hooks: Arc<Hooks>,
    ) -> Self {
        Self {
            store,
            resolver,
            hooks,
        }
    }

    /// Execute one purge request. Never returns `Err`: failures are carried
    /// in the outcome so callers always get a removal count and a state.
    /// Idempotent - purging an already-purged scope removes zero entries
    /// and completes.
    pub async fn purge(&self, request: PurgeRequest) -> PurgeOutcome {
        let started = Instant::now();
        debug!(scope = request.scope.as_str(), "purge pending");

        let mut errors = Vec::new();
        let mut removed = 0u64;
        debug!(scope = request.scope.as_str(), "purge running");

        let result = match &request.scope {
            PurgeScope::All => self.store.delete_all().await,
            PurgeScope::Url(url) => {
                let parts = split_url(url);
                self.store.delete_by_prefix(&parts.path).await
            }
            PurgeScope::ContentUnit(unit_id) => {
                self.purge_content_unit(*unit_id, &mut errors).await
            }
            PurgeScope::Locale(code) => self.store.delete_by_locale(code).await,
        };

        let state = match result {
            Ok(count) => {
                removed = count;
                PurgeState::Completed
            }
            Err(err) => {
                errors.push(err.to_string());
                PurgeState::Failed
            }
        };

        let duration = started.elapsed();
        counter!(METRIC_REMOVED_TOTAL, "scope" => request.scope.as_str()).increment(removed);
        if state == PurgeState::Failed {
            counter!(METRIC_FAILED_TOTAL, "scope" => request.scope.as_str()).increment(1);
        }
        info!(
            scope = request.scope.as_str(),
            issued_by = %request.issued_by,
            state = state.as_str(),
            entries_removed = removed,
            duration_ms = duration.as_millis() as u64,
            "Purge finished"
        );

        PurgeOutcome {
            state,
            entries_removed: removed,
            duration,
            errors,
        }
    }

    /// Purge everything on a fixed schedule, mirroring hosts that want a
    /// periodic clean slate on top of event-driven invalidation. The first
    /// purge fires one full period after the call; abort the returned
    /// handle to stop the schedule.
    pub fn spawn_periodic_purge(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        info!(period_secs = period.as_secs(), "Scheduled purge enabled");
        tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick of a fresh interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.purge(PurgeRequest::new(PurgeScope::All, "schedule")).await;
            }
        })
    }

    /// Purge several requests in order. A failing request records its
    /// outcome and does not stop the rest.
    pub async fn purge_batch(&self, requests: Vec<PurgeRequest>) -> Vec<PurgeOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.purge(request).await);
        }
        outcomes
    }

    /// Drain pending change events and purge accordingly.
    pub async fn drain_events(&self, queue: &EventQueue, limit: usize) -> Vec<PurgeOutcome> {
        let events = queue.drain(limit);
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let scope = match event.kind {
                ChangeKind::ContentUnitChanged { unit_id } => PurgeScope::ContentUnit(unit_id),
                ChangeKind::UrlChanged { url } => PurgeScope::Url(url),
                ChangeKind::SiteSettingsChanged => PurgeScope::All,
            };
            let request = PurgeRequest::new(scope, format!("event:{}", event.id));
            outcomes.push(self.purge(request).await);
        }
        outcomes
    }

    /// Resolve a unit to its URL prefixes and delete each. Resolution
    /// failure is a no-op for that unit, recorded as an error.
    async fn purge_content_unit(
        &self,
        unit_id: u64,
        errors: &mut Vec<String>,
    ) -> Result<u64, CacheError> {
        let mut urls = match self.resolver.resolve_urls(unit_id).await {
            Ok(urls) => urls,
            Err(err) => {
                let err = CacheError::resolution_failed(unit_id, err.to_string());
                warn!(unit_id, error = %err, "content unit resolution failed");
                errors.push(err.to_string());
                return Ok(0);
            }
        };
        self.hooks.extend_resolution(unit_id, &mut urls);

        let mut removed = 0;
        for url in &urls {
            let parts = split_url(url);
            removed += self.store.delete_by_prefix(&parts.path).await?;
        }
        debug!(unit_id, urls = urls.len(), removed, "content unit purged");
        Ok(removed)
    }
}
