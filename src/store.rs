//! On-disk page store.
//!
//! Entries live under `{root}/{domain}/pages`, one directory per normalized
//! path (sub-paths nest, which is what makes prefix purges a directory
//! operation), one file pair per variant. The JSON meta sidecar is the
//! commit record: `put` renames the body into place first and the meta
//! last, so a reader that finds a meta always finds a complete body.
//! Reads verify the body against the meta's etag, so a read that overlaps
//! a replacement degrades to a miss instead of serving a mismatched pair.
//!
//! A separate `{root}/{domain}/min` subtree holds minified assets and is
//! purgeable independently of the page cache.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CacheError;
use crate::keys::{CacheKey, escape_segment, normalize_path};

const PAGES_SUBDIR: &str = "pages";
const MIN_SUBDIR: &str = "min";
const BODY_EXT: &str = "body";
const META_EXT: &str = "json";

const METRIC_HIT_TOTAL: &str = "razzo_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "razzo_cache_miss_total";

/// Metadata persisted alongside each cached payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: CacheKey,
    pub content_type: String,
    /// sha-256 of the payload, hex-encoded. Doubles as a strong ETag.
    pub etag: String,
    /// Unix seconds. Kept for diagnostics; expiry is purge-driven only.
    pub created_at: i64,
}

/// A complete cache entry as read back from disk.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub body: Bytes,
}

/// File-system-backed store for rendered page output.
///
/// Safe for concurrent readers and writers: writes go to a temp file in the
/// target directory and are renamed into place, same-key races resolve
/// last-write-wins, and bulk deletes operate on a snapshot collected at
/// invocation so concurrent `put`s are never half-deleted.
pub struct PageStore {
    pages_dir: PathBuf,
    min_dir: PathBuf,
}

impl PageStore {
    /// Open (creating if needed) the per-domain cache tree and probe that it
    /// is writable. An unwritable root disables caching for the domain, so
    /// this is the one place that fails loudly.
    pub async fn open(root: &Path, domain: &str) -> Result<Self, CacheError> {
        let domain_dir = root.join(escape_segment(domain));
        let pages_dir = domain_dir.join(PAGES_SUBDIR);
        let min_dir = domain_dir.join(MIN_SUBDIR);

        for dir in [&pages_dir, &min_dir] {
            fs::create_dir_all(dir).await.map_err(|err| {
                CacheError::storage_unwritable(dir.display().to_string(), err.to_string())
            })?;
        }

        let probe = pages_dir.join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"").await.map_err(|err| {
            CacheError::storage_unwritable(pages_dir.display().to_string(), err.to_string())
        })?;
        let _ = fs::remove_file(&probe).await;

        Ok(Self {
            pages_dir,
            min_dir,
        })
    }

    fn entry_paths(&self, key: &CacheKey) -> (PathBuf, PathBuf) {
        let dir = self.pages_dir.join(key.relative_dir());
        let stem = key.file_stem();
        (
            dir.join(format!("{stem}.{BODY_EXT}")),
            dir.join(format!("{stem}.{META_EXT}")),
        )
    }

    /// Look up an entry. Read failures degrade to a miss — the evaluation
    /// path never surfaces storage errors to the requester.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let (body_path, meta_path) = self.entry_paths(key);

        let meta_bytes = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %meta_path.display(), error = %err, "cache meta unreadable");
                }
                counter!(METRIC_MISS_TOTAL).increment(1);
                return None;
            }
        };

        let meta: EntryMeta = match serde_json::from_slice(&meta_bytes) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %meta_path.display(), error = %err, "cache meta malformed");
                counter!(METRIC_MISS_TOTAL).increment(1);
                return None;
            }
        };

        let body = match fs::read(&body_path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                // Meta without body means the entry is mid-deletion.
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %body_path.display(), error = %err, "cache body unreadable");
                }
                counter!(METRIC_MISS_TOTAL).increment(1);
                return None;
            }
        };

        // Each file is replaced atomically but the pair is not: a read that
        // straddles a concurrent `put` can pair the old meta with the new
        // body. The etag catches that; a retry sees the committed pair.
        if hex::encode(Sha256::digest(&body)) != meta.etag {
            debug!(path = %meta_path.display(), "cache entry mid-replace, treated as miss");
            counter!(METRIC_MISS_TOTAL).increment(1);
            return None;
        }

        counter!(METRIC_HIT_TOTAL).increment(1);
        Some(CacheEntry { meta, body })
    }

    /// Store a payload, replacing any prior entry for the key atomically.
    pub async fn put(
        &self,
        key: &CacheKey,
        body: Bytes,
        content_type: &str,
    ) -> Result<EntryMeta, CacheError> {
        let (body_path, meta_path) = self.entry_paths(key);
        if let Some(parent) = body_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let meta = EntryMeta {
            key: key.clone(),
            content_type: content_type.to_string(),
            etag: hex::encode(Sha256::digest(&body)),
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        };

        write_atomic(&body_path, &body).await?;
        let meta_json = serde_json::to_vec(&meta).map_err(|err| {
            CacheError::Io(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
        })?;
        write_atomic(&meta_path, &meta_json).await?;

        debug!(path = key.path(), stem = %key.file_stem(), bytes = body.len(), "cache entry stored");
        Ok(meta)
    }

    /// Remove a single entry. Returns whether it existed.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let (body_path, meta_path) = self.entry_paths(key);
        let existed = remove_entry_files(&meta_path, &body_path).await?;
        Ok(existed)
    }

    /// Remove every entry present when the call began. Entries written after
    /// the snapshot was taken survive.
    pub async fn delete_all(&self) -> Result<u64, CacheError> {
        let snapshot = collect_snapshot(&self.pages_dir).await?;
        let mut removed = 0;
        for entry in &snapshot.entries {
            if remove_entry_files(&entry.meta, &entry.body).await? {
                removed += 1;
            }
        }
        prune_dirs(&snapshot.dirs).await;
        Ok(removed)
    }

    /// Remove all entries whose path starts with `prefix` (the prefix's own
    /// variants included). The key→directory mapping makes this one subtree.
    pub async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let normalized = normalize_path(prefix);
        let mut dir = self.pages_dir.clone();
        for segment in normalized.split('/').filter(|s| !s.is_empty()) {
            dir.push(escape_segment(segment));
        }

        let snapshot = collect_snapshot(&dir).await?;
        let mut removed = 0;
        for entry in &snapshot.entries {
            if remove_entry_files(&entry.meta, &entry.body).await? {
                removed += 1;
            }
        }
        prune_dirs(&snapshot.dirs).await;
        if dir != self.pages_dir {
            let _ = fs::remove_dir(&dir).await;
        }
        Ok(removed)
    }

    /// Remove every entry whose variant carries the given locale.
    pub async fn delete_by_locale(&self, locale: &str) -> Result<u64, CacheError> {
        let wanted = locale.to_ascii_lowercase();
        let snapshot = collect_snapshot(&self.pages_dir).await?;
        let mut removed = 0;
        for entry in &snapshot.entries {
            let Ok(bytes) = fs::read(&entry.meta).await else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<EntryMeta>(&bytes) else {
                continue;
            };
            if meta.key.variant().locale.as_deref() == Some(wanted.as_str())
                && remove_entry_files(&entry.meta, &entry.body).await?
            {
                removed += 1;
            }
        }
        prune_dirs(&snapshot.dirs).await;
        Ok(removed)
    }

    /// Number of live entries. Walks the tree; intended for status reporting
    /// and tests, not hot paths.
    pub async fn entry_count(&self) -> Result<u64, CacheError> {
        let snapshot = collect_snapshot(&self.pages_dir).await?;
        Ok(snapshot.entries.len() as u64)
    }

    /// Store a minified asset under the independently purgeable subtree.
    pub async fn put_minified(&self, name: &str, body: Bytes) -> Result<(), CacheError> {
        let path = self.min_dir.join(escape_segment(name));
        write_atomic(&path, &body).await?;
        Ok(())
    }

    pub async fn get_minified(&self, name: &str) -> Option<Bytes> {
        let path = self.min_dir.join(escape_segment(name));
        match fs::read(&path).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(_) => None,
        }
    }

    /// Drop the whole minified-asset subtree, leaving page entries intact.
    pub async fn purge_minified(&self) -> Result<u64, CacheError> {
        let mut removed = 0;
        let mut reader = match fs::read_dir(&self.min_dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.min_dir).await?;
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            files.push(entry.path());
        }
        for file in files {
            if fs::remove_file(&file).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

struct EntryFiles {
    meta: PathBuf,
    body: PathBuf,
}

struct Snapshot {
    entries: Vec<EntryFiles>,
    /// Directories seen during the walk, deepest first, for pruning.
    dirs: Vec<PathBuf>,
}

/// Walk a subtree collecting every committed entry (meta file) plus the
/// directories visited. A missing root yields an empty snapshot.
async fn collect_snapshot(root: &Path) -> Result<Snapshot, CacheError> {
    let mut entries = Vec::new();
    let mut dirs = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        if dir != root {
            dirs.push(dir.clone());
        }
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|ext| ext.to_str()) == Some(META_EXT) {
                entries.push(EntryFiles {
                    body: path.with_extension(BODY_EXT),
                    meta: path,
                });
            }
        }
    }

    // Deepest directories first so empty parents can be pruned after.
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    Ok(Snapshot { entries, dirs })
}

/// Remove one entry, meta first so readers stop committing to the body.
/// Returns whether the meta existed.
async fn remove_entry_files(meta: &Path, body: &Path) -> Result<bool, CacheError> {
    let existed = match fs::remove_file(meta).await {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => return Err(err.into()),
    };
    match fs::remove_file(body).await {
        Ok(()) | Err(_) => {}
    }
    Ok(existed)
}

/// Best-effort removal of now-empty directories; non-empty ones stay,
/// which is exactly what a concurrent writer needs.
async fn prune_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        let _ = fs::remove_dir(dir).await;
    }
}

/// Write to a sibling temp file, then rename into place. Readers never see
/// a torn file; same-key races resolve last-write-wins.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("entry");
    let tmp = path.with_file_name(format!("{file_name}.tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, bytes).await?;
    match fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp).await;
            Err(err.into())
        }
    }
}
