#![forbid(unsafe_code)]

//! Metadata lookups through the fetch tool, with a TTL cache in front.
//!
//! Lookups run `yt-dlp --dump-single-json` under a wall-clock timeout and the
//! bounded [`RetryPolicy`]. Results are cached per media reference; expired
//! entries are evicted when they are read.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{FetchError, Result},
    matcher::{OutputMatcher, YtDlpMatcher},
    media::MediaRef,
    retry::RetryPolicy,
    runner::{self, CommandSpec, OutputStream, ProcessEvent},
};

/// Upper bound on cached entries; expired ones are purged first when full.
const MAX_CACHE_ENTRIES: usize = 1024;

/// What `/get-info` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// Subset of the `--dump-single-json` payload. Everything is optional since
/// older entries may lack fields.
#[derive(Debug, Deserialize)]
struct DumpedInfo {
    title: Option<String>,
    fulltitle: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<DumpedThumbnail>,
}

#[derive(Debug, Deserialize)]
struct DumpedThumbnail {
    url: Option<String>,
}

impl DumpedInfo {
    fn into_media_info(self, media_ref: &MediaRef) -> MediaInfo {
        let title = self
            .title
            .or(self.fulltitle)
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| media_ref.to_string());
        let thumbnail = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().rev().find_map(|thumb| thumb.url));
        MediaInfo {
            title,
            duration: self
                .duration
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(|secs| secs.round() as u64),
            thumbnail,
        }
    }
}

pub fn parse_info(raw: &str, media_ref: &MediaRef) -> Result<MediaInfo> {
    let dumped: DumpedInfo = serde_json::from_str(raw.trim())
        .map_err(|err| FetchError::ProcessFailure(format!("invalid metadata JSON: {err}")))?;
    Ok(dumped.into_media_info(media_ref))
}

struct CacheEntry {
    info: MediaInfo,
    stored_at: Instant,
}

/// Per-reference cache with a fixed time to live.
pub struct MetadataCache {
    ttl: Duration,
    entries: RwLock<HashMap<MediaRef, CacheEntry>>,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, media_ref: &MediaRef) -> Option<MediaInfo> {
        {
            let entries = self.entries.read();
            match entries.get(media_ref) {
                None => return None,
                Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                    return Some(entry.info.clone());
                }
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write();
        // Re-check under the write lock; a fresh put may have raced us.
        if let Some(entry) = entries.get(media_ref)
            && entry.stored_at.elapsed() >= self.ttl
        {
            entries.remove(media_ref);
            debug!(%media_ref, "metadata cache entry expired");
            return None;
        }
        entries.get(media_ref).map(|entry| entry.info.clone())
    }

    pub fn put(&self, media_ref: MediaRef, info: MediaInfo) {
        let mut entries = self.entries.write();
        if entries.len() >= MAX_CACHE_ENTRIES && !entries.contains_key(&media_ref) {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
            if entries.len() >= MAX_CACHE_ENTRIES
                && let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.stored_at)
                    .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            media_ref,
            CacheEntry {
                info,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub ytdlp_bin: PathBuf,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub cache_ttl: Duration,
}

#[derive(Clone)]
pub struct MetadataResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    settings: ResolverSettings,
    cache: MetadataCache,
    matcher: YtDlpMatcher,
}

impl MetadataResolver {
    pub fn new(settings: ResolverSettings) -> Self {
        let cache = MetadataCache::new(settings.cache_ttl);
        Self {
            inner: Arc::new(ResolverInner {
                settings,
                cache,
                matcher: YtDlpMatcher,
            }),
        }
    }

    pub fn cached(&self, media_ref: &MediaRef) -> Option<MediaInfo> {
        self.inner.cache.get(media_ref)
    }

    /// Cached info, or a fresh lookup that is cached on success.
    pub async fn resolve(&self, media_ref: &MediaRef) -> Result<MediaInfo> {
        if let Some(info) = self.cached(media_ref) {
            debug!(%media_ref, "metadata cache hit");
            return Ok(info);
        }
        let label = format!("metadata {media_ref}");
        let info = self
            .inner
            .settings
            .retry
            .run(&label, |_| self.fetch_once(media_ref))
            .await?;
        info!(%media_ref, title = %info.title, "metadata resolved");
        self.inner.cache.put(media_ref.clone(), info.clone());
        Ok(info)
    }

    async fn fetch_once(&self, media_ref: &MediaRef) -> Result<MediaInfo> {
        let settings = &self.inner.settings;
        let spec = CommandSpec {
            program: settings.ytdlp_bin.clone(),
            args: vec![
                "--dump-single-json".into(),
                "--skip-download".into(),
                "--no-warnings".into(),
                "--no-progress".into(),
                "--no-playlist".into(),
                media_ref.watch_url(),
            ],
            timeout: settings.timeout,
            label: format!("metadata {media_ref}"),
        };
        let mut handle = runner::spawn(spec)?;
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(event) = handle.next_event().await {
            match event {
                ProcessEvent::Output {
                    stream: OutputStream::Stdout,
                    chunk,
                } => stdout.push_str(&chunk),
                ProcessEvent::Output {
                    stream: OutputStream::Stderr,
                    chunk,
                } => stderr.push_str(&chunk),
                ProcessEvent::Exited(exit) if exit.timed_out => {
                    return Err(FetchError::Timeout(settings.timeout.as_secs()));
                }
                ProcessEvent::Exited(exit) if exit.success() => {
                    return parse_info(&stdout, media_ref);
                }
                ProcessEvent::Exited(exit) => {
                    return Err(self.inner.matcher.classify_exit(&stderr, exit.code));
                }
            }
        }
        Err(FetchError::ProcessFailure(
            "metadata process ended without exit status".into(),
        ))
    }
}
