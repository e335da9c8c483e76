#![forbid(unsafe_code)]

//! Scratch storage for produced media files.
//!
//! Every artifact lives directly under the storage root. Files are written
//! once by the fetch tool, streamed to clients, then removed by a delayed
//! cleanup task. Cleanup is best effort: failures are logged and swallowed.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use mime_guess::MimeGuess;
use parking_lot::Mutex;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    task::{AbortHandle, JoinHandle},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::security::resolve_within_root;

/// Suffixes the fetch tool leaves next to an unfinished output file.
const LEFTOVER_SUFFIXES: [&str; 3] = ["part", "ytdl", "temp"];

#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: Arc<PathBuf>,
    max_age: Duration,
    deletions: Arc<Mutex<Deletions>>,
}

/// At most one pending deletion per path. The generation tells a timer whether
/// it was superseded while sleeping.
#[derive(Debug, Default)]
struct Deletions {
    next_generation: u64,
    pending: HashMap<PathBuf, PendingDelete>,
}

#[derive(Debug)]
struct PendingDelete {
    generation: u64,
    task: AbortHandle,
}

impl Deletions {
    fn claim(&mut self, path: &Path, generation: u64) -> bool {
        if self
            .pending
            .get(path)
            .is_some_and(|pending| pending.generation == generation)
        {
            self.pending.remove(path);
            return true;
        }
        false
    }
}

impl ArtifactStore {
    /// Creates the root directory when missing.
    pub fn open(root: impl Into<PathBuf>, max_age: Duration) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: Arc::new(root),
            max_age,
            deletions: Arc::new(Mutex::new(Deletions::default())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an artifact produced under `file_name`. Callers pass names built
    /// by [`crate::media::Variant::file_name`], which never contain separators.
    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Name relative to the root, as accepted by [`ArtifactStore::resolve`].
    pub fn relative_name(&self, path: &Path) -> Option<String> {
        path.strip_prefix(self.root.as_path())
            .ok()
            .map(|rel| rel.to_string_lossy().into_owned())
    }

    /// Maps a caller-supplied path onto the store. `None` when it would leave
    /// the root.
    pub fn resolve(&self, requested: &str) -> Option<PathBuf> {
        resolve_within_root(&self.root, requested)
    }

    /// True for a non-empty regular file.
    pub async fn exists(&self, path: &Path) -> bool {
        matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file() && meta.len() > 0)
    }

    /// An existing artifact that is young enough to be served as a cache hit.
    pub async fn is_fresh(&self, path: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        if !meta.is_file() || meta.len() == 0 {
            return false;
        }
        match meta.modified().map(|modified| modified.elapsed()) {
            Ok(Ok(age)) => age <= self.max_age,
            // Clock skew puts the mtime in the future; still a fresh file.
            Ok(Err(_)) => true,
            Err(_) => true,
        }
    }

    /// Removes an artifact and any leftovers of a partial download now.
    pub async fn remove_now(&self, path: &Path) {
        remove_quietly(path).await;
        for suffix in LEFTOVER_SUFFIXES {
            let mut leftover = path.as_os_str().to_owned();
            leftover.push(".");
            leftover.push(suffix);
            remove_quietly(Path::new(&leftover)).await;
        }
    }

    /// Deletes `path` after `delay`, replacing any deletion already pending
    /// for it.
    pub fn schedule_delete(&self, path: PathBuf, delay: Duration) -> JoinHandle<()> {
        let mut deletions = self.deletions.lock();
        deletions.next_generation += 1;
        let generation = deletions.next_generation;
        let shared = self.deletions.clone();
        let target = path.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.lock().claim(&target, generation) {
                remove_quietly(&target).await;
            }
        });
        let replaced = deletions.pending.insert(
            path.clone(),
            PendingDelete {
                generation,
                task: task.abort_handle(),
            },
        );
        if let Some(previous) = replaced {
            previous.task.abort();
        }
        debug!(
            path = %path.display(),
            delay_ms = delay.as_millis() as u64,
            "artifact deletion scheduled"
        );
        task
    }

    /// Drops the pending deletion of `path`, if any.
    pub fn cancel_delete(&self, path: &Path) {
        if let Some(pending) = self.deletions.lock().pending.remove(path) {
            pending.task.abort();
            debug!(path = %path.display(), "artifact deletion cancelled");
        }
    }

    /// Streams an artifact, honoring a single `Range` header.
    pub async fn serve(
        &self,
        path: &Path,
        headers: Option<&HeaderMap>,
        download_name: Option<&str>,
    ) -> io::Result<Response> {
        stream_file(path, headers, download_name).await
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "artifact removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove artifact: {err}"),
    }
}

async fn stream_file(
    path: &Path,
    headers: Option<&HeaderMap>,
    download_name: Option<&str>,
) -> io::Result<Response> {
    let mut file = File::open(path).await?;
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a file"));
    }
    let size = meta.len();
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            insert_header(&mut response, header::CONTENT_RANGE, format!("bytes */{size}"));
            return Ok(response);
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(io::SeekFrom::Start(start)).await?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{size}"),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = MimeGuess::from_path(path).first() {
        insert_header(&mut response, header::CONTENT_TYPE, mime.to_string());
    }
    if let Some(name) = download_name {
        insert_header(
            &mut response,
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", name.replace('"', "")),
        );
    }
    Ok(response)
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}

/// Parses `bytes=a-b`, `bytes=a-` and `bytes=-n`. Multi-range requests are
/// answered with the full body.
fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let range = value.trim().strip_prefix("bytes=")?.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start, end) = range.split_once('-')?;
    let last = size.saturating_sub(1);
    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix), last));
    }
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() { last } else { end.parse().ok()? };
    (end >= start).then_some((start, end))
}
