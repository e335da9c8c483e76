#![forbid(unsafe_code)]

//! Download jobs: admission, deduplication, the per-job driver task and cleanup.
//!
//! [`DownloadManager::submit`] is the only entry point. It either
//!
//! * joins a job already producing the same output file,
//! * answers from a fresh artifact on disk without taking a slot,
//! * rejects the request with [`FetchError::ServerBusy`], or
//! * admits a new job and spawns its driver.
//!
//! Callers observe a job through a [`JobSubscription`]. When every
//! subscription of a running job is dropped the driver kills the process and
//! the job ends as [`JobState::Cancelled`]. The admission slot lives inside the
//! driver, so it is returned exactly once on every exit path.
//!
//! An in-flight entry owns its output path until the driver has finished
//! cleaning up. A request arriving while a cancelled job is still removing its
//! files waits for that cleanup before starting over.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    admission::{AdmissionController, AdmissionSlot},
    artifacts::ArtifactStore,
    error::{FetchError, Result},
    matcher::{OutputMatcher, ProgressTracker, YtDlpMatcher},
    media::{MediaRef, Variant},
    runner::{self, CommandSpec, OutputStream, ProcessEvent, ProcessExit, ProcessHandle},
};

/// Bytes of stderr kept for exit classification.
const STDERR_TAIL: usize = 16 * 1024;
/// How long a killed process gets to be reaped before its files are removed.
const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Admitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot published to subscribers on every change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip)]
    pub error: Option<FetchError>,
    /// Artifact name relative to the storage root, set on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            state: JobState::Pending,
            progress: None,
            error: None,
            artifact: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub media_ref: MediaRef,
    pub variant: Variant,
    /// Display title; the media reference names the file when absent.
    pub title: Option<String>,
}

impl JobRequest {
    pub fn job_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.media_ref,
            self.variant.format.as_str(),
            self.variant.quality.label()
        )
    }

    pub fn file_name(&self) -> String {
        self.variant.file_name(self.title.as_deref(), &self.media_ref)
    }
}

/// Live view of one job.
#[derive(Debug)]
pub struct JobSubscription {
    rx: watch::Receiver<JobStatus>,
}

impl From<watch::Receiver<JobStatus>> for JobSubscription {
    fn from(rx: watch::Receiver<JobStatus>) -> Self {
        Self { rx }
    }
}

impl JobSubscription {
    /// Latest status, marking it seen.
    pub fn current(&mut self) -> JobStatus {
        self.rx.borrow_and_update().clone()
    }

    /// Waits for the next published status. `None` once the job is gone and
    /// every status has been seen.
    pub async fn changed(&mut self) -> Option<JobStatus> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Follows the job until it reaches a terminal state.
    pub async fn wait_terminal(&mut self) -> JobStatus {
        let mut status = self.current();
        while !status.state.is_terminal() {
            match self.changed().await {
                Some(next) => status = next,
                None => break,
            }
        }
        status
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub ytdlp_bin: PathBuf,
    pub timeout: Duration,
    /// Delay between success and deletion of the artifact.
    pub retention: Duration,
    pub rate_limit: Option<String>,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    settings: ManagerSettings,
    admission: AdmissionController,
    store: ArtifactStore,
    matcher: Arc<dyn OutputMatcher>,
    in_flight: Mutex<HashMap<PathBuf, Arc<JobShared>>>,
}

struct JobShared {
    status: watch::Sender<JobStatus>,
    /// Set under the map lock once the job is abandoned. New requests must not
    /// join it.
    closing: AtomicBool,
    /// Cancelled after the entry leaves the map.
    done: CancellationToken,
}

impl JobShared {
    fn new(status: JobStatus) -> (Arc<Self>, watch::Receiver<JobStatus>) {
        let (tx, rx) = watch::channel(status);
        let shared = Arc::new(Self {
            status: tx,
            closing: AtomicBool::new(false),
            done: CancellationToken::new(),
        });
        (shared, rx)
    }
}

enum Lookup {
    Join(JobSubscription),
    /// A cancelled job still owns the path.
    Wait(CancellationToken),
    Vacant,
}

fn lookup(in_flight: &HashMap<PathBuf, Arc<JobShared>>, output: &Path) -> Lookup {
    match in_flight.get(output) {
        Some(shared) if shared.closing.load(Ordering::Acquire) => {
            Lookup::Wait(shared.done.clone())
        }
        Some(shared) => Lookup::Join(JobSubscription {
            rx: shared.status.subscribe(),
        }),
        None => Lookup::Vacant,
    }
}

enum Outcome {
    Succeeded,
    Failed(FetchError),
    Cancelled,
}

impl DownloadManager {
    pub fn new(
        settings: ManagerSettings,
        admission: AdmissionController,
        store: ArtifactStore,
    ) -> Self {
        Self::with_matcher(settings, admission, store, Arc::new(YtDlpMatcher))
    }

    pub fn with_matcher(
        settings: ManagerSettings,
        admission: AdmissionController,
        store: ArtifactStore,
        matcher: Arc<dyn OutputMatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                admission,
                store,
                matcher,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    /// Statuses of jobs that have not finished yet, oldest first.
    pub fn list_jobs(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<JobStatus> = self
            .inner
            .in_flight
            .lock()
            .values()
            .map(|shared| shared.status.borrow().clone())
            .collect();
        jobs.sort_by_key(|status| status.created_at);
        jobs
    }

    pub async fn submit(&self, request: JobRequest) -> Result<JobSubscription> {
        let output = self.inner.store.path_for(&request.file_name());
        let id = request.job_id();

        loop {
            let found = lookup(&self.inner.in_flight.lock(), &output);
            match found {
                Lookup::Join(subscription) => {
                    info!(job_id = %id, "joined in-flight job");
                    return Ok(subscription);
                }
                Lookup::Wait(done) => {
                    debug!(job_id = %id, "waiting for cancelled job to clean up");
                    done.cancelled().await;
                    continue;
                }
                Lookup::Vacant => {}
            }

            if self.inner.store.is_fresh(&output).await {
                info!(job_id = %id, path = %output.display(), "serving cached artifact");
                self.inner
                    .store
                    .schedule_delete(output.clone(), self.inner.settings.retention);
                let mut status = JobStatus::new(id);
                status.state = JobState::Succeeded;
                status.progress = Some(100.0);
                status.artifact = self.inner.store.relative_name(&output);
                status.finished_at = Some(Utc::now());
                let (_tx, rx) = watch::channel(status);
                return Ok(JobSubscription { rx });
            }

            let (shared, rx, slot) = {
                let mut in_flight = self.inner.in_flight.lock();
                match lookup(&in_flight, &output) {
                    Lookup::Join(subscription) => return Ok(subscription),
                    Lookup::Wait(_) => continue,
                    Lookup::Vacant => {}
                }
                let Some(slot) = self.inner.admission.try_admit() else {
                    info!(job_id = %id, "job rejected: server busy");
                    return Err(FetchError::ServerBusy);
                };
                let (shared, rx) = JobShared::new(JobStatus::new(id.clone()));
                in_flight.insert(output.clone(), shared.clone());
                (shared, rx, slot)
            };

            // A stale copy may still have a deletion pending from an earlier job.
            self.inner.store.cancel_delete(&output);
            transition(&shared, JobState::Admitted);
            tokio::spawn(drive(self.inner.clone(), shared, request, output, slot));
            return Ok(JobSubscription { rx });
        }
    }
}

impl ManagerInner {
    /// Marks the job as closing when nobody is watching. Runs under the map
    /// lock so a concurrent `submit` either joins before or waits for cleanup.
    fn abandon_if_unobserved(&self, shared: &JobShared) -> bool {
        let _in_flight = self.in_flight.lock();
        if shared.status.receiver_count() > 0 {
            return false;
        }
        shared.closing.store(true, Ordering::Release);
        true
    }

    fn forget(&self, output: &Path, shared: &Arc<JobShared>) {
        remove_entry(&mut self.in_flight.lock(), output, shared);
        shared.done.cancel();
    }
}

fn remove_entry(
    in_flight: &mut HashMap<PathBuf, Arc<JobShared>>,
    output: &Path,
    shared: &Arc<JobShared>,
) {
    if in_flight
        .get(output)
        .is_some_and(|current| Arc::ptr_eq(current, shared))
    {
        in_flight.remove(output);
    }
}

fn transition(shared: &JobShared, state: JobState) {
    shared.status.send_modify(|status| {
        info!(job_id = %status.id, from = ?status.state, to = ?state, "job transition");
        status.state = state;
    });
}

/// Removes the in-flight entry if the driver ends without doing so, including
/// on panic.
struct InFlightGuard {
    inner: Arc<ManagerInner>,
    output: PathBuf,
    shared: Arc<JobShared>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.forget(&self.output, &self.shared);
    }
}

async fn drive(
    inner: Arc<ManagerInner>,
    shared: Arc<JobShared>,
    request: JobRequest,
    output: PathBuf,
    slot: AdmissionSlot,
) {
    let guard = InFlightGuard {
        inner: inner.clone(),
        output: output.clone(),
        shared: shared.clone(),
    };
    let job_id = shared.status.borrow().id.clone();

    let spec = CommandSpec {
        program: inner.settings.ytdlp_bin.clone(),
        args: request.variant.fetch_args(
            &request.media_ref,
            &output,
            inner.settings.rate_limit.as_deref(),
        ),
        timeout: inner.settings.timeout,
        label: job_id.clone(),
    };

    let (outcome, handle) = match runner::spawn(spec) {
        Ok(handle) => {
            transition(&shared, JobState::Running);
            run(&inner, &shared, &output, handle).await
        }
        Err(err) => (Outcome::Failed(err), None),
    };
    slot.release();
    debug!(job_id = %job_id, active = inner.admission.active(), "admission slot released");

    if let Some(handle) = handle {
        reap(handle).await;
    }

    match outcome {
        Outcome::Succeeded => {
            let artifact = inner.store.relative_name(&output);
            shared.status.send_modify(|status| {
                status.state = JobState::Succeeded;
                status.progress = Some(100.0);
                status.artifact = artifact;
                status.finished_at = Some(Utc::now());
            });
            info!(job_id = %job_id, path = %output.display(), "job succeeded");
            inner
                .store
                .schedule_delete(output.clone(), inner.settings.retention);
        }
        Outcome::Failed(err) => {
            inner.store.remove_now(&output).await;
            warn!(job_id = %job_id, kind = ?err.kind(), "job failed: {err}");
            shared.status.send_modify(|status| {
                status.state = JobState::Failed;
                status.error = Some(err);
                status.finished_at = Some(Utc::now());
            });
        }
        Outcome::Cancelled => {
            inner.store.remove_now(&output).await;
            info!(job_id = %job_id, "job cancelled by client disconnect");
            shared.status.send_modify(|status| {
                status.state = JobState::Cancelled;
                status.finished_at = Some(Utc::now());
            });
        }
    }
    drop(guard);
}

/// Consumes process events until the job's outcome is known. The handle is
/// returned when the process may still be running.
async fn run(
    inner: &ManagerInner,
    shared: &Arc<JobShared>,
    output: &Path,
    mut handle: ProcessHandle,
) -> (Outcome, Option<ProcessHandle>) {
    let mut tracker = ProgressTracker::default();
    let mut stderr_tail = String::new();
    loop {
        tokio::select! {
            biased;
            _ = shared.status.closed() => {
                if inner.abandon_if_unobserved(shared) {
                    handle.kill();
                    return (Outcome::Cancelled, Some(handle));
                }
            }
            event = handle.next_event() => match event {
                Some(ProcessEvent::Output { stream, chunk }) => {
                    if let Some(err) = inner.matcher.fatal(&chunk) {
                        handle.kill();
                        return (Outcome::Failed(err), Some(handle));
                    }
                    if stream == OutputStream::Stderr {
                        push_tail(&mut stderr_tail, &chunk);
                    }
                    if let Some(value) = inner.matcher.progress(&chunk)
                        && let Some(value) = tracker.observe(value)
                    {
                        shared.status.send_modify(|status| status.progress = Some(value));
                    }
                }
                Some(ProcessEvent::Exited(exit)) => {
                    return (classify(inner, output, exit, &stderr_tail).await, None);
                }
                None => {
                    return (
                        Outcome::Failed(FetchError::ProcessFailure(
                            "process ended without exit status".into(),
                        )),
                        None,
                    );
                }
            }
        }
    }
}

async fn classify(inner: &ManagerInner, output: &Path, exit: ProcessExit, stderr: &str) -> Outcome {
    if exit.timed_out {
        return Outcome::Failed(FetchError::Timeout(inner.settings.timeout.as_secs()));
    }
    if exit.success() {
        // A clean exit without a file happens, e.g. when every format was filtered out.
        if inner.store.exists(output).await {
            return Outcome::Succeeded;
        }
        return Outcome::Failed(FetchError::ProcessFailure(format!(
            "exited cleanly without producing {}",
            output.display()
        )));
    }
    Outcome::Failed(inner.matcher.classify_exit(stderr, exit.code))
}

/// Waits briefly for a killed process so it cannot write after cleanup.
async fn reap(mut handle: ProcessHandle) {
    let drained = tokio::time::timeout(REAP_GRACE, async {
        while let Some(event) = handle.next_event().await {
            if matches!(event, ProcessEvent::Exited(_)) {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(pid = ?handle.pid(), "killed process was not reaped in time");
    }
}

fn push_tail(tail: &mut String, chunk: &str) {
    tail.push_str(chunk);
    if tail.len() > STDERR_TAIL {
        let mut cut = tail.len() - STDERR_TAIL;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}
