#![forbid(unsafe_code)]

//! Text matching over the fetch tool's output.
//!
//! The job state machine only talks to [`OutputMatcher`]; the yt-dlp specific
//! patterns live in [`YtDlpMatcher`] so they can be tested without spawning
//! anything.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::FetchError;

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[download\]\s+(\d{1,3}(?:\.\d+)?)%").expect("progress pattern is valid")
});

/// Substrings that mean the source can never be fetched. Matching is
/// case-insensitive.
const UNAVAILABLE_PATTERNS: &[&str] = &[
    "video unavailable",
    "private video",
    "this video has been removed",
    "this video is not available",
    "this video is no longer available",
    "sign in to confirm your age",
    "members-only content",
    "join this channel to get access",
    "account associated with this video has been terminated",
    "blocked it in your country",
    "not available in your country",
];

pub trait OutputMatcher: Send + Sync {
    /// Last progress percentage found in `chunk`, if any.
    fn progress(&self, chunk: &str) -> Option<f64>;

    /// A failure that should stop the process immediately.
    fn fatal(&self, chunk: &str) -> Option<FetchError>;

    /// Classifies a non-zero exit from the tail of the tool's stderr.
    fn classify_exit(&self, stderr_tail: &str, code: Option<i32>) -> FetchError;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YtDlpMatcher;

impl OutputMatcher for YtDlpMatcher {
    fn progress(&self, chunk: &str) -> Option<f64> {
        PROGRESS_RE
            .captures_iter(chunk)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
            .filter(|value| (0.0..=100.0).contains(value))
            .last()
    }

    fn fatal(&self, chunk: &str) -> Option<FetchError> {
        let lower = chunk.to_ascii_lowercase();
        UNAVAILABLE_PATTERNS
            .iter()
            .find(|pattern| lower.contains(*pattern))
            .map(|_| FetchError::UpstreamUnavailable(last_error_line(chunk)))
    }

    fn classify_exit(&self, stderr_tail: &str, code: Option<i32>) -> FetchError {
        if let Some(err) = self.fatal(stderr_tail) {
            return err;
        }
        let detail = last_error_line(stderr_tail);
        if detail.is_empty() {
            match code {
                Some(code) => FetchError::ProcessFailure(format!("exited with status {code}")),
                None => FetchError::ProcessFailure("terminated by signal".into()),
            }
        } else {
            FetchError::ProcessFailure(detail)
        }
    }
}

/// Picks the most useful line out of tool output: the last `ERROR:` line,
/// falling back to the last non-empty one.
fn last_error_line(text: &str) -> String {
    let lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
    lines
        .clone()
        .filter(|line| line.starts_with("ERROR"))
        .last()
        .or_else(|| lines.last())
        .unwrap_or_default()
        .to_string()
}

/// Keeps reported progress monotonic. Lower or repeated readings are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressTracker {
    last: Option<f64>,
}

impl ProgressTracker {
    pub fn observe(&mut self, value: f64) -> Option<f64> {
        let value = value.clamp(0.0, 100.0);
        match self.last {
            Some(last) if value <= last => None,
            _ => {
                self.last = Some(value);
                Some(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn progress_last_match_wins() {
        let chunk = "[download]   1.0% of 3.00MiB at 1.00MiB/s ETA 00:03\n\
                     [download]  12.5% of 3.00MiB at 1.00MiB/s ETA 00:02\n\
                     [download]  40.0% of 3.00MiB at 1.00MiB/s ETA 00:01\n";
        assert_eq!(YtDlpMatcher.progress(chunk), Some(40.0));
    }

    #[test]
    fn progress_ignores_unrelated_lines() {
        assert_eq!(YtDlpMatcher.progress(""), None);
        assert_eq!(YtDlpMatcher.progress("[youtube] dQw4w9WgXcQ: Downloading webpage"), None);
        assert_eq!(YtDlpMatcher.progress("ETA 50% done"), None);
        assert_eq!(YtDlpMatcher.progress("[download] 100% of 3.00MiB"), Some(100.0));
        assert_eq!(YtDlpMatcher.progress("[download] 250% of x"), None);
    }

    #[test]
    fn fatal_patterns_are_case_insensitive() {
        let err = YtDlpMatcher
            .fatal("ERROR: [youtube] dQw4w9WgXcQ: Video unavailable")
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert!(YtDlpMatcher.fatal("ERROR: PRIVATE VIDEO").is_some());
        assert!(YtDlpMatcher.fatal("[download] 10.0%").is_none());
    }

    #[test]
    fn classify_exit_prefers_error_lines() {
        let tail = "[youtube] Extracting URL\nERROR: unable to download video data: HTTP Error 403\nsome trailer\n";
        let err = YtDlpMatcher.classify_exit(tail, Some(1));
        assert_eq!(err.kind(), ErrorKind::ProcessFailure);
        assert!(err.to_string().contains("HTTP Error 403"));

        let err = YtDlpMatcher.classify_exit("", Some(2));
        assert!(err.to_string().contains("status 2"));

        let err = YtDlpMatcher.classify_exit("ERROR: This video has been removed", Some(1));
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[test]
    fn tracker_is_monotonic() {
        let mut tracker = ProgressTracker::default();
        let readings = [0.0, 5.0, 3.0, 5.0, 50.0, 49.9, 100.0, 120.0];
        let emitted: Vec<f64> = readings
            .iter()
            .filter_map(|value| tracker.observe(*value))
            .collect();
        assert_eq!(emitted, vec![0.0, 5.0, 50.0, 100.0]);
    }
}
