#![forbid(unsafe_code)]

//! Progress relay: turns a job subscription into client-facing events.
//!
//! The event stream owns the subscription. Dropping the stream, which is what
//! axum does when the client goes away, drops the subscription and lets the
//! job driver cancel the download.

use std::{convert::Infallible, time::Duration};

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::job::{JobState, JobStatus, JobSubscription};

/// One message pushed to the client. Serialized as `{"progress": n}`,
/// `{"error": "..."}` or `{"url": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RelayEvent {
    Progress { progress: f64 },
    Error { error: String },
    Completed { url: String },
}

/// Link served by `/download-file`. Artifact names only contain URL-safe
/// characters.
pub fn artifact_url(name: &str) -> String {
    format!("/download-file?path={name}")
}

fn fresh_progress(last: &mut Option<f64>, status: &JobStatus) -> Option<RelayEvent> {
    let progress = status.progress?;
    if last.is_some_and(|seen| progress <= seen) {
        return None;
    }
    *last = Some(progress);
    Some(RelayEvent::Progress { progress })
}

fn terminal_event(status: &JobStatus) -> Option<RelayEvent> {
    match status.state {
        JobState::Succeeded => Some(match status.artifact.as_deref() {
            Some(name) => RelayEvent::Completed {
                url: artifact_url(name),
            },
            None => RelayEvent::Error {
                error: "Failed to download media".into(),
            },
        }),
        JobState::Failed => Some(RelayEvent::Error {
            error: status
                .error
                .as_ref()
                .map(|err| err.user_message())
                .unwrap_or_else(|| "Failed to download media".into()),
        }),
        JobState::Cancelled => Some(RelayEvent::Error {
            error: "Download cancelled".into(),
        }),
        JobState::Pending | JobState::Admitted | JobState::Running => None,
    }
}

/// Progress events in increasing order, then exactly one terminal event.
pub fn events(subscription: JobSubscription) -> impl Stream<Item = RelayEvent> + Send {
    stream! {
        let mut subscription = subscription;
        let mut last = None;
        let mut status = subscription.current();
        loop {
            if let Some(event) = fresh_progress(&mut last, &status) {
                yield event;
            }
            if let Some(event) = terminal_event(&status) {
                yield event;
                break;
            }
            match subscription.changed().await {
                Some(next) => status = next,
                None => {
                    yield RelayEvent::Error {
                        error: "Download ended unexpectedly".into(),
                    };
                    break;
                }
            }
        }
    }
}

/// Server-sent events with periodic keep-alive comments.
pub fn sse(
    subscription: JobSubscription,
    keepalive: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = events(subscription).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive))
}
