#![forbid(unsafe_code)]

//! Download job service around yt-dlp: admission control, subprocess
//! supervision, progress relay and artifact cleanup.

pub mod admission;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod matcher;
pub mod media;
pub mod metadata;
pub mod relay;
pub mod retry;
pub mod runner;
pub mod security;

#[cfg(test)]
mod testing;

pub use error::{ErrorKind, FetchError};
