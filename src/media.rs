#![forbid(unsafe_code)]

//! Identifiers and output variants for a single fetch.

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::{FetchError, Result},
    security::{is_valid_media_ref, sanitize_title},
};

/// Validated source media identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MediaRef(String);

impl MediaRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FetchError::InvalidInput("Video ID is required".into()));
        }
        if !is_valid_media_ref(trimmed) {
            return Err(FetchError::InvalidInput("Invalid video ID".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Audio,
    Video,
}

impl MediaFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "audio" | "mp3" => Ok(Self::Audio),
            "video" | "mp4" => Ok(Self::Video),
            _ => Err(FetchError::InvalidInput(format!(
                "Unknown format: {}",
                value.trim()
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video => "mp4",
        }
    }
}

/// Quality tier. Audio tiers are bitrates in kbit/s, video tiers are maximum
/// frame heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    Best,
    Bitrate(u32),
    Height(u32),
}

const AUDIO_BITRATES: [u32; 6] = [64, 96, 128, 192, 256, 320];
const VIDEO_HEIGHTS: [u32; 8] = [144, 240, 360, 480, 720, 1080, 1440, 2160];

impl Quality {
    pub fn parse(format: MediaFormat, raw: Option<&str>) -> Result<Self> {
        let value = raw.map(|v| v.trim().to_ascii_lowercase()).unwrap_or_default();
        if value.is_empty() || value == "best" || value == "highest" {
            return Ok(Self::Best);
        }
        let invalid = || FetchError::InvalidInput(format!("Unsupported quality: {value}"));
        match format {
            MediaFormat::Audio => {
                let number = value
                    .trim_end_matches("kbps")
                    .trim_end_matches('k')
                    .parse::<u32>()
                    .map_err(|_| invalid())?;
                AUDIO_BITRATES
                    .contains(&number)
                    .then_some(Self::Bitrate(number))
                    .ok_or_else(invalid)
            }
            MediaFormat::Video => {
                let number = value
                    .trim_end_matches('p')
                    .parse::<u32>()
                    .map_err(|_| invalid())?;
                VIDEO_HEIGHTS
                    .contains(&number)
                    .then_some(Self::Height(number))
                    .ok_or_else(invalid)
            }
        }
    }

    pub fn label(self) -> String {
        match self {
            Self::Best => "best".to_string(),
            Self::Bitrate(kbps) => format!("{kbps}k"),
            Self::Height(height) => format!("{height}p"),
        }
    }
}

/// Output kind and quality tier requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variant {
    pub format: MediaFormat,
    pub quality: Quality,
}

impl Variant {
    pub fn parse(format: &str, quality: Option<&str>) -> Result<Self> {
        let format = MediaFormat::parse(format)?;
        Ok(Self {
            format,
            quality: Quality::parse(format, quality)?,
        })
    }

    pub fn new(format: MediaFormat, quality: Quality) -> Self {
        Self { format, quality }
    }

    /// Deterministic file name for this variant. The sanitized title is
    /// preferred, the media reference is used when the title has nothing
    /// usable left.
    pub fn file_name(&self, title: Option<&str>, media_ref: &MediaRef) -> String {
        let stem = title
            .and_then(sanitize_title)
            .unwrap_or_else(|| media_ref.as_str().to_string());
        format!(
            "{stem}_{}_{}.{}",
            self.format.as_str(),
            self.quality.label(),
            self.format.extension()
        )
    }

    /// Argument list for the fetch tool, excluding the executable itself.
    pub fn fetch_args(
        &self,
        media_ref: &MediaRef,
        output: &Path,
        rate_limit: Option<&str>,
    ) -> Vec<String> {
        let mut args = Vec::new();
        match (self.format, self.quality) {
            (MediaFormat::Audio, quality) => {
                args.extend(
                    ["-f", "bestaudio/best", "--extract-audio", "--audio-format", "mp3"]
                        .map(String::from),
                );
                args.push("--audio-quality".into());
                args.push(match quality {
                    Quality::Bitrate(kbps) => format!("{kbps}K"),
                    _ => "0".into(),
                });
            }
            (MediaFormat::Video, Quality::Height(height)) => {
                args.push("-f".into());
                args.push(format!(
                    "bestvideo[height<={height}]+bestaudio/best[height<={height}]"
                ));
                args.extend(["--merge-output-format", "mp4"].map(String::from));
            }
            (MediaFormat::Video, _) => {
                args.extend(
                    ["-f", "bestvideo+bestaudio/best", "--merge-output-format", "mp4"]
                        .map(String::from),
                );
            }
        }
        args.extend(["--newline", "--no-playlist", "--no-warnings"].map(String::from));
        if let Some(limit) = rate_limit {
            args.push("--limit-rate".into());
            args.push(limit.to_string());
        }
        args.push("-o".into());
        args.push(output.to_string_lossy().into_owned());
        args.push(media_ref.watch_url());
        args
    }
}
