#![forbid(unsafe_code)]

//! Public shape of the video details response and the helpers that turn the
//! extractor's raw record into it.

use chrono::NaiveDate;
use serde::Serialize;

use crate::extractor::{RawFormat, RawVideoInfo};

/// Placeholder for text fields the extractor did not report.
pub const NOT_AVAILABLE: &str = "N/A";
pub const UNKNOWN_SIZE: &str = "Unknown";
pub const AUDIO_ONLY: &str = "audio only";

const SIZE_UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoDetails {
    pub title: String,
    pub thumbnail: String,
    pub description: String,
    pub channel: String,
    pub views: u64,
    pub upload_date: String,
    pub formats: Vec<FormatDescriptor>,
}

/// One selectable encoding of a video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub resolution: String,
    pub file_size: String,
    pub ext: String,
}

impl From<RawVideoInfo> for VideoDetails {
    fn from(info: RawVideoInfo) -> Self {
        Self {
            title: or_not_available(info.title),
            thumbnail: or_not_available(info.thumbnail),
            description: or_not_available(info.description),
            channel: or_not_available(info.channel),
            views: info.view_count.unwrap_or(0),
            upload_date: format_upload_date(info.upload_date.as_deref()),
            formats: info
                .formats
                .unwrap_or_default()
                .into_iter()
                .map(FormatDescriptor::from)
                .collect(),
        }
    }
}

impl From<RawFormat> for FormatDescriptor {
    fn from(format: RawFormat) -> Self {
        Self {
            format_id: or_not_available(format.format_id),
            resolution: resolution_label(format.height),
            file_size: format_file_size(format.filesize),
            ext: or_not_available(format.ext),
        }
    }
}

fn or_not_available(value: Option<String>) -> String {
    value.unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

/// `"<height>p"`, or `"audio only"` for formats without a video track.
pub fn resolution_label(height: Option<u64>) -> String {
    match height {
        Some(height) if height > 0 => format!("{height}p"),
        _ => AUDIO_ONLY.to_string(),
    }
}

/// Renders a byte count with two decimals in the largest unit below 1024,
/// topping out at TB. `None` means the extractor did not know the size.
pub fn format_file_size(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes else {
        return UNKNOWN_SIZE.to_string();
    };
    let mut size = bytes as f64;
    for unit in SIZE_UNITS {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} TB")
}

/// Converts yt-dlp's `YYYYMMDD` into `YYYY-MM-DD`; anything else is `"N/A"`.
pub fn format_upload_date(raw: Option<&str>) -> String {
    raw.filter(|value| value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|value| NaiveDate::parse_from_str(value, "%Y%m%d").ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}
