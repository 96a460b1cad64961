//! Range capability probing.

use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap};

use crate::error::FetchError;

/// What a HEAD (or `bytes=0-0` GET) probe learned about an endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeProbe {
    pub url: String,
    pub supports_ranges: bool,
    pub total_size: Option<u64>,
    pub content_type: Option<String>,
}

impl RangeProbe {
    /// Interpret probe response headers.
    pub(crate) fn from_response(url: &str, status: StatusCode, headers: &HeaderMap) -> Self {
        let accept_ranges = header_str(headers, ACCEPT_RANGES)
            .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
            .unwrap_or(false);
        let content_range = header_str(headers, CONTENT_RANGE);
        let supports_ranges =
            status == StatusCode::PARTIAL_CONTENT || accept_ranges || content_range.is_some();

        let total_size = match status {
            StatusCode::PARTIAL_CONTENT => content_range.and_then(parse_content_range_total),
            _ => content_range
                .and_then(parse_content_range_total)
                .or_else(|| header_str(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok())),
        };

        Self {
            url: url.to_string(),
            supports_ranges,
            total_size: total_size.filter(|len| *len > 0),
            content_type: header_str(headers, CONTENT_TYPE).map(str::to_string),
        }
    }

    /// Total size for range planning, or `RangeUnsupported` when the endpoint cannot be
    /// fetched in pieces.
    pub fn require_ranges(&self) -> Result<u64, FetchError> {
        match (self.supports_ranges, self.total_size) {
            (true, Some(total)) => Ok(total),
            _ => Err(FetchError::RangeUnsupported {
                total_size: self.total_size,
            }),
        }
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract the total length from a Content-Range header.
pub(crate) fn parse_content_range_total(header: &str) -> Option<u64> {
    // Format: "bytes start-end/total"
    let (_, total) = header.split_once('/')?;
    total.trim().parse::<u64>().ok()
}
