//! Byte range negotiation.
//!
//! Two header shapes are understood:
//!
//! - client `Range`: `bytes=start-[end]` (a space instead of `=` is accepted)
//! - origin `Content-Range`: `bytes start-end/length`
//!
//! Multi-range and suffix (`bytes=-500`) requests are not supported and parse
//! as `None`, which callers treat as "no range".

use std::fmt;

use serde::{Deserialize, Serialize};

/// An inclusive byte range within a resource of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
    /// Total length of the resource.
    pub total: u64,
}

impl ByteRange {
    /// Build a range, clamping `end` to `total - 1`.
    ///
    /// Returns `None` when the result is not satisfiable.
    #[must_use]
    pub const fn new(start: u64, end: u64, total: u64) -> Option<Self> {
        if total == 0 {
            return None;
        }
        let end = if end >= total { total - 1 } else { end };
        if start > end {
            return None;
        }
        Some(Self { start, end, total })
    }

    /// Parse a client `Range` header against the resource length.
    ///
    /// A missing end means "to the end of the resource".
    #[must_use]
    pub fn parse_request(header: &str, content_length: u64) -> Option<Self> {
        let spec = strip_unit(header)?;
        let (start, end) = spec.split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let end = match end.trim() {
            "" => content_length.checked_sub(1)?,
            value => value.parse::<u64>().ok()?,
        };
        Self::new(start, end, content_length)
    }

    /// Parse an origin `Content-Range` header.
    #[must_use]
    pub fn parse_content_range(header: &str) -> Option<Self> {
        let spec = strip_unit(header)?;
        let (span, total) = spec.split_once('/')?;
        let (start, end) = span.split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let end = end.trim().parse::<u64>().ok()?;
        let total = total.trim().parse::<u64>().ok()?;
        Self::new(start, end, total)
    }

    /// Number of bytes covered by the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a valid range covers at least one byte.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether the range covers the whole resource.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.start == 0 && self.end + 1 == self.total
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Strip the `bytes` unit and its separator, rejecting multi-range values.
fn strip_unit(header: &str) -> Option<&str> {
    let rest = header.trim().strip_prefix("bytes")?;
    let rest = rest
        .strip_prefix('=')
        .or_else(|| rest.strip_prefix(' '))
        .unwrap_or(rest);
    if rest.contains(',') {
        return None;
    }
    Some(rest.trim_start())
}
