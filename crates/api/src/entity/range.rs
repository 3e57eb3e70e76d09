//! `Range` header parsing (RFC 7233).

use std::fmt;

/// One satisfiable byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    /// First byte.
    pub start: u64,
    /// Number of bytes.
    pub length: u64,
}

impl HttpRange {
    /// `Content-Range` value for a body of `size` bytes.
    #[must_use]
    pub fn content_range(&self, size: u64) -> String {
        if self.length == 0 {
            return format!("bytes */{size}");
        }
        format!(
            "bytes {}-{}/{size}",
            self.start,
            self.start + self.length - 1
        )
    }
}

/// Why a `Range` header cannot be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Header is syntactically invalid.
    Invalid,
    /// Every range starts at or beyond the end of the content.
    NoOverlap,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => f.write_str("invalid range"),
            Self::NoOverlap => f.write_str("invalid range: failed to overlap"),
        }
    }
}

impl std::error::Error for RangeError {}

/// Parse a `Range` header against content of `size` bytes.
///
/// Suffix (`-N`) and open-ended (`N-`) ranges are supported and ends are
/// clamped to the content. Ranges starting past the end are dropped; if every
/// range was dropped the result is `NoOverlap`.
///
/// # Errors
///
/// `Invalid` for malformed headers, `NoOverlap` when nothing is satisfiable.
pub fn parse_range(header: &str, size: u64) -> Result<Vec<HttpRange>, RangeError> {
    if header.is_empty() {
        return Ok(Vec::new());
    }
    let Some(specs) = header.strip_prefix("bytes=") else {
        return Err(RangeError::Invalid);
    };

    let mut ranges = Vec::new();
    let mut no_overlap = false;
    for spec in specs.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let Some((start, end)) = spec.split_once('-') else {
            return Err(RangeError::Invalid);
        };
        let (start, end) = (start.trim(), end.trim());

        let range = if start.is_empty() {
            // -N: the final N bytes.
            if end.is_empty() || end.starts_with('-') {
                return Err(RangeError::Invalid);
            }
            let suffix = parse_number(end)?.min(size);
            HttpRange {
                start: size - suffix,
                length: suffix,
            }
        } else {
            let first = parse_number(start)?;
            if first >= size {
                no_overlap = true;
                continue;
            }
            let length = if end.is_empty() {
                size - first
            } else {
                let last = parse_number(end)?;
                if first > last {
                    return Err(RangeError::Invalid);
                }
                last.min(size - 1) - first + 1
            };
            HttpRange {
                start: first,
                length,
            }
        };
        ranges.push(range);
    }

    if no_overlap && ranges.is_empty() {
        return Err(RangeError::NoOverlap);
    }
    Ok(ranges)
}

fn parse_number(s: &str) -> Result<u64, RangeError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Invalid);
    }
    s.parse().map_err(|_| RangeError::Invalid)
}

/// Total bytes covered by `ranges`, counting overlaps twice.
#[must_use]
pub fn total_length(ranges: &[HttpRange]) -> u64 {
    ranges
        .iter()
        .fold(0u64, |acc, r| acc.saturating_add(r.length))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn r(start: u64, length: u64) -> HttpRange {
        HttpRange { start, length }
    }

    #[rstest]
    #[case("", vec![])]
    #[case("bytes=0-0", vec![r(0, 1)])]
    #[case("bytes=-5", vec![r(5, 5)])]
    #[case("bytes=-20", vec![r(0, 10)])]
    #[case("bytes=2-", vec![r(2, 8)])]
    #[case("bytes=2-100", vec![r(2, 8)])]
    #[case("bytes=0-1, 4-5", vec![r(0, 2), r(4, 2)])]
    #[case("bytes=0-1,20-30", vec![r(0, 2)])]
    #[case("bytes= 3 - 4 ,", vec![r(3, 2)])]
    fn test_satisfiable_ranges(#[case] header: &str, #[case] expected: Vec<HttpRange>) {
        assert_eq!(parse_range(header, 10).unwrap(), expected);
    }

    #[rstest]
    #[case("bytes=20-", RangeError::NoOverlap)]
    #[case("bytes=10-12", RangeError::NoOverlap)]
    #[case("items=0-1", RangeError::Invalid)]
    #[case("bytes=5-2", RangeError::Invalid)]
    #[case("bytes=abc", RangeError::Invalid)]
    #[case("bytes=--1", RangeError::Invalid)]
    #[case("bytes=-", RangeError::Invalid)]
    #[case("bytes=+1-2", RangeError::Invalid)]
    fn test_unsatisfiable_ranges(#[case] header: &str, #[case] expected: RangeError) {
        assert_eq!(parse_range(header, 10).unwrap_err(), expected);
    }

    #[test]
    fn test_content_range() {
        assert_eq!(r(2_000_000, 560_000).content_range(2_560_000), "bytes 2000000-2559999/2560000");
        assert_eq!(r(0, 0).content_range(0), "bytes */0");
    }

    #[test]
    fn test_total_length() {
        assert_eq!(total_length(&[r(0, 5), r(3, 5)]), 10);
        assert_eq!(total_length(&[]), 0);
    }
}
