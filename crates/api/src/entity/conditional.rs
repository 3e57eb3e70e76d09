//! Conditional request evaluation (RFC 7232).

use axum::http::{HeaderMap, Method, header};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Outcome of evaluating request preconditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Serve the content; carries the `Range` header if it still applies.
    Proceed(Option<String>),
    /// Answer `304 Not Modified`.
    NotModified,
    /// Answer `412 Precondition Failed`.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cond {
    None,
    True,
    False,
}

/// Evaluate `If-Match`, `If-Unmodified-Since`, `If-None-Match`,
/// `If-Modified-Since` and `If-Range` in that order.
#[must_use]
pub fn check_preconditions(
    method: &Method,
    headers: &HeaderMap,
    etag: Option<&str>,
    modified: Option<DateTime<Utc>>,
) -> Precondition {
    let mut cond = if_match(headers, etag);
    if cond == Cond::None {
        cond = if_unmodified_since(headers, modified);
    }
    if cond == Cond::False {
        return Precondition::Failed;
    }

    match if_none_match(headers, etag) {
        Cond::False => {
            return if is_read(method) {
                Precondition::NotModified
            } else {
                Precondition::Failed
            };
        }
        Cond::None => {
            if if_modified_since(method, headers, modified) == Cond::False {
                return Precondition::NotModified;
            }
        }
        Cond::True => {}
    }

    let range = header_str(headers, header::RANGE).map(str::to_string);
    if range.is_some() && if_range(method, headers, etag, modified) == Cond::False {
        return Precondition::Proceed(None);
    }
    Precondition::Proceed(range)
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn if_match(headers: &HeaderMap, etag: Option<&str>) -> Cond {
    let Some(mut list) = header_str(headers, header::IF_MATCH) else {
        return Cond::None;
    };
    loop {
        list = list.trim_start();
        if list.is_empty() {
            break;
        }
        if let Some(rest) = list.strip_prefix(',') {
            list = rest;
            continue;
        }
        if list.starts_with('*') {
            return Cond::True;
        }
        let Some((tag, rest)) = scan_etag(list) else {
            break;
        };
        if etag.is_some_and(|current| strong_match(tag, current)) {
            return Cond::True;
        }
        list = rest;
    }
    Cond::False
}

fn if_unmodified_since(headers: &HeaderMap, modified: Option<DateTime<Utc>>) -> Cond {
    let (Some(value), Some(modified)) = (header_str(headers, header::IF_UNMODIFIED_SINCE), modified)
    else {
        return Cond::None;
    };
    match parse_http_date(value) {
        Some(since) if modified.timestamp() <= since.timestamp() => Cond::True,
        Some(_) => Cond::False,
        None => Cond::None,
    }
}

fn if_none_match(headers: &HeaderMap, etag: Option<&str>) -> Cond {
    let Some(mut list) = header_str(headers, header::IF_NONE_MATCH) else {
        return Cond::None;
    };
    loop {
        list = list.trim_start();
        if list.is_empty() {
            break;
        }
        if let Some(rest) = list.strip_prefix(',') {
            list = rest;
            continue;
        }
        if list.starts_with('*') {
            return Cond::False;
        }
        let Some((tag, rest)) = scan_etag(list) else {
            break;
        };
        if etag.is_some_and(|current| weak_match(tag, current)) {
            return Cond::False;
        }
        list = rest;
    }
    Cond::True
}

fn if_modified_since(
    method: &Method,
    headers: &HeaderMap,
    modified: Option<DateTime<Utc>>,
) -> Cond {
    if !is_read(method) {
        return Cond::None;
    }
    let (Some(value), Some(modified)) = (header_str(headers, header::IF_MODIFIED_SINCE), modified)
    else {
        return Cond::None;
    };
    match parse_http_date(value) {
        Some(since) if modified.timestamp() <= since.timestamp() => Cond::False,
        Some(_) => Cond::True,
        None => Cond::None,
    }
}

fn if_range(
    method: &Method,
    headers: &HeaderMap,
    etag: Option<&str>,
    modified: Option<DateTime<Utc>>,
) -> Cond {
    if !is_read(method) {
        return Cond::None;
    }
    let Some(value) = header_str(headers, header::IF_RANGE) else {
        return Cond::None;
    };
    if let Some((tag, _)) = scan_etag(value) {
        return if etag.is_some_and(|current| strong_match(tag, current)) {
            Cond::True
        } else {
            Cond::False
        };
    }
    match (modified, parse_http_date(value)) {
        (Some(modified), Some(date)) if modified.timestamp() == date.timestamp() => Cond::True,
        _ => Cond::False,
    }
}

/// Split the first entity tag off `s`, returning it and the remainder.
fn scan_etag(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    let start = if s.starts_with("W/") { 2 } else { 0 };
    let bytes = s.as_bytes();
    if bytes.len() < start + 2 || bytes[start] != b'"' {
        return None;
    }
    for (i, &c) in bytes.iter().enumerate().skip(start + 1) {
        match c {
            b'"' => return Some((&s[..=i], &s[i + 1..])),
            0x21 | 0x23..=0x7E | 0x80..=0xFF => {}
            _ => return None,
        }
    }
    None
}

fn strong_match(a: &str, b: &str) -> bool {
    a == b && a.starts_with('"')
}

fn weak_match(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

/// Parse an HTTP date in IMF-fixdate, RFC 850 or asctime form.
#[must_use]
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// Format a timestamp as an IMF-fixdate.
#[must_use]
pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    const ETAG: &str = "\"abc\"";

    fn modified() -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[rstest]
    #[case(vec![], Precondition::Proceed(None))]
    #[case(vec![(header::IF_NONE_MATCH, "\"abc\"")], Precondition::NotModified)]
    #[case(vec![(header::IF_NONE_MATCH, "W/\"abc\"")], Precondition::NotModified)]
    #[case(vec![(header::IF_NONE_MATCH, "\"x\", \"abc\"")], Precondition::NotModified)]
    #[case(vec![(header::IF_NONE_MATCH, "*")], Precondition::NotModified)]
    #[case(vec![(header::IF_NONE_MATCH, "\"other\"")], Precondition::Proceed(None))]
    #[case(vec![(header::IF_MATCH, "\"other\"")], Precondition::Failed)]
    #[case(vec![(header::IF_MATCH, "W/\"abc\"")], Precondition::Failed)]
    #[case(vec![(header::IF_MATCH, "\"abc\"")], Precondition::Proceed(None))]
    #[case(vec![(header::IF_MODIFIED_SINCE, "Wed, 01 May 2024 12:00:00 GMT")], Precondition::NotModified)]
    #[case(vec![(header::IF_MODIFIED_SINCE, "Tue, 30 Apr 2024 12:00:00 GMT")], Precondition::Proceed(None))]
    #[case(vec![(header::IF_UNMODIFIED_SINCE, "Tue, 30 Apr 2024 12:00:00 GMT")], Precondition::Failed)]
    #[case(vec![(header::IF_UNMODIFIED_SINCE, "not a date")], Precondition::Proceed(None))]
    fn test_get_preconditions(
        #[case] pairs: Vec<(header::HeaderName, &str)>,
        #[case] expected: Precondition,
    ) {
        let result = check_preconditions(&Method::GET, &headers(&pairs), Some(ETAG), modified());
        assert_eq!(result, expected);
    }

    #[test]
    fn test_if_none_match_on_write_fails() {
        let map = headers(&[(header::IF_NONE_MATCH, ETAG)]);
        assert_eq!(
            check_preconditions(&Method::PUT, &map, Some(ETAG), modified()),
            Precondition::Failed
        );
    }

    #[test]
    fn test_if_none_match_overrides_modified_since() {
        let map = headers(&[
            (header::IF_NONE_MATCH, "\"other\""),
            (header::IF_MODIFIED_SINCE, "Wed, 01 May 2024 12:00:00 GMT"),
        ]);
        assert_eq!(
            check_preconditions(&Method::GET, &map, Some(ETAG), modified()),
            Precondition::Proceed(None)
        );
    }

    #[rstest]
    #[case("\"abc\"", Some("bytes=0-1"))]
    #[case("\"stale\"", None)]
    #[case("Wed, 01 May 2024 12:00:00 GMT", Some("bytes=0-1"))]
    #[case("Wed, 01 May 2024 12:00:01 GMT", None)]
    fn test_if_range(#[case] if_range: &str, #[case] expected: Option<&str>) {
        let map = headers(&[(header::RANGE, "bytes=0-1"), (header::IF_RANGE, if_range)]);
        assert_eq!(
            check_preconditions(&Method::GET, &map, Some(ETAG), modified()),
            Precondition::Proceed(expected.map(str::to_string))
        );
    }

    #[rstest]
    #[case("Sun, 06 Nov 1994 08:49:37 GMT")]
    #[case("Sunday, 06-Nov-94 08:49:37 GMT")]
    #[case("Sun Nov  6 08:49:37 1994")]
    fn test_http_date_forms(#[case] value: &str) {
        let expected = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(parse_http_date(value), Some(expected));
    }

    #[test]
    fn test_format_http_date() {
        let date = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(format_http_date(date), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_scan_etag() {
        assert_eq!(scan_etag("W/\"a\", \"b\""), Some(("W/\"a\"", ", \"b\"")));
        assert_eq!(scan_etag("abc"), None);
        assert_eq!(scan_etag("\"unterminated"), None);
    }
}
