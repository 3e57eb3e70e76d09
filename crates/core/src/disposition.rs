//! `Content-Disposition` values (RFC 6266).

/// Value for a download response: `attachment; filename="..."; filename*=UTF-8''...`.
///
/// `filename` carries an ASCII-only rendition for old clients; `filename*`
/// carries the exact name percent-encoded.
#[must_use]
pub fn attachment(name: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_fallback(name),
        urlencoding::encode(name)
    )
}

/// Value for an inline response with a suggested name.
#[must_use]
pub fn inline(name: &str) -> String {
    format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_fallback(name),
        urlencoding::encode(name)
    )
}

/// Replace everything outside printable ASCII, plus quote and backslash, with `_`.
fn ascii_fallback(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
