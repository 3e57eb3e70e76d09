//! Content type resolution: extension table first, then byte sniffing.

/// Bytes inspected when sniffing.
pub const SNIFF_LEN: usize = 512;

/// Fallback for content that cannot be classified.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type for a file name, by extension.
#[must_use]
pub fn content_type_for_name(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    let ct = match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "xml" => "text/xml; charset=utf-8",
        "txt" | "log" | "md" => "text/plain; charset=utf-8",
        "csv" => "text/csv; charset=utf-8",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "wasm" => "application/wasm",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "ico" => "image/vnd.microsoft.icon",
        "bmp" => "image/bmp",
        "mp4" | "m4s" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "m3u8" => "application/vnd.apple.mpegurl",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => return None,
    };
    Some(ct)
}

/// Content type guessed from the first bytes of content.
#[must_use]
pub fn sniff(data: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b\x08", "application/x-gzip"),
        (b"\x1a\x45\xdf\xa3", "video/webm"),
        (b"ID3", "audio/mpeg"),
        (b"OggS\x00", "application/ogg"),
        (b"fLaC", "audio/flac"),
        (b"\x00asm", "application/wasm"),
        (b"wOFF", "font/woff"),
        (b"wOF2", "font/woff2"),
    ];

    let data = &data[..data.len().min(SNIFF_LEN)];
    if let Some((_, ct)) = SIGNATURES.iter().find(|(magic, _)| data.starts_with(magic)) {
        return ct;
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" {
        match &data[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wave",
            _ => {}
        }
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return "video/mp4";
    }

    let text = trim_leading_whitespace(data);
    let lower: Vec<u8> = text.iter().take(16).map(u8::to_ascii_lowercase).collect();
    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") {
        return "text/html; charset=utf-8";
    }
    if lower.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if looks_like_text(data) {
        return "text/plain; charset=utf-8";
    }
    OCTET_STREAM
}

fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

fn looks_like_text(data: &[u8]) -> bool {
    // Binary control bytes; tab, newline, form feed, carriage return and escape are text.
    !data
        .iter()
        .any(|&b| b <= 0x08 || b == 0x0B || (0x0E..=0x1A).contains(&b) || (0x1C..=0x1F).contains(&b))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("movie.MP4", Some("video/mp4"))]
    #[case("dir.v2/notes.txt", Some("text/plain; charset=utf-8"))]
    #[case("archive.tar.gz", Some("application/gzip"))]
    #[case("README", None)]
    #[case("blob.unknownext", None)]
    fn test_extension_table(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(content_type_for_name(name), expected);
    }

    #[rstest]
    #[case(b"%PDF-1.7 rest", "application/pdf")]
    #[case(b"\x89PNG\r\n\x1a\n0000", "image/png")]
    #[case(b"RIFF\x00\x00\x00\x00WEBPVP8 ", "image/webp")]
    #[case(b"\x00\x00\x00\x18ftypmp42", "video/mp4")]
    #[case(b"  <!DOCTYPE html><html>", "text/html; charset=utf-8")]
    #[case(b"hello world\n", "text/plain; charset=utf-8")]
    #[case(b"\x00\x01\x02\x03", "application/octet-stream")]
    #[case(b"", "text/plain; charset=utf-8")]
    fn test_sniff(#[case] data: &[u8], #[case] expected: &str) {
        assert_eq!(sniff(data), expected);
    }
}
