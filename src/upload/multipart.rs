//! Minimal `multipart/form-data` decoder for image uploads

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";
const DEFAULT_EXTENSION: &str = "png";

/// A file part extracted from a multipart body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Lowercase extension without the dot
    pub extension: String,
    pub data: Vec<u8>,
}

/// Extract the boundary from a `Content-Type` header value.
///
/// Returns `None` unless the type is `multipart/*` with a non-empty boundary.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Split `body` on `--boundary` and return every well-formed file part.
///
/// Parts without a header/body separator or without a `filename` are
/// skipped, as are the preamble and the closing `--` marker.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Vec<UploadedFile> {
    let delimiter = format!("--{}", boundary).into_bytes();
    split_on(body, &delimiter)
        .into_iter()
        .filter_map(parse_part)
        .collect()
}

fn parse_part(part: &[u8]) -> Option<UploadedFile> {
    let preview = String::from_utf8_lossy(&part[..part.len().min(500)]);
    let trimmed = preview.trim();
    if trimmed.is_empty() || trimmed == "--" {
        return None;
    }

    let header_end = find(part, HEADER_SEPARATOR, 0)?;
    let headers = String::from_utf8_lossy(&part[..header_end]);
    let filename = header_param(&headers, "filename")?;

    let extension = extension_from_filename(&filename)
        .or_else(|| extension_from_content_type(&headers))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    let mut data = &part[header_end + HEADER_SEPARATOR.len()..];
    if data.ends_with(b"\r\n") {
        data = &data[..data.len() - 2];
    }

    Some(UploadedFile {
        extension,
        data: data.to_vec(),
    })
}

/// Value of a quoted `name="value"` parameter anywhere in the headers
fn header_param(headers: &str, name: &str) -> Option<String> {
    let needle = format!("{}=\"", name);
    let mut search_from = 0;
    while let Some(offset) = headers[search_from..].find(&needle) {
        let start = search_from + offset;
        // Reject partial matches such as `xfilename="`
        let preceded_by_word = headers[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '*');
        let value_start = start + needle.len();
        if !preceded_by_word {
            let end = headers[value_start..].find('"')?;
            let value = &headers[value_start..value_start + end];
            return (!value.is_empty()).then(|| value.to_string());
        }
        search_from = value_start;
    }
    None
}

fn extension_from_filename(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    normalize_extension(ext)
}

fn extension_from_content_type(headers: &str) -> Option<String> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("content-type") {
            return None;
        }
        let value = value.trim().to_ascii_lowercase();
        let subtype = value.strip_prefix("image/")?;
        let subtype = subtype.split(';').next().unwrap_or_default().trim();
        normalize_extension(subtype)
    })
}

/// Lowercase, `jpeg` → `jpg`, alphanumeric only
fn normalize_extension(ext: &str) -> Option<String> {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(if ext == "jpeg" { "jpg".to_string() } else { ext })
}

fn split_on<'a>(buffer: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut start = 0;
    while start < buffer.len() {
        match find(buffer, delimiter, start) {
            Some(idx) => {
                if idx > start {
                    parts.push(&buffer[start..idx]);
                }
                start = idx + delimiter.len();
            }
            None => {
                parts.push(&buffer[start..]);
                break;
            }
        }
    }
    parts
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "----airdockBoundary7MA4YWxk";

    fn part(headers: &str, data: &[u8]) -> Vec<u8> {
        let mut out = format!("--{}\r\n{}\r\n\r\n", BOUNDARY, headers).into_bytes();
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn body(parts: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(p);
        }
        out.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        out
    }

    #[test]
    fn test_single_image() {
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00];
        let raw = body(&[part(
            "Content-Disposition: form-data; name=\"image\"; filename=\"shot.PNG\"\r\nContent-Type: image/png",
            &png,
        )]);
        let files = parse_multipart(&raw, BOUNDARY);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].extension, "png");
        assert_eq!(files[0].data, png);
    }

    #[test]
    fn test_extension_from_content_type() {
        let raw = body(&[part(
            "Content-Disposition: form-data; name=\"image\"; filename=\"blob\"\r\nContent-Type: image/jpeg",
            b"jpegdata",
        )]);
        let files = parse_multipart(&raw, BOUNDARY);
        assert_eq!(files[0].extension, "jpg");
        assert_eq!(files[0].data, b"jpegdata");
    }

    #[test]
    fn test_jpeg_filename_normalized() {
        let raw = body(&[part(
            "Content-Disposition: form-data; name=\"image\"; filename=\"photo.jpeg\"",
            b"x",
        )]);
        assert_eq!(parse_multipart(&raw, BOUNDARY)[0].extension, "jpg");
    }

    #[test]
    fn test_default_extension() {
        let raw = body(&[part(
            "Content-Disposition: form-data; name=\"image\"; filename=\"noext\"",
            b"x",
        )]);
        assert_eq!(parse_multipart(&raw, BOUNDARY)[0].extension, "png");
    }

    #[test]
    fn test_suspicious_extension_falls_back() {
        let raw = body(&[part(
            "Content-Disposition: form-data; name=\"image\"; filename=\"a.png/../../x\"",
            b"x",
        )]);
        assert_eq!(parse_multipart(&raw, BOUNDARY)[0].extension, "png");
    }

    #[test]
    fn test_skips_fields_without_filename() {
        let raw = body(&[
            part("Content-Disposition: form-data; name=\"caption\"", b"hello"),
            part(
                "Content-Disposition: form-data; name=\"image\"; filename=\"a.gif\"",
                b"GIF89a",
            ),
        ]);
        let files = parse_multipart(&raw, BOUNDARY);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].extension, "gif");
    }

    #[test]
    fn test_skips_part_without_separator() {
        let mut raw = format!(
            "--{}\r\nContent-Disposition: form-data; filename=\"a.png\"\r\n",
            BOUNDARY
        )
        .into_bytes();
        raw.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        assert!(parse_multipart(&raw, BOUNDARY).is_empty());
    }

    #[test]
    fn test_binary_data_with_crlf_preserved() {
        let data = b"line1\r\n\r\nline2\r\n";
        let raw = body(&[part(
            "Content-Disposition: form-data; name=\"f\"; filename=\"a.bin\"",
            data,
        )]);
        let files = parse_multipart(&raw, BOUNDARY);
        assert_eq!(files[0].data, data);
    }

    #[test]
    fn test_multiple_files() {
        let raw = body(&[
            part("Content-Disposition: form-data; name=\"a\"; filename=\"1.png\"", b"one"),
            part("Content-Disposition: form-data; name=\"b\"; filename=\"2.webp\"", b"two"),
        ]);
        let files = parse_multipart(&raw, BOUNDARY);
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].extension, "webp");
        assert_eq!(files[1].data, b"two");
    }

    #[test]
    fn test_empty_body() {
        assert!(parse_multipart(b"", BOUNDARY).is_empty());
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; charset=utf-8; boundary=\"q b\"")
                .as_deref(),
            Some("q b")
        );
        assert!(boundary_from_content_type("multipart/form-data").is_none());
        assert!(boundary_from_content_type("application/json; boundary=x").is_none());
        assert!(boundary_from_content_type("multipart/form-data; boundary=").is_none());
    }
}
