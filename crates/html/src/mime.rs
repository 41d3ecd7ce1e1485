//! Response sniffing.
//!
//! Navigations always run the HTML parser; non-HTML payloads are
//! wrapped in synthetic markup first so the page still ends up with a
//! html/head/body skeleton.

use url::Url;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Text,
    Image,
    /// Source-shaped text (JSON, scripts) shown preformatted.
    Pre,
    /// Binary we cannot render.
    Raw,
}

/// Classify a response from its declared type and first chunk.
pub fn sniff(first_chunk: &[u8], content_type: Option<&str>) -> ContentKind {
    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or(ct).trim();
        match ct {
            "text/html" | "application/xhtml+xml" => return ContentKind::Html,
            "application/json" | "text/javascript" | "application/javascript" => {
                return ContentKind::Pre;
            }
            _ => {
                if ct.starts_with("image/") {
                    return ContentKind::Image;
                }
                if ct.starts_with("text/") {
                    return ContentKind::Text;
                }
            }
        }
    }
    sniff_bytes(first_chunk)
}

fn sniff_bytes(chunk: &[u8]) -> ContentKind {
    if chunk.starts_with(&[0x89, b'P', b'N', b'G'])
        || chunk.starts_with(&[0xFF, 0xD8, 0xFF])
        || chunk.starts_with(b"GIF8")
    {
        return ContentKind::Image;
    }
    let head = &chunk[..chunk.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with('<') {
        return ContentKind::Html;
    }
    if head.iter().any(|&b| b == 0) {
        return ContentKind::Raw;
    }
    ContentKind::Text
}

/// Produce the markup the parser should actually run over.
pub fn wrap_for_parser(kind: ContentKind, body: &[u8], url: &Url) -> String {
    match kind {
        ContentKind::Html => String::from_utf8_lossy(body).into_owned(),
        ContentKind::Text | ContentKind::Pre => {
            let mut out = String::from("<html><head></head><body><pre>");
            for c in String::from_utf8_lossy(body).chars() {
                match c {
                    '&' => out.push_str("&amp;"),
                    '<' => out.push_str("&lt;"),
                    '>' => out.push_str("&gt;"),
                    _ => out.push(c),
                }
            }
            out.push_str("</pre></body></html>");
            out
        }
        ContentKind::Image => format!(
            "<html><head></head><body><img src=\"{}\"></body></html>",
            url.as_str()
        ),
        ContentKind::Raw => String::from("<html><head></head><body></body></html>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_wins() {
        assert_eq!(sniff(b"{}", Some("text/html")), ContentKind::Html);
        assert_eq!(sniff(b"{}", Some("application/json")), ContentKind::Pre);
        assert_eq!(sniff(b"", Some("image/png")), ContentKind::Image);
        assert_eq!(sniff(b"x", Some("text/plain")), ContentKind::Text);
    }

    #[test]
    fn bytes_sniffing_fallback() {
        assert_eq!(sniff(b"  <html>", None), ContentKind::Html);
        assert_eq!(sniff(b"plain words", None), ContentKind::Text);
        assert_eq!(sniff(&[0x89, b'P', b'N', b'G', 0, 0], None), ContentKind::Image);
        assert_eq!(sniff(&[1, 0, 2, 0], None), ContentKind::Raw);
    }

    #[test]
    fn text_wraps_escaped_in_pre() {
        let url = Url::parse("http://t/f.txt").expect("url");
        let html = wrap_for_parser(ContentKind::Text, b"1 < 2", &url);
        assert!(html.contains("<pre>1 &lt; 2</pre>"));
    }
}
