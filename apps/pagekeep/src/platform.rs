//! A saved snapshot file standing in for a live browser tab.

use async_trait::async_trait;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use pk_core::TabId;
use pk_dom::Document;
use pk_encode::TextHints;
use pk_encode::decode_text;
use pk_html::HtmlParser;
use pk_session::PagePlatform;
use std::path::Path;
use std::sync::Arc;
use url::Url;

const CHARSET_PREFIX_BYTES: usize = 8192;

pub(crate) struct FileSnapshot {
    url: String,
    document: Arc<Document>,
}

impl FileSnapshot {
    /// Reads `path`; `url` defaults to the file's own `file://` address.
    pub(crate) fn load(path: &Path, url: Option<&str>) -> CaptureResult<Self> {
        let bytes = std::fs::read(path).map_err(|error| {
            CaptureError::new(
                "app.input.read_failed",
                format!("cannot read {}: {error}", path.display()),
            )
        })?;
        let url = match url {
            Some(url) => url.to_owned(),
            None => file_url(path)?,
        };
        Ok(Self::from_bytes(&bytes, &url))
    }

    pub(crate) fn from_bytes(bytes: &[u8], url: &str) -> Self {
        let hints = TextHints {
            header_charset: charset_from_html_prefix(bytes),
            ..TextHints::default()
        };
        let (html, encoding) = decode_text(bytes, &hints);
        tracing::debug!(target: "pagekeep::app", url, encoding = encoding.name(), "snapshot decoded");
        Self {
            url: url.to_owned(),
            document: Arc::new(HtmlParser.parse(&html, url)),
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn title(&self) -> String {
        self.document
            .find_html("title")
            .map(|id| {
                self.document
                    .text_content(id)
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default()
    }

    /// The snapshot is itself a saved page (it carries page-info metadata).
    pub(crate) fn is_saved_page(&self) -> bool {
        self.document.elements().any(|(_, element)| {
            element.is_html("meta")
                && element
                    .attr("name")
                    .is_some_and(|name| name.eq_ignore_ascii_case("savepage-url"))
        })
    }
}

#[async_trait]
impl PagePlatform for FileSnapshot {
    async fn inject_capture(&self, tab: TabId) -> CaptureResult<()> {
        tracing::debug!(target: "pagekeep::app", %tab, "snapshot needs no capture script");
        Ok(())
    }

    async fn load_lazy_content(&self, tab: TabId) -> CaptureResult<()> {
        tracing::info!(target: "pagekeep::app", %tab, "static snapshot has no lazy content to load");
        Ok(())
    }

    async fn snapshot(&self, _tab: TabId) -> CaptureResult<Arc<Document>> {
        Ok(Arc::clone(&self.document))
    }
}

fn file_url(path: &Path) -> CaptureResult<String> {
    let absolute = std::fs::canonicalize(path).map_err(|error| {
        CaptureError::new(
            "app.input.bad_path",
            format!("cannot resolve {}: {error}", path.display()),
        )
    })?;
    Url::from_file_path(&absolute)
        .map(String::from)
        .map_err(|()| CaptureError::new("app.input.bad_path", format!("{} is not absolute", absolute.display())))
}

/// First `charset=` label in the leading bytes of a document.
fn charset_from_html_prefix(body: &[u8]) -> Option<String> {
    let prefix = String::from_utf8_lossy(&body[..body.len().min(CHARSET_PREFIX_BYTES)]);
    let lower = prefix.to_ascii_lowercase();
    let mut search_start = 0;
    while let Some(relative) = lower[search_start..].find("charset=") {
        let label_start = search_start + relative + "charset=".len();
        if let Some(label) = charset_label(&prefix[label_start..]) {
            return Some(label);
        }
        search_start = label_start;
    }
    None
}

fn charset_label(input: &str) -> Option<String> {
    let trimmed = input.trim_start();
    let first = trimmed.chars().next()?;
    let label = if first == '"' || first == '\'' {
        let rest = &trimmed[1..];
        &rest[..rest.find(first)?]
    } else {
        let end = trimmed
            .find(|ch: char| ch.is_whitespace() || matches!(ch, '"' | '\'' | ';' | '>' | '/'))
            .unwrap_or(trimmed.len());
        &trimmed[..end]
    };
    let label = label.trim();
    (!label.is_empty()).then(|| label.to_owned())
}

#[cfg(test)]
mod tests {
    use super::FileSnapshot;
    use super::charset_from_html_prefix;

    #[test]
    fn sniffs_meta_charsets() {
        assert_eq!(
            charset_from_html_prefix(b"<meta charset=\"windows-1252\">").as_deref(),
            Some("windows-1252")
        );
        assert_eq!(
            charset_from_html_prefix(b"<meta http-equiv=Content-Type content=\"text/html; charset=ISO-8859-1\">")
                .as_deref(),
            Some("ISO-8859-1")
        );
        assert_eq!(charset_from_html_prefix(b"<p>no declaration</p>"), None);
    }

    #[test]
    fn legacy_snapshots_decode_with_their_declared_charset() {
        let snapshot = FileSnapshot::from_bytes(
            b"<html><head><meta charset=\"windows-1252\"><title>Caf\xE9  menu</title></head></html>",
            "https://a.example/",
        );
        assert_eq!(snapshot.title(), "Caf\u{e9} menu");
        assert!(!snapshot.is_saved_page());
    }

    #[test]
    fn recognises_saved_pages() {
        let snapshot = FileSnapshot::from_bytes(
            b"<html><head><meta name=\"savepage-url\" content=\"https://a.example/\"></head></html>",
            "file:///tmp/saved.html",
        );
        assert!(snapshot.is_saved_page());
        assert_eq!(snapshot.url(), "file:///tmp/saved.html");
    }
}
