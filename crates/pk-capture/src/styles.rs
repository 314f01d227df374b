//! Style sheet decoding and inlining.

use crate::pipeline::FrameCapture;
use pk_css::CssRefKind;
use pk_css::charset_rule;
use pk_css::inline_import;
use pk_css::rewrite;
use pk_css::scan_declarations;
use pk_css::scan_stylesheet;
use pk_css::strip_comments_preserve_strings;
use pk_css::url_token;
use pk_encode::TextHints;
use pk_encode::decode_text;
use pk_net::ResourceContent;
use pk_net::url::resolve;
use std::collections::HashSet;

/// Nesting limit for `@import` chains, both when fetching and inlining.
pub(crate) const MAX_IMPORT_DEPTH: usize = 8;

/// Decodes a fetched sheet and strips its comments.
pub(crate) fn decode_sheet(content: &ResourceContent, element_charset: Option<&str>, parent_charset: &str) -> String {
    let hints = TextHints {
        header_charset: content.charset.clone(),
        rule_charset: charset_rule(&content.bytes),
        element_charset: element_charset.map(str::to_owned),
        parent_charset: Some(parent_charset.to_owned()),
    };
    let (text, encoding) = decode_text(&content.bytes, &hints);
    tracing::trace!(target: "pagekeep::css", encoding = encoding.name(), bytes = content.bytes.len(), "sheet decoded");
    strip_comments_preserve_strings(&text)
}

impl FrameCapture<'_> {
    /// Rewrites a comment-free sheet for embedding: loaded imports are
    /// inlined (wrapped in `@media` when conditional), loaded fonts and
    /// images become data URLs, everything else becomes absolute. `key` is
    /// the sheet's own fetch URL, `None` for `<style>` text.
    pub(crate) fn process_sheet(&mut self, text: &str, base: &str, key: Option<&str>) -> String {
        let mut path: HashSet<String> = key.map(str::to_owned).into_iter().collect();
        self.process_sheet_at(text, base, &mut path, 0)
    }

    fn process_sheet_at(&mut self, text: &str, base: &str, path: &mut HashSet<String>, depth: usize) -> String {
        let refs = scan_stylesheet(text);
        rewrite(text, &refs, |_, reference| match &reference.kind {
            CssRefKind::Import { media } => {
                let key = crate::scan::fetch_key(base, &reference.url);
                // Browsers ignore an import of a sheet already being applied.
                if key.as_ref().is_some_and(|key| path.contains(key)) {
                    return Some(String::new());
                }
                let imported = key
                    .as_ref()
                    .filter(|_| depth < MAX_IMPORT_DEPTH)
                    .and_then(|key| self.sheets.get(key).cloned());
                match (key, imported) {
                    (Some(key), Some(sheet)) => {
                        path.insert(key.clone());
                        let inner = self.process_sheet_at(&sheet, &key, path, depth + 1);
                        path.remove(&key);
                        Some(inline_import(&inner, media.as_deref()))
                    }
                    _ => {
                        let target = resolve(base, &reference.url)
                            .map_or_else(|| reference.url.clone(), |url| url.to_string());
                        Some(match media {
                            Some(media) => format!("@import {} {media};", url_token(&target)),
                            None => format!("@import {};", url_token(&target)),
                        })
                    }
                }
            }
            CssRefKind::Font { .. } | CssRefKind::Image => {
                Some(url_token(&self.substitute(&reference.url, base, None).value))
            }
        })
    }

    /// Rewrites `url()`s of a `style` attribute.
    pub(crate) fn process_declarations(&mut self, style: &str, base: &str) -> String {
        let text = strip_comments_preserve_strings(style);
        let refs = scan_declarations(&text);
        if refs.is_empty() {
            return style.to_owned();
        }
        rewrite(&text, &refs, |_, reference| {
            Some(url_token(&self.substitute(&reference.url, base, None).value))
        })
    }
}
