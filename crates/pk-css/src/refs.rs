//! Reference discovery and rewriting for style sheets and inline styles.

use std::ops::Range;

use crate::scanner::find_matching_brace;
use crate::scanner::find_top_level;
use crate::scanner::find_top_level_open_brace;
use crate::scanner::skip_rule_separators;
use crate::scanner::split_top_level;
use crate::scanner::starts_with_ignore_ascii_case;

/// What a URL inside CSS points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CssRefKind {
    /// `@import` rule; the span covers the whole rule including `;`.
    Import { media: Option<String> },
    /// `url()` inside an `@font-face` `src` descriptor.
    Font { format: Option<String> },
    /// Any other `url()` token.
    Image,
}

/// One URL occurrence with the byte span to replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssReference {
    pub kind: CssRefKind,
    pub url: String,
    pub span: Range<usize>,
}

impl CssReference {
    pub fn is_import(&self) -> bool {
        matches!(self.kind, CssRefKind::Import { .. })
    }

    /// True for WOFF/WOFF2 fonts, judged by `format()` hint then extension.
    pub fn is_woff_font(&self) -> bool {
        let CssRefKind::Font { format } = &self.kind else {
            return false;
        };
        if let Some(format) = format {
            let format = format.to_ascii_lowercase();
            return format == "woff" || format == "woff2";
        }
        let path = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        path.ends_with(".woff") || path.ends_with(".woff2")
    }
}

/// Collects every reference in a style sheet in source order.
///
/// Expects comment-free input (see [`crate::strip_comments_preserve_strings`]);
/// spans index into that text. Malformed rules are skipped.
pub fn scan_stylesheet(css: &str) -> Vec<CssReference> {
    let mut refs = Vec::new();
    scan_rules(css, 0, css.len(), &mut refs);
    refs
}

/// Collects `url()` references in a declaration list such as a `style`
/// attribute.
pub fn scan_declarations(css: &str) -> Vec<CssReference> {
    let mut refs = Vec::new();
    collect_urls(css, 0, css.len(), &mut refs, |_| CssRefKind::Image);
    refs
}

fn scan_rules(css: &str, from: usize, to: usize, refs: &mut Vec<CssReference>) {
    let mut cursor = from;
    loop {
        cursor = skip_rule_separators(css, cursor);
        if cursor >= to {
            return;
        }

        if starts_with_ignore_ascii_case(css, cursor, "@import") {
            let end = find_top_level(css, cursor, |byte| byte == b';')
                .map(|idx| idx.min(to))
                .unwrap_or(to);
            match parse_import(&css[cursor + "@import".len()..end]) {
                Some((url, media)) => refs.push(CssReference {
                    kind: CssRefKind::Import { media },
                    url,
                    span: cursor..(end + 1).min(to),
                }),
                None => tracing::debug!(
                    target: "pagekeep::css",
                    rule = &css[cursor..end],
                    "skipping malformed @import"
                ),
            }
            cursor = end.saturating_add(1);
            continue;
        }

        let Some(open) = find_top_level_open_brace(css, cursor).filter(|&open| open < to) else {
            // Statement at-rule (`@charset`, `@namespace`) or trailing junk.
            match find_top_level(css, cursor, |byte| byte == b';') {
                Some(end) if end < to => {
                    cursor = end.saturating_add(1);
                    continue;
                }
                _ => {
                    if !css[cursor..to].trim().is_empty() {
                        tracing::debug!(
                            target: "pagekeep::css",
                            rule = css[cursor..to].trim(),
                            "skipping unterminated rule"
                        );
                    }
                    return;
                }
            }
        };
        let Some(close) = find_matching_brace(css, open).filter(|&close| close < to) else {
            tracing::debug!(
                target: "pagekeep::css",
                prelude = css[cursor..open].trim(),
                "skipping rule without closing brace"
            );
            collect_urls(css, open, to, refs, |_| CssRefKind::Image);
            return;
        };

        let prelude = css[cursor..open].trim().to_ascii_lowercase();
        if prelude.starts_with("@font-face") {
            scan_font_face(css, open + 1, close, refs);
        } else if is_grouping_at_rule(&prelude) {
            scan_rules(css, open + 1, close, refs);
        } else {
            collect_urls(css, open + 1, close, refs, |_| CssRefKind::Image);
        }
        cursor = close + 1;
    }
}

fn scan_font_face(css: &str, from: usize, to: usize, refs: &mut Vec<CssReference>) {
    for (offset, declaration) in split_top_level(&css[from..to], b';') {
        let Some((name, _)) = declaration.split_once(':') else {
            continue;
        };
        let start = from + offset;
        let end = start + declaration.len();
        if name.trim().eq_ignore_ascii_case("src") {
            for (part_offset, source) in split_top_level(declaration, b',') {
                let format = format_hint(source);
                let part_start = start + part_offset;
                collect_urls(css, part_start, part_start + source.len(), refs, |_| {
                    CssRefKind::Font {
                        format: format.clone(),
                    }
                });
            }
        } else {
            collect_urls(css, start, end, refs, |_| CssRefKind::Image);
        }
    }
}

fn format_hint(source: &str) -> Option<String> {
    let lower = source.to_ascii_lowercase();
    let idx = lower.find("format(")?;
    let rest = &source[idx + "format(".len()..];
    let close = rest.find(')')?;
    Some(unquote(rest[..close].trim()).to_owned())
}

fn is_grouping_at_rule(prelude: &str) -> bool {
    ["@media", "@supports", "@layer", "@document", "@-moz-document", "@container"]
        .iter()
        .any(|at| prelude.starts_with(at))
}

fn parse_import(rest: &str) -> Option<(String, Option<String>)> {
    let rest = rest.trim_start();
    let (url, after) = if starts_with_ignore_ascii_case(rest, 0, "url(") {
        let close = find_top_level(rest, 4, |byte| byte == b')')?;
        (unquote(rest[4..close].trim()).to_owned(), &rest[close + 1..])
    } else {
        let quote = rest.chars().next().filter(|ch| *ch == '"' || *ch == '\'')?;
        let close = rest[1..].find(quote)? + 1;
        (rest[1..close].to_owned(), &rest[close + 1..])
    };
    if url.is_empty() {
        return None;
    }
    let media = Some(after.trim().to_owned()).filter(|media| !media.is_empty());
    Some((url, media))
}

fn collect_urls(
    css: &str,
    from: usize,
    to: usize,
    refs: &mut Vec<CssReference>,
    kind: impl Fn(&str) -> CssRefKind,
) {
    let bytes = css.as_bytes();
    let mut idx = from;
    while idx < to {
        match bytes[idx] {
            quote @ (b'"' | b'\'') => {
                idx = skip_string(bytes, idx, quote).min(to);
                continue;
            }
            b'u' | b'U'
                if starts_with_ignore_ascii_case(css, idx, "url(")
                    && !is_ident_byte(idx.checked_sub(1).and_then(|prev| bytes.get(prev).copied())) =>
            {
                let Some(close) = find_top_level(css, idx + 4, |byte| byte == b')').filter(|&c| c < to)
                else {
                    return;
                };
                let url = unquote(css[idx + 4..close].trim());
                if !url.is_empty() {
                    refs.push(CssReference {
                        kind: kind(url),
                        url: url.to_owned(),
                        span: idx..close + 1,
                    });
                }
                idx = close + 1;
                continue;
            }
            _ => {}
        }
        idx = idx.saturating_add(1);
    }
}

fn skip_string(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut idx = open.saturating_add(1);
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => idx = idx.saturating_add(2),
            byte if byte == quote => return idx.saturating_add(1),
            _ => idx = idx.saturating_add(1),
        }
    }
    bytes.len()
}

fn is_ident_byte(byte: Option<u8>) -> bool {
    byte.is_some_and(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

fn unquote(value: &str) -> &str {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    trimmed
}

/// Rebuilds `css`, replacing the span of each reference for which
/// `replacement` returns text. `refs` must be in source order.
pub fn rewrite(
    css: &str,
    refs: &[CssReference],
    mut replacement: impl FnMut(usize, &CssReference) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(css.len());
    let mut cursor = 0_usize;
    for (position, reference) in refs.iter().enumerate() {
        if reference.span.start < cursor || reference.span.end > css.len() {
            continue;
        }
        let Some(text) = replacement(position, reference) else {
            continue;
        };
        out.push_str(&css[cursor..reference.span.start]);
        out.push_str(&text);
        cursor = reference.span.end;
    }
    out.push_str(&css[cursor..]);
    out
}

/// Formats a `url()` token for `value`.
pub fn url_token(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 7);
    out.push_str("url(\"");
    for ch in value.chars() {
        match ch {
            '"' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            '\n' => out.push_str("\\a "),
            _ => out.push(ch),
        }
    }
    out.push_str("\")");
    out
}

/// Text that replaces an `@import` rule once the imported sheet is inlined.
pub fn inline_import(sheet: &str, media: Option<&str>) -> String {
    match media {
        Some(media) => format!("@media {media} {{\n{sheet}\n}}"),
        None => format!("{sheet}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::CssRefKind;
    use super::inline_import;
    use super::rewrite;
    use super::scan_declarations;
    use super::scan_stylesheet;
    use super::url_token;

    #[test]
    fn finds_imports_with_media() {
        let css = "@import url(\"a.css\") screen;\n@import 'b.css';\nbody{}";
        let refs = scan_stylesheet(css);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].url, "a.css");
        assert_eq!(
            refs[0].kind,
            CssRefKind::Import {
                media: Some("screen".to_owned())
            }
        );
        assert_eq!(&css[refs[0].span.clone()], "@import url(\"a.css\") screen;");
        assert_eq!(refs[1].kind, CssRefKind::Import { media: None });
    }

    #[test]
    fn separates_fonts_from_images() {
        let css = "@font-face { font-family: X; src: url(x.woff2) format('woff2'), url(x.ttf); }\n\
                   @media print { .a { background: url('bg.png') } }\n\
                   .b::before { content: 'url(no.png)'; }";
        let refs = scan_stylesheet(css);
        let summary: Vec<_> = refs
            .iter()
            .map(|r| (r.url.as_str(), r.is_woff_font(), matches!(r.kind, CssRefKind::Image)))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("x.woff2", true, false),
                ("x.ttf", false, false),
                ("bg.png", false, true),
            ]
        );
    }

    #[test]
    fn skips_malformed_rules_without_failing() {
        let refs = scan_stylesheet("@import ;\n.a { background: url(a.png) }\n.b { oops");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].url, "a.png");
    }

    #[test]
    fn inline_style_urls_are_images() {
        let refs = scan_declarations("background-image: URL( \"a b.png\" ), url(c.png)");
        let urls: Vec<_> = refs.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["a b.png", "c.png"]);
    }

    #[test]
    fn rewrites_only_selected_spans() {
        let css = "@import 'a.css' print; .x { background: url(x.png) } .y { background: url(y.png) }";
        let refs = scan_stylesheet(css);
        let out = rewrite(css, &refs, |_, reference| match reference.url.as_str() {
            "a.css" => Some(inline_import(".a{}", Some("print"))),
            "x.png" => Some(url_token("data:image/png;base64,AA==")),
            _ => None,
        });
        assert_eq!(
            out,
            "@media print {\n.a{}\n} .x { background: url(\"data:image/png;base64,AA==\") } .y { background: url(y.png) }"
        );
    }
}
