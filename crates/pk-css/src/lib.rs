//! CSS scanning for resource discovery and inlining.
//!
//! This is not a style engine: it only understands enough structure
//! (strings, comments, blocks, `@import`, `@font-face`) to find and
//! replace the URLs a style sheet depends on.

mod refs;
mod scanner;

pub use refs::CssRefKind;
pub use refs::CssReference;
pub use refs::inline_import;
pub use refs::rewrite;
pub use refs::scan_declarations;
pub use refs::scan_stylesheet;
pub use refs::url_token;
pub use scanner::strip_comments_preserve_strings;

/// Reads the encoding label of a leading `@charset "...";` rule.
///
/// Matches the byte-exact form CSS Syntax requires, so it can run before the
/// sheet is decoded.
pub fn charset_rule(bytes: &[u8]) -> Option<String> {
    const PREFIX: &[u8] = b"@charset \"";
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let rest = bytes.strip_prefix(PREFIX)?;
    let end = rest.iter().position(|byte| *byte == b'"')?;
    if rest.get(end + 1).copied() != Some(b';') {
        return None;
    }
    let label = std::str::from_utf8(&rest[..end]).ok()?.trim();
    (!label.is_empty()).then(|| label.to_owned())
}

#[cfg(test)]
mod tests {
    use super::charset_rule;

    #[test]
    fn reads_leading_charset_rule() {
        assert_eq!(
            charset_rule(b"@charset \"windows-1252\"; body {}").as_deref(),
            Some("windows-1252")
        );
    }

    #[test]
    fn ignores_loose_or_late_charset_rules() {
        assert_eq!(charset_rule(b"@charset 'utf-8'; a{}"), None);
        assert_eq!(charset_rule(b" @charset \"utf-8\";"), None);
        assert_eq!(charset_rule(b"@charset \"utf-8\""), None);
    }
}
