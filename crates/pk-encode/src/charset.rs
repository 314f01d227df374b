//! Character-encoding cascade over already-known hints.

use encoding_rs::Encoding;
use encoding_rs::UTF_8;

/// Encoding hints in the order the cascade consults them after the BOM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextHints {
    /// `charset` parameter of the response `Content-Type`.
    pub header_charset: Option<String>,
    /// Leading `@charset` rule of a style sheet.
    pub rule_charset: Option<String>,
    /// `charset` attribute of the referencing element.
    pub element_charset: Option<String>,
    /// Encoding of the referencing document or sheet.
    pub parent_charset: Option<String>,
}

impl TextHints {
    pub fn utf8() -> Self {
        Self {
            header_charset: Some("utf-8".to_owned()),
            ..Self::default()
        }
    }
}

/// Picks the encoding for `bytes`: BOM, header, `@charset`, element attribute,
/// parent encoding, then UTF-8. Unknown labels are passed over. Returns the
/// encoding and the length of the BOM to strip.
pub fn resolve_encoding(bytes: &[u8], hints: &TextHints) -> (&'static Encoding, usize) {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        return (encoding, bom_len);
    }

    let encoding = [
        &hints.header_charset,
        &hints.rule_charset,
        &hints.element_charset,
        &hints.parent_charset,
    ]
    .into_iter()
    .flatten()
    .find_map(|label| Encoding::for_label(label.trim().as_bytes()))
    .unwrap_or(UTF_8);

    // A label naming UTF-16 without a BOM is treated as UTF-8 by browsers.
    let encoding = encoding.output_encoding();
    (encoding, 0)
}

/// Decodes text with the cascade, replacing malformed sequences.
pub fn decode_text(bytes: &[u8], hints: &TextHints) -> (String, &'static Encoding) {
    let (encoding, bom_len) = resolve_encoding(bytes, hints);
    let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
    (text.into_owned(), encoding)
}

/// Extracts the `charset` parameter of a `Content-Type` value.
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches(['"', '\'']);
        (!value.is_empty()).then(|| value.to_owned())
    })
}
