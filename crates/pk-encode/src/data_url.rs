//! Building and parsing `data:` URLs (RFC 2397).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use pk_core::CaptureError;
use pk_core::CaptureResult;

use crate::charset::TextHints;
use crate::charset::resolve_encoding;
use crate::escape::percent_decode;
use crate::escape::percent_escape;

const DATA_URL_PREFIX: &str = "data:";
const DEFAULT_MEDIA_TYPE: &str = "text/plain";
const DEFAULT_CHARSET: &str = "US-ASCII";
pub const DEFAULT_BINARY_TYPE: &str = "application/octet-stream";

/// `data:` URL of an empty HTML document, used for frame placeholders.
pub const EMPTY_DOCUMENT_DATA_URL: &str = "data:text/html;charset=utf-8;base64,";

/// Base64 `data:` URL for binary content.
pub fn binary_data_url(bytes: &[u8], mime_type: Option<&str>) -> String {
    let mime_type = mime_type
        .map(str::trim)
        .filter(|mime| !mime.is_empty())
        .unwrap_or(DEFAULT_BINARY_TYPE);
    let mut out = String::with_capacity(DATA_URL_PREFIX.len() + mime_type.len() + 8 + bytes.len() * 4 / 3 + 4);
    out.push_str(DATA_URL_PREFIX);
    out.push_str(mime_type);
    out.push_str(";base64,");
    STANDARD.encode_string(bytes, &mut out);
    out
}

/// Percent-escaped `data:` URL for text content.
///
/// UTF-8 (and plain ASCII) text is written as UTF-8. Single-byte legacy
/// encodings are copied byte for byte and keep their label. Other encodings
/// are transcoded to UTF-8.
pub fn text_data_url(bytes: &[u8], mime_type: &str, hints: &TextHints) -> String {
    let (encoding, bom_len) = resolve_encoding(bytes, hints);
    let body = &bytes[bom_len..];

    if encoding == encoding_rs::UTF_8 || body.is_ascii() {
        return format!("{DATA_URL_PREFIX}{mime_type};charset=utf-8,{}", percent_escape(body));
    }

    if encoding.is_single_byte() {
        return format!(
            "{DATA_URL_PREFIX}{mime_type};charset={},{}",
            encoding.name(),
            percent_escape(body)
        );
    }

    let (text, _) = encoding.decode_without_bom_handling(body);
    format!(
        "{DATA_URL_PREFIX}{mime_type};charset=utf-8,{}",
        percent_escape(text.as_bytes())
    )
}

/// Base64 `data:text/html` URL of an assembled document.
pub fn document_data_url(html: &str) -> String {
    let mut out = String::from(EMPTY_DOCUMENT_DATA_URL);
    STANDARD.encode_string(html.as_bytes(), &mut out);
    out
}

/// Decoded `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime_type: String,
    pub charset: Option<String>,
    pub is_base64: bool,
    pub bytes: Vec<u8>,
}

pub fn parse_data_url(url: &str) -> CaptureResult<DataUrl> {
    let rest = url
        .get(..DATA_URL_PREFIX.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(DATA_URL_PREFIX))
        .map(|_| &url[DATA_URL_PREFIX.len()..])
        .ok_or_else(|| CaptureError::new("encode.data_url.scheme", "URL does not start with 'data:'"))?;
    let (metadata, payload) = rest
        .split_once(',')
        .ok_or_else(|| CaptureError::new("encode.data_url.missing_comma", "missing comma in data URL"))?;

    let mut parts = metadata.split(';');
    let media_type = parts.next().unwrap_or_default().trim();
    let mut is_base64 = false;
    let mut charset = None;
    for param in parts.map(str::trim).filter(|param| !param.is_empty()) {
        if param.eq_ignore_ascii_case("base64") {
            is_base64 = true;
        } else if let Some((name, value)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("charset") {
                charset = Some(value.trim().to_owned());
            }
        }
    }

    let mime_type = if media_type.is_empty() {
        charset.get_or_insert_with(|| DEFAULT_CHARSET.to_owned());
        DEFAULT_MEDIA_TYPE.to_owned()
    } else {
        media_type.to_ascii_lowercase()
    };

    let bytes = if is_base64 {
        let cleaned: Vec<u8> = payload
            .bytes()
            .filter(|byte| !byte.is_ascii_whitespace())
            .collect();
        STANDARD.decode(cleaned).map_err(|error| {
            CaptureError::new("encode.data_url.base64", format!("invalid base64 payload: {error}"))
        })?
    } else {
        percent_decode(payload)?
    };

    Ok(DataUrl {
        mime_type,
        charset,
        is_base64,
        bytes,
    })
}
