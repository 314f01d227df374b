//! Percent-escaping and literal markup escaping.

use pk_core::CaptureError;
use pk_core::CaptureResult;

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Bytes left as-is, matching `encodeURIComponent`.
fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')')
}

pub fn percent_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        if is_unreserved(byte) {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push(char::from(HEX[usize::from(byte >> 4)]));
            out.push(char::from(HEX[usize::from(byte & 0x0F)]));
        }
    }
    out
}

/// Percent-decodes without treating `+` specially.
pub fn percent_decode(input: &str) -> CaptureResult<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0_usize;
    while idx < bytes.len() {
        if bytes[idx] != b'%' {
            out.push(bytes[idx]);
            idx += 1;
            continue;
        }
        let high = bytes.get(idx + 1).and_then(|byte| char::from(*byte).to_digit(16));
        let low = bytes.get(idx + 2).and_then(|byte| char::from(*byte).to_digit(16));
        match (high, low) {
            (Some(high), Some(low)) => {
                out.push(((high << 4) | low) as u8);
                idx += 3;
            }
            _ => {
                return Err(CaptureError::new(
                    "encode.percent.invalid_escape",
                    format!("invalid percent-escape at byte {idx}"),
                ));
            }
        }
    }
    Ok(out)
}

/// Escapes markup for embedding as a literal `srcdoc` attribute value.
pub fn escape_srcdoc(html: &str) -> String {
    html.replace('&', "&amp;").replace('"', "&quot;")
}
