//! String- and comment-aware scanning primitives.

/// Tracks whether the cursor sits inside a quoted string.
#[derive(Debug, Default, Clone, Copy)]
struct Quotes {
    in_single: bool,
    in_double: bool,
    escape: bool,
}

impl Quotes {
    /// Feeds one byte; returns true when the byte belongs to a string.
    fn consume(&mut self, byte: u8) -> bool {
        if self.in_single || self.in_double {
            let closing = if self.in_single { b'\'' } else { b'"' };
            if !self.escape && byte == b'\\' {
                self.escape = true;
            } else if !self.escape && byte == closing {
                self.in_single = false;
                self.in_double = false;
            } else {
                self.escape = false;
            }
            return true;
        }
        match byte {
            b'\'' => {
                self.in_single = true;
                true
            }
            b'"' => {
                self.in_double = true;
                true
            }
            _ => false,
        }
    }
}

pub fn strip_comments_preserve_strings(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut idx = 0_usize;
    let mut out = Vec::with_capacity(input.len());
    let mut quotes = Quotes::default();

    while idx < bytes.len() {
        let byte = bytes[idx];
        let next = bytes.get(idx.saturating_add(1)).copied();

        if quotes.consume(byte) {
            out.push(byte);
            idx = idx.saturating_add(1);
            continue;
        }

        if byte == b'/' && next == Some(b'*') {
            idx = find_comment_end(bytes, idx.saturating_add(2));
            continue;
        }

        out.push(byte);
        idx = idx.saturating_add(1);
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn find_comment_end(bytes: &[u8], mut idx: usize) -> usize {
    while idx < bytes.len() {
        if bytes[idx] == b'*' && bytes.get(idx.saturating_add(1)).copied() == Some(b'/') {
            return idx.saturating_add(2);
        }
        idx = idx.saturating_add(1);
    }
    bytes.len()
}

pub(crate) fn find_top_level_open_brace(input: &str, from: usize) -> Option<usize> {
    find_top_level(input, from, |byte| byte == b'{' || byte == b';')
        .filter(|&idx| input.as_bytes().get(idx).copied() == Some(b'{'))
}

/// First top-level (outside strings, parentheses and brackets) byte at or
/// after `from` that satisfies `stop`.
pub(crate) fn find_top_level(input: &str, from: usize, stop: impl Fn(u8) -> bool) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut idx = from;
    let mut quotes = Quotes::default();
    let mut paren_depth = 0_u32;
    let mut bracket_depth = 0_u32;

    while idx < bytes.len() {
        let byte = bytes[idx];
        if quotes.consume(byte) {
            idx = idx.saturating_add(1);
            continue;
        }

        match byte {
            b'(' => paren_depth = paren_depth.saturating_add(1),
            b')' => paren_depth = paren_depth.saturating_sub(1),
            b'[' => bracket_depth = bracket_depth.saturating_add(1),
            b']' => bracket_depth = bracket_depth.saturating_sub(1),
            _ if paren_depth == 0 && bracket_depth == 0 && stop(byte) => return Some(idx),
            _ => {}
        }

        idx = idx.saturating_add(1);
    }

    None
}

pub(crate) fn find_matching_brace(input: &str, open_brace: usize) -> Option<usize> {
    let bytes = input.as_bytes();
    if bytes.get(open_brace).copied() != Some(b'{') {
        return None;
    }

    let mut idx = open_brace.saturating_add(1);
    let mut quotes = Quotes::default();
    let mut depth = 1_u32;

    while idx < bytes.len() {
        let byte = bytes[idx];
        if quotes.consume(byte) {
            idx = idx.saturating_add(1);
            continue;
        }

        match byte {
            b'{' => depth = depth.saturating_add(1),
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }

        idx = idx.saturating_add(1);
    }

    None
}

/// Splits on `delimiter` outside strings, parentheses and brackets, returning
/// each part with its byte offset.
pub(crate) fn split_top_level(input: &str, delimiter: u8) -> Vec<(usize, &str)> {
    let mut parts = Vec::new();
    let mut start = 0_usize;
    while let Some(idx) = find_top_level(input, start, |byte| byte == delimiter) {
        parts.push((start, &input[start..idx]));
        start = idx.saturating_add(1);
    }
    parts.push((start, &input[start..]));
    parts
}

pub(crate) fn skip_rule_separators(input: &str, mut idx: usize) -> usize {
    let bytes = input.as_bytes();
    while idx < bytes.len() {
        let byte = bytes[idx];
        if byte.is_ascii_whitespace() || byte == b';' {
            idx = idx.saturating_add(1);
            continue;
        }
        break;
    }

    idx
}

pub(crate) fn starts_with_ignore_ascii_case(input: &str, idx: usize, pattern: &str) -> bool {
    input
        .as_bytes()
        .get(idx..idx.saturating_add(pattern.len()))
        .is_some_and(|window| window.eq_ignore_ascii_case(pattern.as_bytes()))
}
