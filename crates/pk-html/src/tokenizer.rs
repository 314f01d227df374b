//! Byte-level scanning helpers for the tree builder.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedTag {
    pub name: String,
    pub raw_name: String,
    pub attributes: Vec<(String, String)>,
    pub is_end: bool,
    pub self_closing: bool,
}

/// Parses a start or end tag at `start`. Returns `None` when the `<` does not
/// open a tag, in which case callers treat it as text.
pub(crate) fn parse_tag(input: &str, start: usize) -> Option<(ParsedTag, usize)> {
    let bytes = input.as_bytes();
    if bytes.get(start).copied() != Some(b'<') {
        return None;
    }

    let mut idx = start.saturating_add(1);
    let mut is_end = false;
    if bytes.get(idx).copied() == Some(b'/') {
        is_end = true;
        idx = idx.saturating_add(1);
    }

    if !bytes.get(idx).is_some_and(u8::is_ascii_alphabetic) {
        return None;
    }
    let name_start = idx;
    while idx < bytes.len() && is_tag_name_char(bytes[idx]) {
        idx = idx.saturating_add(1);
    }

    let raw_name = input.get(name_start..idx)?.to_owned();
    let mut tag = ParsedTag {
        name: raw_name.to_ascii_lowercase(),
        raw_name,
        attributes: Vec::new(),
        is_end,
        self_closing: false,
    };

    loop {
        idx = skip_spaces(bytes, idx);
        match bytes.get(idx).copied() {
            None => return None,
            Some(b'>') => return Some((tag, idx.saturating_add(1))),
            Some(b'/') => {
                idx = idx.saturating_add(1);
                if bytes.get(idx).copied() == Some(b'>') {
                    tag.self_closing = true;
                    return Some((tag, idx.saturating_add(1)));
                }
            }
            Some(_) => {
                let (attribute, next) = parse_attribute(input, idx)?;
                if !tag.is_end
                    && !attribute.0.is_empty()
                    && !tag
                        .attributes
                        .iter()
                        .any(|(name, _)| name.eq_ignore_ascii_case(&attribute.0))
                {
                    tag.attributes.push(attribute);
                }
                idx = next;
            }
        }
    }
}

fn parse_attribute(input: &str, start: usize) -> Option<((String, String), usize)> {
    let bytes = input.as_bytes();
    let mut idx = start;
    while idx < bytes.len()
        && !matches!(bytes[idx], b'=' | b'>' | b'/')
        && !bytes[idx].is_ascii_whitespace()
    {
        idx = idx.saturating_add(1);
    }
    if idx == start {
        // Stray `=`: consume it and produce an unnamed attribute.
        return Some(((String::new(), String::new()), start.saturating_add(1)));
    }
    let name = input.get(start..idx)?.to_owned();

    let after_name = skip_spaces(bytes, idx);
    if bytes.get(after_name).copied() != Some(b'=') {
        return Some(((name, String::new()), idx));
    }

    let value_start = skip_spaces(bytes, after_name.saturating_add(1));
    match bytes.get(value_start).copied() {
        Some(quote @ (b'"' | b'\'')) => {
            let body = value_start.saturating_add(1);
            let end = find_byte(bytes, body, quote)?;
            Some(((name, input.get(body..end)?.to_owned()), end.saturating_add(1)))
        }
        Some(_) => {
            let mut end = value_start;
            while end < bytes.len() && bytes[end] != b'>' && !bytes[end].is_ascii_whitespace() {
                end = end.saturating_add(1);
            }
            Some(((name, input.get(value_start..end)?.to_owned()), end))
        }
        None => None,
    }
}

pub(crate) fn read_raw_text_until_end_tag<'a>(
    input: &'a str,
    start: usize,
    tag_name: &str,
) -> (&'a str, usize) {
    let bytes = input.as_bytes();
    let tag_bytes = tag_name.as_bytes();
    let mut idx = start;

    while idx < bytes.len() {
        if bytes[idx] == b'<'
            && bytes.get(idx.saturating_add(1)).copied() == Some(b'/')
            && starts_with_ignore_ascii_case(bytes, idx.saturating_add(2), tag_bytes)
            && tag_name_boundary(bytes, idx.saturating_add(2 + tag_bytes.len()))
        {
            let end = skip_to_gt(bytes, idx.saturating_add(2));
            return (input.get(start..idx).unwrap_or(""), end);
        }

        idx = idx.saturating_add(1);
    }

    (input.get(start..).unwrap_or(""), bytes.len())
}

pub(crate) fn skip_comment(bytes: &[u8], start: usize) -> usize {
    find_subslice(bytes, start.saturating_add(4), b"-->")
        .map(|end| end.saturating_add(3))
        .unwrap_or(bytes.len())
}

pub(crate) fn skip_processing_instruction(bytes: &[u8], start: usize) -> usize {
    if let Some(end) = find_subslice(bytes, start.saturating_add(2), b"?>") {
        return end.saturating_add(2);
    }

    skip_to_gt(bytes, start.saturating_add(2))
}

pub(crate) fn skip_to_gt(bytes: &[u8], mut idx: usize) -> usize {
    while idx < bytes.len() {
        if bytes[idx] == b'>' {
            return idx.saturating_add(1);
        }
        idx = idx.saturating_add(1);
    }

    bytes.len()
}

fn tag_name_boundary(bytes: &[u8], idx: usize) -> bool {
    match bytes.get(idx).copied() {
        None => true,
        Some(byte) => byte.is_ascii_whitespace() || byte == b'>' || byte == b'/',
    }
}

fn skip_spaces(bytes: &[u8], mut idx: usize) -> usize {
    while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
        idx = idx.saturating_add(1);
    }
    idx
}

fn is_tag_name_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b':')
}

pub(crate) fn starts_with(bytes: &[u8], idx: usize, pattern: &[u8]) -> bool {
    let end = idx.saturating_add(pattern.len());
    end <= bytes.len() && bytes[idx..end] == *pattern
}

pub(crate) fn starts_with_ignore_ascii_case(bytes: &[u8], idx: usize, pattern: &[u8]) -> bool {
    let end = idx.saturating_add(pattern.len());
    if end > bytes.len() {
        return false;
    }

    bytes[idx..end]
        .iter()
        .zip(pattern.iter())
        .all(|(left, right)| left.eq_ignore_ascii_case(right))
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }

    bytes[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

pub(crate) fn find_byte(bytes: &[u8], from: usize, byte: u8) -> Option<usize> {
    bytes
        .get(from..)?
        .iter()
        .position(|candidate| *candidate == byte)
        .map(|offset| from + offset)
}

#[cfg(test)]
mod tests {
    use super::parse_tag;
    use super::read_raw_text_until_end_tag;

    #[test]
    fn parses_quoted_unquoted_and_boolean_attributes() {
        let input = "<INPUT type=checkbox checked value=\"a b\" data-x='1'>";
        let parsed = parse_tag(input, 0);
        assert!(parsed.is_some());
        let (tag, next) = parsed.unwrap_or_else(|| unreachable!());
        assert_eq!(tag.name, "input");
        assert_eq!(next, input.len());
        assert_eq!(
            tag.attributes,
            vec![
                ("type".to_owned(), "checkbox".to_owned()),
                ("checked".to_owned(), String::new()),
                ("value".to_owned(), "a b".to_owned()),
                ("data-x".to_owned(), "1".to_owned()),
            ]
        );
    }

    #[test]
    fn detects_self_closing_and_end_tags() {
        let (tag, _) = parse_tag("<br/>", 0).unwrap_or_else(|| unreachable!());
        assert!(tag.self_closing);
        let (tag, _) = parse_tag("</DIV >", 0).unwrap_or_else(|| unreachable!());
        assert!(tag.is_end);
        assert_eq!(tag.name, "div");
    }

    #[test]
    fn rejects_non_tags() {
        assert!(parse_tag("< 2", 0).is_none());
        assert!(parse_tag("<", 0).is_none());
        assert!(parse_tag("<a href='unterminated", 0).is_none());
    }

    #[test]
    fn raw_text_stops_at_matching_end_tag_only() {
        let input = "<script>a = '</scripts>';</SCRIPT>tail";
        let (raw, next) = read_raw_text_until_end_tag(input, 8, "script");
        assert_eq!(raw, "a = '</scripts>';");
        assert_eq!(&input[next..], "tail");
    }
}
