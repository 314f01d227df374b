//! Character reference decoding for text and attribute values.

const NAMED: &[(&str, char)] = &[
    ("amp", '&'),
    ("lt", '<'),
    ("gt", '>'),
    ("quot", '"'),
    ("apos", '\''),
    ("nbsp", '\u{a0}'),
    ("copy", '\u{a9}'),
    ("reg", '\u{ae}'),
    ("hellip", '\u{2026}'),
    ("mdash", '\u{2014}'),
    ("ndash", '\u{2013}'),
    ("laquo", '\u{ab}'),
    ("raquo", '\u{bb}'),
];

/// Decodes numeric and common named character references. Unknown references
/// are left untouched.
pub fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_owned();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp + 1..];
        match decode_reference(candidate) {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &candidate[consumed..];
            }
            None => {
                out.push('&');
                rest = candidate;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_reference(candidate: &str) -> Option<(char, usize)> {
    let semi = candidate.find(';').filter(|&pos| pos <= 10)?;
    let body = &candidate[..semi];
    let ch = if let Some(number) = body.strip_prefix('#') {
        let code = match number.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => number.parse::<u32>().ok()?,
        };
        char::from_u32(code).unwrap_or('\u{fffd}')
    } else {
        NAMED
            .iter()
            .find(|(name, _)| *name == body)
            .map(|(_, ch)| *ch)?
    };
    Some((ch, semi + 1))
}
