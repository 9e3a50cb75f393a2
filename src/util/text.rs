use std::borrow::Cow;

use quick_xml::escape::resolve_html5_entity;

/// Names recognised without a terminating `;`, as in the HTML5 legacy set.
const LEGACY_ENTITIES: &[&str] = &[
    "AElig", "AMP", "Aacute", "Acirc", "Agrave", "Aring", "Atilde", "Auml", "COPY", "Ccedil",
    "ETH", "Eacute", "Ecirc", "Egrave", "Euml", "GT", "Iacute", "Icirc", "Igrave", "Iuml", "LT",
    "Ntilde", "Oacute", "Ocirc", "Ograve", "Oslash", "Otilde", "Ouml", "QUOT", "REG", "THORN",
    "Uacute", "Ucirc", "Ugrave", "Uuml", "Yacute", "aacute", "acirc", "acute", "aelig",
    "agrave", "amp", "aring", "atilde", "auml", "brvbar", "ccedil", "cedil", "cent", "copy",
    "curren", "deg", "divide", "eacute", "ecirc", "egrave", "eth", "euml", "frac12", "frac14",
    "frac34", "gt", "iacute", "icirc", "iexcl", "igrave", "iquest", "iuml", "laquo", "lt",
    "macr", "micro", "middot", "nbsp", "not", "ntilde", "oacute", "ocirc", "ograve", "ordf",
    "ordm", "oslash", "otilde", "ouml", "para", "plusmn", "pound", "quot", "raquo", "reg",
    "sect", "shy", "sup1", "sup2", "sup3", "szlig", "thorn", "times", "uacute", "ucirc",
    "ugrave", "uml", "uuml", "yacute", "yen", "yuml",
];

/// Longest name in [`LEGACY_ENTITIES`].
const LONGEST_LEGACY_ENTITY: usize = 6;

/// Windows-1252 characters that numeric references in 0x80..=0x9F stand for.
const C1_REPLACEMENTS: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}',
    '\u{2021}', '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}',
    '\u{017D}', '\u{008F}', '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}',
    '\u{2022}', '\u{2013}', '\u{2014}', '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}',
    '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

/// Decode HTML character references in one pass, the way browsers read text.
///
/// - Named references resolve through the HTML5 entity table. The legacy
///   names (`&amp`, `&copy`, `&eacute`, ...) also resolve without `;`, even
///   as a prefix (`&notit;` is `¬it;`).
/// - Numeric references (`&#8217;`, `&#x2019;`) need not end in `;`. Code
///   points 0x80..=0x9F map through Windows-1252; NUL, surrogates and values
///   past U+10FFFF become U+FFFD.
/// - Anything else, including a bare `&`, is kept verbatim.
///
/// The output is never rescanned, so `&amp;amp;` becomes `&amp;`.
/// Returns `Cow::Borrowed` when the input has no `&` at all.
pub fn unescape_html(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let reference = &rest[amp..];
        match decode_reference(reference) {
            Some((decoded, consumed)) => {
                out.push_str(&decoded);
                rest = &reference[consumed..];
            }
            None => {
                out.push('&');
                rest = &reference[1..];
            }
        }
    }
    out.push_str(rest);

    Cow::Owned(out)
}

/// Decode the reference at the start of `s`, which begins with `&`.
///
/// Returns the replacement text and the number of bytes consumed.
fn decode_reference(s: &str) -> Option<(Cow<'static, str>, usize)> {
    if s.as_bytes().get(1) == Some(&b'#') {
        let (c, consumed) = decode_numeric(s)?;
        Some((Cow::Owned(c.to_string()), consumed))
    } else {
        decode_named(s)
    }
}

fn decode_numeric(s: &str) -> Option<(char, usize)> {
    let bytes = s.as_bytes();
    // At least "&#" plus one more byte
    if bytes.len() <= 3 {
        return None;
    }

    let mut i = 2;
    let hex = matches!(bytes[i], b'x' | b'X');
    if hex {
        i += 1;
    }
    let radix = if hex { 16 } else { 10 };

    let mut code: u32 = 0;
    while let Some(&b) = bytes.get(i) {
        i += 1;
        if let Some(digit) = (b as char).to_digit(radix) {
            code = code.saturating_mul(radix).saturating_add(digit);
            continue;
        }
        if b != b';' {
            i -= 1;
        }
        break;
    }

    // Nothing past "&#" or "&#x" was consumed
    if i <= 3 {
        return None;
    }

    let c = match code {
        0x80..=0x9F => C1_REPLACEMENTS[(code - 0x80) as usize],
        0 => char::REPLACEMENT_CHARACTER,
        _ => char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER),
    };
    Some((c, i))
}

fn decode_named(s: &str) -> Option<(Cow<'static, str>, usize)> {
    let bytes = s.as_bytes();
    let name_len = bytes[1..]
        .iter()
        .position(|b| !b.is_ascii_alphanumeric())
        .unwrap_or(bytes.len() - 1);
    if name_len == 0 {
        return None;
    }
    let name = &s[1..1 + name_len];
    let terminated = bytes.get(1 + name_len) == Some(&b';');

    if terminated {
        if let Some(decoded) = resolve_html5_entity(name) {
            return Some((Cow::Borrowed(decoded), name_len + 2));
        }
    }
    if let Some(decoded) = resolve_legacy(name) {
        return Some((Cow::Borrowed(decoded), name_len + 1));
    }

    // Longest legacy name that prefixes the run, e.g. "not" in "&notit;"
    let longest = (name_len - usize::from(!terminated)).min(LONGEST_LEGACY_ENTITY);
    (2..=longest).rev().find_map(|len| {
        resolve_legacy(&name[..len]).map(|decoded| (Cow::Borrowed(decoded), len + 1))
    })
}

fn resolve_legacy(name: &str) -> Option<&'static str> {
    if LEGACY_ENTITIES.contains(&name) {
        resolve_html5_entity(name)
    } else {
        None
    }
}

fn is_control_byte(b: u8) -> bool {
    b == 0x1b || b == 0x7f || (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r'))
}

/// SEC-001: Strip terminal control characters and ANSI escape sequences.
///
/// Feed names, user names and item titles come from users and remote feeds
/// and end up on the terminal. Removes C0 controls (except tab, newline and
/// carriage return), DEL, CSI sequences (`ESC [` ... final byte), OSC
/// sequences (`ESC ]` ... BEL or `ESC \`) and bare ESC.
///
/// Returns `Cow::Borrowed` when nothing needs stripping (the common case).
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.bytes().any(is_control_byte) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            c if c.is_ascii() && is_control_byte(c as u8) => {}
            c => out.push(c),
        }
    }

    Cow::Owned(out)
}
