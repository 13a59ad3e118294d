//! Unescaping for byte-string literal payloads (`b'...'`)

/// Strip a `b'...'` or `b"..."` wrapper, returning the inner content.
pub(crate) fn strip_byte_literal(payload: &str) -> Option<&str> {
    let rest = payload.strip_prefix('b')?;
    let quote = rest.chars().next().filter(|c| matches!(c, '\'' | '"'))?;
    rest[1..].strip_suffix(quote)
}

/// Full byte-literal unescape: hex escapes, then named escapes, then `\\`.
pub(crate) fn unescape_byte_literal(body: &str) -> String {
    unescape_named(&unescape_hex(body))
}

/// Replace `\n`, `\r`, `\t`, `\"`, `\'` and finally `\\`.
///
/// Order is significant: the backslash collapse must run last.
pub(crate) fn unescape_named(text: &str) -> String {
    text.replace("\\n", "\n")
        .replace("\\r", "\r")
        .replace("\\t", "\t")
        .replace("\\\"", "\"")
        .replace("\\'", "'")
        .replace("\\\\", "\\")
}

/// Replace every `\xHH` with the byte it names.
///
/// The resulting bytes are read as UTF-8 when they form valid UTF-8 (the
/// usual case for encoded model output); otherwise each escaped byte becomes
/// the character with that code point. Malformed escapes are kept verbatim.
fn unescape_hex(text: &str) -> String {
    if !text.contains("\\x") {
        return text.to_string();
    }

    let mut bytes = Vec::with_capacity(text.len());
    let mut latin = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find("\\x") {
        let (head, tail) = rest.split_at(pos);
        bytes.extend_from_slice(head.as_bytes());
        latin.push_str(head);

        match hex_byte(&tail[2..]) {
            Some(byte) => {
                bytes.push(byte);
                latin.push(char::from(byte));
                rest = &tail[4..];
            }
            None => {
                bytes.extend_from_slice(b"\\x");
                latin.push_str("\\x");
                rest = &tail[2..];
            }
        }
    }
    bytes.extend_from_slice(rest.as_bytes());
    latin.push_str(rest);

    String::from_utf8(bytes).unwrap_or(latin)
}

fn hex_byte(text: &str) -> Option<u8> {
    let digits = text.get(..2)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(digits, 16).ok()
}
