//! Header sanitization for responses leaving the cache.
//!
//! Cached and forwarded header names/values are replayed to clients
//! verbatim. Anything that would not survive as a valid HTTP token or field
//! value (CR, LF, NUL and other control bytes) is percent-encoded instead
//! of being emitted raw, so a stored value can never split a response.

use std::fmt::Write as _;

use http::{HeaderName, HeaderValue};

/// Token characters allowed in a header name besides ASCII alphanumerics.
const TCHAR_SYMBOLS: &[u8] = b"!#$%&'*+-.^_`|~";

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || TCHAR_SYMBOLS.contains(&b)
}

/// Visible ASCII, space and horizontal tab, minus `%` itself.
fn is_plain_value_byte(b: u8) -> bool {
    b == b'\t' || ((b' '..=b'~').contains(&b) && b != b'%')
}

fn percent_encode(input: &str, keep: impl Fn(u8) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        if keep(b) {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

/// Build a header name, percent-encoding non-token bytes if needed.
///
/// Returns `None` only for an empty name.
#[must_use]
pub fn header_name(name: &str) -> Option<HeaderName> {
    if name.is_empty() {
        return None;
    }
    HeaderName::from_bytes(name.as_bytes()).ok().or_else(|| {
        let encoded = percent_encode(name, |b| is_tchar(b) && b != b'%');
        HeaderName::from_bytes(encoded.as_bytes()).ok()
    })
}

/// Build a header value, percent-encoding it if it contains bytes that
/// are not allowed in a field value.
#[must_use]
pub fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| {
        let encoded = percent_encode(value, is_plain_value_byte);
        // Only visible ASCII remains, which is always a valid value
        HeaderValue::from_str(&encoded).unwrap_or_else(|_| HeaderValue::from_static(""))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_values_pass_through() {
        assert_eq!(header_value("text/html; charset=utf-8"), "text/html; charset=utf-8");
        assert_eq!(header_value("100%"), "100%");
    }

    #[test]
    fn crlf_is_encoded() {
        let value = header_value("ok\r\nSet-Cookie: stolen=1");
        assert_eq!(value, "ok%0D%0ASet-Cookie: stolen=1");
    }

    #[test]
    fn percent_is_encoded_when_value_needs_encoding() {
        assert_eq!(header_value("50%\n"), "50%25%0A");
    }

    #[test]
    fn non_ascii_is_encoded() {
        assert_eq!(header_value("café"), "caf%C3%A9");
    }

    #[test]
    fn valid_names_pass_through() {
        assert_eq!(header_name("X-Foo").unwrap().as_str(), "x-foo");
    }

    #[test]
    fn invalid_names_are_encoded() {
        assert_eq!(header_name("bad name").unwrap().as_str(), "bad%20name");
        assert_eq!(header_name("x\r\ny").unwrap().as_str(), "x%0d%0ay");
        assert!(header_name("").is_none());
    }
}
