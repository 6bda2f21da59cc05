//! Request and response messages
//!
//! These are the units the pipeline works on: a [`Request`] describes the
//! call to forward, a [`Response`] is what the origin answered and what the
//! cache stores. Both share the JSON wire shape used by the queue ingress
//! and by the cache backends:
//!
//! ```json
//! {
//!   "Url": "http://origin.test/path",
//!   "Method": "GET",
//!   "Headers": { "Accept": ["text/plain"] },
//!   "ContentHeaders": null,
//!   "TrailingHeaders": {},
//!   "Content": "aGVsbG8="
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::{Error, Result};

/// Header names that describe the body rather than the message.
const CONTENT_HEADER_NAMES: &[&str] = &["allow", "expires", "last-modified"];

/// Returns `true` for headers that belong in the content-header mapping.
#[must_use]
pub fn is_content_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("content-") || CONTENT_HEADER_NAMES.contains(&lower.as_str())
}

// ─────────────────────────────────────────────────────────────────────────────
// Headers
// ─────────────────────────────────────────────────────────────────────────────

/// Header mapping: name → ordered list of values.
///
/// Names are stored as given. Lookups and appends match names
/// case-insensitively, so `X-Foo` and `x-foo` share one entry.
/// Iteration order is sorted by name, which keeps every serialization of
/// the same mapping byte-identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    /// Create an empty mapping
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `name`
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(values) = self
            .0
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
        {
            values.push(value);
        } else {
            self.0.insert(name.to_string(), vec![value]);
        }
    }

    /// Get all values for `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// Remove every entry whose name matches `name`
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|key, _| !key.eq_ignore_ascii_case(name));
    }

    /// Iterate over `(name, values)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Number of distinct header names
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the mapping is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of the mapping without the names in `ignored`.
    ///
    /// Matching is exact: `traceparent` does not remove `Traceparent`.
    #[must_use]
    pub fn without(&self, ignored: &HashSet<String>) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(key, _)| !ignored.contains(key.as_str()))
                .map(|(key, values)| (key.clone(), values.clone()))
                .collect(),
        )
    }

    /// Split an [`http::HeaderMap`] into general headers and content headers.
    ///
    /// Values that are not valid UTF-8 are converted lossily.
    #[must_use]
    pub fn partition(map: &HeaderMap) -> (Self, Self) {
        let mut general = Self::new();
        let mut content = Self::new();
        for (name, value) in map {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            if is_content_header(name.as_str()) {
                content.append(name.as_str(), value);
            } else {
                general.append(name.as_str(), value);
            }
        }
        (general, content)
    }

    /// Convert an [`http::HeaderMap`] without partitioning
    #[must_use]
    pub fn from_http(map: &HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map {
            headers.append(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        headers
    }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name.as_ref(), value);
        }
        headers
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// A forward-bound HTTP call description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Request {
    /// Absolute target URL
    #[serde(default)]
    pub url: Option<String>,
    /// HTTP method token
    #[serde(default)]
    pub method: Option<String>,
    /// Request headers
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    /// Headers describing the body
    #[serde(default)]
    pub content_headers: Option<Headers>,
    /// Trailing headers (carried for wire compatibility, never forwarded)
    #[serde(default, deserialize_with = "null_as_default")]
    pub trailing_headers: Headers,
    /// Body bytes; `None` means the request has no body at all
    #[serde(default, with = "optional_base64")]
    pub content: Option<Bytes>,
}

impl Request {
    /// Create a request without headers or body
    #[must_use]
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            method: Some(method.to_string()),
            ..Self::default()
        }
    }

    /// Add a header value (builder style)
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        if is_content_header(name) {
            self.content_headers
                .get_or_insert_with(Headers::new)
                .append(name, value);
        } else {
            self.headers.append(name, value);
        }
        self
    }

    /// Set the body (builder style)
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.content = Some(body.into());
        self
    }

    /// Parse and validate the target URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedRequest` if the URL is missing, unparseable
    /// or not absolute.
    pub fn target(&self) -> Result<Url> {
        let raw = self
            .url
            .as_deref()
            .ok_or_else(|| Error::MalformedRequest("request has no target URL".to_string()))?;
        let url = Url::parse(raw)
            .map_err(|e| Error::MalformedRequest(format!("invalid target URL '{raw}': {e}")))?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(Error::MalformedRequest(format!(
                "target URL '{raw}' is not absolute"
            )));
        }
        Ok(url)
    }

    /// Parse the method as its canonical uppercase token.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedRequest` if the method is missing or not a
    /// valid token.
    pub fn http_method(&self) -> Result<Method> {
        let raw = self
            .method
            .as_deref()
            .ok_or_else(|| Error::MalformedRequest("request has no method".to_string()))?;
        Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::MalformedRequest(format!("invalid method '{raw}'")))
    }

    /// Drop headers that only route the request to the cache.
    ///
    /// Removes the destination header and `Host` from both header mappings.
    /// Content headers are only meaningful next to a body, so they are
    /// dropped when the request has none.
    pub fn strip_routing_headers(&mut self, destination_header: &str) {
        for name in [destination_header, "Host"] {
            self.headers.remove(name);
            if let Some(content_headers) = self.content_headers.as_mut() {
                content_headers.remove(name);
            }
        }
        if self.content.is_none() {
            self.content_headers = None;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response
// ─────────────────────────────────────────────────────────────────────────────

/// Structured result of a forward call; the unit stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    /// Status code
    #[serde(with = "status_code")]
    pub status_code: StatusCode,
    /// Response headers
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: Headers,
    /// Headers describing the body
    #[serde(default)]
    pub content_headers: Option<Headers>,
    /// Headers sent after the body
    #[serde(default, deserialize_with = "null_as_default")]
    pub trailing_headers: Headers,
    /// Body bytes; empty means no body
    #[serde(default, with = "body_base64")]
    pub content: Bytes,
}

impl Response {
    /// Create a response with the given status and no headers or body
    #[must_use]
    pub fn new(status_code: StatusCode) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            content_headers: None,
            trailing_headers: Headers::new(),
            content: Bytes::new(),
        }
    }

    /// Add a header value (builder style)
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        if is_content_header(name) {
            self.content_headers
                .get_or_insert_with(Headers::new)
                .append(name, value);
        } else {
            self.headers.append(name, value);
        }
        self
    }

    /// Add a trailing header value (builder style)
    #[must_use]
    pub fn with_trailer(mut self, name: &str, value: impl Into<String>) -> Self {
        self.trailing_headers.append(name, value);
        self
    }

    /// Set the body (builder style)
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.content = body.into();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serde helpers
// ─────────────────────────────────────────────────────────────────────────────

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `Option<Bytes>` as a base64 string or `null`
mod optional_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| STANDARD.decode(encoded).map(Bytes::from))
            .transpose()
            .map_err(D::Error::custom)
    }
}

/// `Bytes` as a base64 string; `null` reads back as empty
mod body_base64 {
    use bytes::Bytes;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        super::optional_base64::serialize(&Some(value.clone()), s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        Ok(super::optional_base64::deserialize(d)?.unwrap_or_default())
    }
}

/// Status codes are written numerically. Reading also accepts a numeric
/// string or the reason phrase in any spacing/casing (`"NotFound"`,
/// `"Not Found"`), which is how enum-name based producers encode them.
mod status_code {
    use super::{Deserializer, Serializer, StatusCode, fmt};
    use serde::de::{self, Visitor};

    /// Enum names that differ from the IANA reason phrase.
    const ALIASES: &[(&str, u16)] = &[
        ("ambiguous", 300),
        ("moved", 301),
        ("redirect", 302),
        ("redirectmethod", 303),
        ("redirectkeepverb", 307),
        ("requestentitytoolarge", 413),
        ("requesturitoolong", 414),
        ("requestedrangenotsatisfiable", 416),
    ];

    pub fn serialize<S: Serializer>(value: &StatusCode, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u16(value.as_u16())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<StatusCode, D::Error> {
        d.deserialize_any(StatusVisitor)
    }

    struct StatusVisitor;

    impl Visitor<'_> for StatusVisitor {
        type Value = StatusCode;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an HTTP status code or reason phrase")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<StatusCode, E> {
            u16::try_from(v)
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| E::custom(format!("invalid status code {v}")))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<StatusCode, E> {
            u64::try_from(v)
                .map_err(|_| E::custom(format!("invalid status code {v}")))
                .and_then(|v| self.visit_u64(v))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<StatusCode, E> {
            if let Ok(code) = v.trim().parse::<u16>() {
                return StatusCode::from_u16(code)
                    .map_err(|_| E::custom(format!("invalid status code {v}")));
            }
            from_reason(v).ok_or_else(|| E::custom(format!("unknown status '{v}'")))
        }
    }

    fn normalize(s: &str) -> String {
        s.chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    fn from_reason(name: &str) -> Option<StatusCode> {
        let wanted = normalize(name);
        if let Some((_, code)) = ALIASES.iter().find(|(alias, _)| *alias == wanted) {
            return StatusCode::from_u16(*code).ok();
        }
        (100..=599u16)
            .filter_map(|code| StatusCode::from_u16(code).ok())
            .find(|status| {
                status
                    .canonical_reason()
                    .is_some_and(|reason| normalize(reason) == wanted)
            })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.method.as_deref().unwrap_or("<no method>"),
            self.url.as_deref().unwrap_or("<unknown>")
        )
    }
}

/// Serialize a value to its JSON wire form.
///
/// # Errors
///
/// Returns `Error::Json` if serialization fails.
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Error::from)
}
