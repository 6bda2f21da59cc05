//! Cache key derivation
//!
//! A key is the JSON serialization of
//! `{Content, Headers, Method, RequestUri}` for a request, with ignored
//! header names removed. Fields are written in that fixed order and headers
//! are sorted by name, so the same request always yields the same string.
//! An absent body is `null`; an empty body is `""`.
//!
//! Optionally the key is namespaced with a prefix and/or replaced by the
//! SHA-256 hex digest of the JSON.

use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::Result;
use crate::config::CacheConfig;
use crate::message::{Headers, Request, to_json};

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct KeyMaterial<'a> {
    content: Option<String>,
    headers: Headers,
    method: &'a str,
    request_uri: &'a str,
}

/// Derives cache keys from requests.
#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    ignored_headers: HashSet<String>,
    prefix: Option<String>,
    hash: bool,
}

impl KeyDeriver {
    /// Create a deriver that drops the given header names (exact match)
    pub fn new<I, S>(ignored_headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored_headers: ignored_headers.into_iter().map(Into::into).collect(),
            prefix: None,
            hash: false,
        }
    }

    /// Create a deriver from cache configuration
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            ignored_headers: config.ignored_headers.iter().cloned().collect(),
            prefix: config.key_prefix.clone(),
            hash: config.hash_keys,
        }
    }

    /// Prepend `prefix:` to every key
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Replace the JSON key by its SHA-256 hex digest
    #[must_use]
    pub fn hashed(mut self, hash: bool) -> Self {
        self.hash = hash;
        self
    }

    /// Derive the key for `request`.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedRequest` if the target URL is missing or not
    /// absolute, or if the method is not a valid token.
    pub fn derive(&self, request: &Request) -> Result<String> {
        let key = derive_key(request, &self.ignored_headers)?;
        let key = if self.hash {
            hex::encode(Sha256::digest(key.as_bytes()))
        } else {
            key
        };
        Ok(match self.prefix {
            Some(ref prefix) => format!("{prefix}:{key}"),
            None => key,
        })
    }
}

/// Derive the plain JSON key for `request`, ignoring `ignored_headers`.
///
/// Content headers take part in the key alongside regular headers.
///
/// # Errors
///
/// Returns `Error::MalformedRequest` for a missing or non-absolute URL or
/// an invalid method.
pub fn derive_key(request: &Request, ignored_headers: &HashSet<String>) -> Result<String> {
    let target = request.target()?;
    let method = request.http_method()?;

    let mut headers = request.headers.without(ignored_headers);
    if let Some(ref content_headers) = request.content_headers {
        for (name, values) in content_headers.without(ignored_headers).iter() {
            for value in values {
                headers.append(name, value.clone());
            }
        }
    }

    to_json(&KeyMaterial {
        content: request.content.as_ref().map(|body| STANDARD.encode(body)),
        headers,
        method: method.as_str(),
        request_uri: target.as_str(),
    })
}
