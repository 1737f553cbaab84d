//! Framework-agnostic request snapshot and per-hit options.

use std::collections::BTreeMap;

use footfall_types::ClientId;

/// The parts of an HTTP request the tracker looks at.
///
/// Header lookups are case-insensitive. Nothing is validated on
/// construction; malformed values degrade to empty strings later on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitRequest {
    uri: String,
    remote_addr: String,
    headers: Vec<(String, String)>,
}

impl HitRequest {
    /// Creates a request for `uri` (path with query, or an absolute URL)
    /// received from `remote_addr` (`ip` or `ip:port`).
    pub fn new(uri: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            remote_addr: remote_addr.into(),
            headers: Vec::new(),
        }
    }

    /// Adds a header. Repeated names keep every value in order.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Returns the first value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).next()
    }

    /// Returns every value of a header, in the order they were added.
    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the `User-Agent` header, or an empty string.
    pub fn user_agent(&self) -> &str {
        self.header("User-Agent").map_or("", str::trim)
    }
}

/// Splits a request URI or URL into (host, path, query).
///
/// The fragment is dropped. Host is empty for relative URIs.
pub(crate) fn split_url(url: &str) -> (&str, &str, &str) {
    let url = url.split('#').next().unwrap_or("");

    let (host, rest) = match url.find("://") {
        Some(scheme_end) => {
            let after = &url[scheme_end + 3..];
            let end = after.find(['/', '?']).unwrap_or(after.len());
            (&after[..end], &after[end..])
        }
        None => ("", url),
    };

    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    };

    (host, path, query)
}

/// Looks up the first value of a query parameter, percent-decoded.
pub(crate) fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| percent_decode(value))
}

/// Decodes `%XX` escapes and `+`. Invalid escapes are kept literally.
pub(crate) fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Options for a single page view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitOptions {
    /// Tenant the hit belongs to.
    pub client_id: ClientId,
    /// Overrides the request URI (e.g. a URL reported by a JavaScript
    /// snippet instead of the tracking endpoint's own URI).
    pub url: Option<String>,
    pub title: String,
    /// Overrides the `Referer` header.
    pub referrer: Option<String>,
    pub screen_width: u16,
    pub screen_height: u16,
    /// Appended to the global fingerprint salt.
    pub salt: String,
}

impl HitOptions {
    pub fn for_client(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_screen(mut self, width: u16, height: u16) -> Self {
        self.screen_width = width;
        self.screen_height = height;
        self
    }
}

/// Options for a custom event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventOptions {
    /// Event name; blank names are rejected by the tracker.
    pub name: String,
    pub duration_seconds: u32,
    /// Metadata, kept sorted by key.
    pub meta: BTreeMap<String, String>,
}

impl EventOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, seconds: u32) -> Self {
        self.duration_seconds = seconds;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}
