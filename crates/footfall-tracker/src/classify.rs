//! Request classification collaborators.
//!
//! User-agent parsing, GeoIP lookup, referrer classification and UTM
//! extraction are table lookups owned by other components. The tracker
//! only depends on the traits below; the bundled implementations are
//! deliberately small.

use std::net::{IpAddr, SocketAddr};

use footfall_types::{UtmParams, shorten};

use crate::request::{query_param, split_url};

/// Maximum stored length of referrer URLs, names and UTM values.
pub const MAX_REFERRER_LEN: usize = 200;
/// Maximum stored length of OS and browser names and versions.
pub const MAX_USER_AGENT_FIELD_LEN: usize = 20;
pub const MAX_LANGUAGE_LEN: usize = 10;

// ============================================================================
// User agent
// ============================================================================

/// Result of parsing a `User-Agent` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub os: String,
    pub os_version: String,
    pub browser: String,
    pub browser_version: String,
    pub desktop: bool,
    pub mobile: bool,
}

impl UserAgentInfo {
    /// Truncates every field to its stored length.
    pub fn shortened(self) -> Self {
        let cut = |s: String| shorten(&s, MAX_USER_AGENT_FIELD_LEN).to_string();
        Self {
            os: cut(self.os),
            os_version: cut(self.os_version),
            browser: cut(self.browser),
            browser_version: cut(self.browser_version),
            ..self
        }
    }
}

/// Parses user agent strings. Must be a pure function.
pub trait UserAgentParser: Send + Sync {
    fn parse(&self, user_agent: &str) -> UserAgentInfo;
}

/// Parser that recognizes nothing; every field stays empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownUserAgent;

impl UserAgentParser for UnknownUserAgent {
    fn parse(&self, _user_agent: &str) -> UserAgentInfo {
        UserAgentInfo::default()
    }
}

// ============================================================================
// Geo
// ============================================================================

/// Maps an IP address to an ISO 3166-1 alpha-2 country code.
///
/// Unknown addresses map to an empty string.
pub trait GeoLookup: Send + Sync {
    fn country_code(&self, ip: &str) -> String;
}

impl<F> GeoLookup for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn country_code(&self, ip: &str) -> String {
        self(ip)
    }
}

// ============================================================================
// Referrer
// ============================================================================

/// A classified referrer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Referrer {
    /// Normalized referrer URL (no query or fragment); empty for non-URL
    /// referrers such as `?ref=newsletter`.
    pub url: String,
    /// Display name, usually the host.
    pub name: String,
}

impl Referrer {
    pub fn is_empty(&self) -> bool {
        self.url.is_empty() && self.name.is_empty()
    }
}

/// Classifies the raw referrer of a hit.
pub trait ReferrerClassifier: Send + Sync {
    /// `raw` is the referrer as sent (header, query parameter or override);
    /// `request_host` is the host of the tracked page, used to recognize
    /// internal navigation.
    fn classify(&self, raw: &str, request_host: &str) -> Referrer;
}

/// Host-based referrer classifier with a domain blacklist.
///
/// Drops internal navigation, IP address referrers and blacklisted hosts.
/// With `include_subdomains` both sides are compared on their last two
/// labels, so `example.com` also blocks `blog.example.com`.
#[derive(Debug, Clone, Default)]
pub struct HostReferrerClassifier {
    blacklist: Vec<String>,
    include_subdomains: bool,
}

const ANDROID_APP_PREFIX: &str = "android-app://";

impl HostReferrerClassifier {
    pub fn new(blacklist: &[String], include_subdomains: bool) -> Self {
        Self {
            blacklist: blacklist
                .iter()
                .map(|host| host.trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect(),
            include_subdomains,
        }
    }

    fn is_blacklisted(&self, host: &str) -> bool {
        let host = if self.include_subdomains {
            strip_subdomain(host)
        } else {
            host
        };
        self.blacklist.iter().any(|entry| entry == host)
    }
}

impl ReferrerClassifier for HostReferrerClassifier {
    fn classify(&self, raw: &str, request_host: &str) -> Referrer {
        let raw = raw.trim();
        if raw.is_empty() {
            return Referrer::default();
        }

        if raw
            .get(..ANDROID_APP_PREFIX.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(ANDROID_APP_PREFIX))
        {
            let package = raw[ANDROID_APP_PREFIX.len()..]
                .split('/')
                .next()
                .unwrap_or("");
            return Referrer {
                url: shorten(raw, MAX_REFERRER_LEN).to_string(),
                name: shorten(package, MAX_REFERRER_LEN).to_string(),
            };
        }

        let Some(scheme_end) = raw.find("://") else {
            // Not a URL, e.g. `?ref=newsletter`
            if is_ip(raw) || self.is_blacklisted(&raw.to_ascii_lowercase()) {
                return Referrer::default();
            }
            return Referrer {
                url: String::new(),
                name: shorten(raw, MAX_REFERRER_LEN).to_string(),
            };
        };

        let scheme = raw[..scheme_end].to_ascii_lowercase();
        let (authority, path, _) = split_url(raw);
        let host = host_of(authority);

        if host.is_empty() || host.parse::<IpAddr>().is_ok() || authority.contains('[') {
            return Referrer::default();
        }

        if !request_host.is_empty() && host == host_of(request_host) {
            return Referrer::default();
        }

        if self.is_blacklisted(&host) {
            return Referrer::default();
        }

        let path = if path == "/" { "" } else { path };
        let url = format!("{scheme}://{host}{path}");

        Referrer {
            url: shorten(&url, MAX_REFERRER_LEN).to_string(),
            name: shorten(&host, MAX_REFERRER_LEN).to_string(),
        }
    }
}

/// Lower-cased host of an authority, without user info and port.
fn host_of(authority: &str) -> String {
    let host = authority.rsplit('@').next().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Keeps the last two labels of a host name.
fn strip_subdomain(host: &str) -> &str {
    match host.rmatch_indices('.').nth(1) {
        Some((index, _)) => &host[index + 1..],
        None => host,
    }
}

fn is_ip(value: &str) -> bool {
    let value = value.trim_matches('/');
    value.parse::<IpAddr>().is_ok() || value.parse::<SocketAddr>().is_ok()
}

// ============================================================================
// UTM
// ============================================================================

/// Extracts campaign parameters from a query string.
pub trait UtmExtractor: Send + Sync {
    fn extract(&self, query: &str) -> UtmParams;
}

/// Reads the standard `utm_*` query parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryUtmExtractor;

impl UtmExtractor for QueryUtmExtractor {
    fn extract(&self, query: &str) -> UtmParams {
        let get = |name: &str| {
            query_param(query, name)
                .map(|value| shorten(value.trim(), MAX_REFERRER_LEN).to_string())
                .unwrap_or_default()
        };

        UtmParams {
            source: get("utm_source"),
            medium: get("utm_medium"),
            campaign: get("utm_campaign"),
            content: get("utm_content"),
            term: get("utm_term"),
        }
    }
}

/// Query parameters that carry a referrer when the header is missing.
const REFERRER_QUERY_PARAMS: [&str; 4] = ["ref", "referer", "referrer", "source"];

/// Picks the raw referrer: explicit override, then the `Referer` header,
/// then a referrer query parameter.
pub(crate) fn raw_referrer(
    override_value: Option<&str>,
    header: Option<&str>,
    query: &str,
) -> String {
    if let Some(value) = override_value {
        return value.to_string();
    }
    if let Some(value) = header.filter(|value| !value.trim().is_empty()) {
        return value.to_string();
    }
    REFERRER_QUERY_PARAMS
        .iter()
        .filter_map(|param| query_param(query, param))
        .find(|value| !value.trim().is_empty())
        .unwrap_or_default()
}

// ============================================================================
// Language and screen
// ============================================================================

/// Returns the primary language subtag of an `Accept-Language` header.
///
/// `en-US,en;q=0.9` yields `en`. Anything that is not a two-letter code
/// yields an empty string.
pub fn language(accept_language: &str) -> String {
    let first = accept_language
        .split([',', ';'])
        .next()
        .unwrap_or("")
        .trim();
    let primary = first.split(['-', '_']).next().unwrap_or("");

    if primary.len() == 2 && primary.chars().all(|c| c.is_ascii_alphabetic()) {
        shorten(&primary.to_ascii_lowercase(), MAX_LANGUAGE_LEN).to_string()
    } else {
        String::new()
    }
}

const SCREEN_CLASSES: [(u16, &str); 9] = [
    (5120, "UHD 5K"),
    (3840, "UHD 4K"),
    (2560, "WQHD"),
    (1920, "Full HD"),
    (1280, "HD"),
    (1024, "XL"),
    (800, "L"),
    (600, "M"),
    (415, "S"),
];

/// Groups a screen width into a class; zero width has no class.
pub fn screen_class(width: u16) -> &'static str {
    if width == 0 {
        return "";
    }

    SCREEN_CLASSES
        .iter()
        .find(|(min_width, _)| width >= *min_width)
        .map_or("XS", |(_, class)| class)
}
