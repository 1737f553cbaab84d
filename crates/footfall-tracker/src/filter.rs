//! Requests that must not be tracked.

use std::fmt::{self, Display};

use crate::request::HitRequest;

const MIN_USER_AGENT_LEN: usize = 10;
const MAX_USER_AGENT_LEN: usize = 300;

/// Lower-case substrings identifying automated clients.
const BOT_KEYWORDS: &[&str] = &[
    "bot",
    "crawl",
    "spider",
    "slurp",
    "scrape",
    "headless",
    "phantomjs",
    "lighthouse",
    "pingdom",
    "uptime",
    "monitor",
    "curl/",
    "wget/",
    "python-requests",
    "python-urllib",
    "go-http-client",
    "java/",
    "okhttp",
    "axios/",
    "node-fetch",
    "facebookexternalhit",
    "whatsapp",
    "embedly",
    "archive.org",
];

/// Why a request was not tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    DoNotTrack,
    MissingUserAgent,
    UserAgentLength,
    NonAsciiUserAgent,
    Prefetch,
    Bot,
}

impl Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            IgnoreReason::DoNotTrack => "do not track",
            IgnoreReason::MissingUserAgent => "missing user agent",
            IgnoreReason::UserAgentLength => "user agent length",
            IgnoreReason::NonAsciiUserAgent => "non-ascii user agent",
            IgnoreReason::Prefetch => "prefetch",
            IgnoreReason::Bot => "bot user agent",
        };
        f.write_str(reason)
    }
}

/// Returns why `request` must be ignored, or `None` if it can be tracked.
pub fn ignore_request(request: &HitRequest, respect_do_not_track: bool) -> Option<IgnoreReason> {
    if respect_do_not_track && request.header("DNT").map(str::trim) == Some("1") {
        return Some(IgnoreReason::DoNotTrack);
    }

    let user_agent = request.user_agent();
    if user_agent.is_empty() {
        return Some(IgnoreReason::MissingUserAgent);
    }
    if !(MIN_USER_AGENT_LEN..=MAX_USER_AGENT_LEN).contains(&user_agent.len()) {
        return Some(IgnoreReason::UserAgentLength);
    }
    if !user_agent.is_ascii() {
        return Some(IgnoreReason::NonAsciiUserAgent);
    }

    if is_prefetch(request) {
        return Some(IgnoreReason::Prefetch);
    }

    let lower = user_agent.to_ascii_lowercase();
    if BOT_KEYWORDS.iter().any(|keyword| lower.contains(keyword)) {
        return Some(IgnoreReason::Bot);
    }

    None
}

fn is_prefetch(request: &HitRequest) -> bool {
    let is = |name: &str, values: &[&str]| {
        request
            .header(name)
            .is_some_and(|value| values.iter().any(|v| value.trim().eq_ignore_ascii_case(v)))
    };

    is("X-Moz", &["prefetch"])
        || is("X-Purpose", &["prefetch", "preview"])
        || is("Purpose", &["prefetch", "preview"])
}
