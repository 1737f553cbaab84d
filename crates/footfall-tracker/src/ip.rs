//! Client IP resolution.
//!
//! Proxies and CDNs put the real client address into headers. They are
//! checked in a fixed order and the first one yielding a public address
//! wins; otherwise the socket's remote address is used.

use std::net::{IpAddr, SocketAddr};

use crate::request::HitRequest;

/// How a header value is parsed.
#[derive(Debug, Clone, Copy)]
enum HeaderFormat {
    /// Comma separated list; the last entry is the one our proxy added.
    ForwardedFor,
    /// RFC 7239 `Forwarded`; `for=` of the last element.
    Forwarded,
    /// A single address.
    Single,
}

const IP_HEADERS: [(&str, HeaderFormat); 5] = [
    ("CF-Connecting-IP", HeaderFormat::ForwardedFor),
    ("True-Client-IP", HeaderFormat::ForwardedFor),
    ("X-Forwarded-For", HeaderFormat::ForwardedFor),
    ("Forwarded", HeaderFormat::Forwarded),
    ("X-Real-IP", HeaderFormat::Single),
];

/// Returns the client IP of a request as text, without port.
///
/// Returns an empty string if nothing usable is found.
pub fn client_ip(request: &HitRequest) -> String {
    for (name, format) in IP_HEADERS {
        let Some(value) = request.header(name) else {
            continue;
        };
        if let Some(ip) = parse_header(value, format) {
            return ip.to_string();
        }
    }

    let remote = request.remote_addr().trim();
    match parse_addr(remote) {
        Some(ip) => ip.to_string(),
        None => remote.to_string(),
    }
}

fn parse_header(value: &str, format: HeaderFormat) -> Option<IpAddr> {
    let last = value.rsplit(',').next()?.trim();

    let candidate = match format {
        HeaderFormat::ForwardedFor | HeaderFormat::Single => last,
        HeaderFormat::Forwarded => last.split(';').find_map(|part| {
            let (key, value) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("for")
                .then(|| value.trim().trim_matches('"'))
        })?,
    };

    parse_addr(candidate).filter(is_public)
}

/// Parses `ip`, `ip:port`, `[v6]` or `[v6]:port`.
fn parse_addr(value: &str) -> Option<IpAddr> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(socket) = value.parse::<SocketAddr>() {
        return Some(socket.ip());
    }
    value
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inner| inner.parse().ok())
}

/// Rejects addresses that cannot identify a client on the internet.
fn is_public(ip: &IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return false;
    }

    match ip {
        IpAddr::V4(v4) => !v4.is_private() && !v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            first & 0xfe00 != 0xfc00 && first & 0xffc0 != 0xfe80
        }
    }
}
