//! Target token parsing for scan input
//!
//! Input lines come from files people actually have lying around, so they
//! carry comments, mixed separators and host:port leftovers. This module
//! turns raw lines into classified targets:
//! - `1.2.3.4` and `1.2.3.4:53` both yield the bare address
//! - `10.0.0.0/24` yields an IPv4 CIDR block for expansion or sampling
//! - `#` and `//` start comments, `,` `;` and whitespace separate tokens

use ipnetwork::Ipv4Network;
use std::net::IpAddr;

/// A classified scan target
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSpec {
    /// A single address, port already stripped
    Ip(String),
    /// An IPv4 CIDR block
    Cidr(Ipv4Network),
}

/// Split one input line into clean tokens.
///
/// Whole-line and trailing comments are removed first, then the remainder
/// is split on commas, semicolons and whitespace.
pub fn clean_line(line: &str) -> impl Iterator<Item = &str> + '_ {
    let trimmed = line.trim();
    let body = if trimmed.starts_with('#') || trimmed.starts_with("//") {
        ""
    } else {
        let cut = trimmed.split_once('#').map_or(trimmed, |(head, _)| head);
        cut.split_once("//").map_or(cut, |(head, _)| head)
    };
    body.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
}

/// Drop a trailing `:port` from a token.
///
/// Bare IPv6 addresses pass through untouched; everything else is cut at
/// the first colon.
pub fn strip_port(token: &str) -> &str {
    let token = token.trim();
    if token.parse::<IpAddr>().is_ok() {
        return token;
    }
    match token.split_once(':') {
        Some((head, _)) => head.trim(),
        None => token,
    }
}

/// Check whether a string parses as an IP address
pub fn is_ip(token: &str) -> bool {
    token.parse::<IpAddr>().is_ok()
}

/// Classify one token.
///
/// Tokens containing `/` are treated as CIDR notation; anything that is
/// neither a valid address nor a valid IPv4 block is dropped silently so
/// one stray line cannot kill a large sweep.
pub fn classify_token(token: &str) -> Option<TargetSpec> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    if token.contains('/') {
        return token.parse::<Ipv4Network>().ok().map(TargetSpec::Cidr);
    }

    let bare = strip_port(token);
    if is_ip(bare) {
        Some(TargetSpec::Ip(bare.to_string()))
    } else {
        None
    }
}
