//! Flat-namespace mangling for aggregated capability names
//!
//! Tool and prompt names from outbound servers are presented inbound as
//! `<serverName>_1mcp_<localName>`. Server names are restricted at config
//! load to `[A-Za-z0-9_-]+` without the separator, which makes the mapping
//! injective; unmangling splits on the first separator occurrence.

use once_cell::sync::Lazy;
use regex::Regex;

/// Literal separator between server name and local name
pub const SEPARATOR: &str = "_1mcp_";

static SERVER_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z0-9_-]+$").unwrap());

/// True when `name` is usable as an outbound server name
pub fn is_valid_server_name(name: &str) -> bool {
    SERVER_NAME_RE.is_match(name) && !name.contains(SEPARATOR)
}

/// Mangle a `(serverName, localName)` pair into the flat inbound namespace
pub fn mangle(server: &str, local: &str) -> String {
    format!("{}{}{}", server, SEPARATOR, local)
}

/// Invert [`mangle`]: split on the first separator occurrence
pub fn unmangle(mangled: &str) -> Option<(&str, &str)> {
    let idx = mangled.find(SEPARATOR)?;
    let server = &mangled[..idx];
    let local = &mangled[idx + SEPARATOR.len()..];
    if server.is_empty() || local.is_empty() {
        return None;
    }
    Some((server, local))
}

/// Mangle a resource URI by tagging the opaque local portion.
///
/// The scheme is preserved so inbound agents still see a syntactically
/// plausible URI: `file:///etc/hosts` becomes `file://files_1mcp_/etc/hosts`.
pub fn mangle_uri(server: &str, uri: &str) -> String {
    if let Some(idx) = uri.find("://") {
        let split = idx + 3;
        format!("{}{}{}{}", &uri[..split], server, SEPARATOR, &uri[split..])
    } else if let Some(idx) = uri.find(':') {
        let split = idx + 1;
        format!("{}{}{}{}", &uri[..split], server, SEPARATOR, &uri[split..])
    } else {
        mangle(server, uri)
    }
}

/// Invert [`mangle_uri`]
pub fn unmangle_uri(uri: &str) -> Option<(String, String)> {
    let (prefix, tagged) = if let Some(idx) = uri.find("://") {
        uri.split_at(idx + 3)
    } else if let Some(idx) = uri.find(':') {
        uri.split_at(idx + 1)
    } else {
        ("", uri)
    };
    let sep = tagged.find(SEPARATOR)?;
    let server = &tagged[..sep];
    let local = &tagged[sep + SEPARATOR.len()..];
    if server.is_empty() || !is_valid_server_name(server) {
        return None;
    }
    Some((server.to_string(), format!("{}{}", prefix, local)))
}
