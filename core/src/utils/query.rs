/// Query-string helpers for the HTTP layer
use std::str::FromStr;

/// Raw (still percent-encoded) value of `key`
fn raw_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return Some(v);
            }
        }
    }
    None
}

/// Decoded string value of `key`; empty values count as absent
pub fn param(query: &str, key: &str) -> Option<String> {
    let raw = raw_param(query, key)?;
    let decoded = urlencoding::decode(&raw.replace('+', " "))
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

pub fn parse_param<T: FromStr>(query: &str, key: &str) -> Option<T> {
    param(query, key).and_then(|v| v.parse().ok())
}
