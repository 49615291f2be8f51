//! Endpoint address handling.

use url::{Host, Url};

use crate::error::{Result, TransportError};
use crate::types::EndpointKind;

/// Parse `address` with its scheme mapped onto `ws`/`wss`.
///
/// `http` becomes `ws`, `https` becomes `wss`, and a bare `host:port` is
/// treated as `ws`.
fn parse_ws(address: &str) -> Result<Url> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(TransportError::InvalidAddress("empty address".into()).into());
    }

    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
            "ws" | "http" => ("ws", rest),
            "wss" | "https" => ("wss", rest),
            other => {
                return Err(TransportError::InvalidAddress(format!(
                    "unsupported scheme '{other}' in {trimmed}"
                ))
                .into())
            }
        },
        None => ("ws", trimmed),
    };

    let url = Url::parse(&format!("{scheme}://{rest}"))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(TransportError::InvalidAddress(format!("no host in {trimmed}")).into());
    }
    Ok(url)
}

fn is_relay_path(path: &str) -> bool {
    path.contains("/relay")
}

fn is_ws_path(path: &str, default_path: &str) -> bool {
    let path = path.trim_end_matches('/');
    path.ends_with("/ws") || path.ends_with(default_path.trim_end_matches('/'))
}

/// Rewrite an endpoint address into a WebSocket URL.
///
/// An empty path gets `default_path`; a path that already targets a relay
/// route or a websocket route is kept; any other path gets `default_path`
/// appended.
pub fn normalize_ws_url(address: &str, default_path: &str) -> Result<String> {
    let mut url = parse_ws(address)?;
    let path = url.path().to_string();

    if path.is_empty() || path == "/" {
        url.set_path(default_path);
    } else if !is_relay_path(&path) && !is_ws_path(&path, default_path) {
        url.set_path(&format!("{}{}", path.trim_end_matches('/'), default_path));
    }

    Ok(url.to_string())
}

/// Guess which endpoint slot an invite address belongs to.
///
/// Relay-style paths are relays; private, loopback and link-local hosts
/// (and `.local` names) are local; everything else is public.
pub fn classify_address(address: &str) -> Option<EndpointKind> {
    let url = parse_ws(address).ok()?;
    if is_relay_path(url.path()) {
        return Some(EndpointKind::Relay);
    }

    let local = match url.host()? {
        Host::Ipv4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        Host::Ipv6(ip) => {
            let first = ip.segments()[0];
            ip.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
        Host::Domain(domain) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".local")
        }
    };

    Some(if local {
        EndpointKind::Local
    } else {
        EndpointKind::Public
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/api/ws";

    #[test]
    fn test_scheme_rewrite() {
        assert_eq!(
            normalize_ws_url("http://192.168.1.5:8080", PATH).unwrap(),
            "ws://192.168.1.5:8080/api/ws"
        );
        assert_eq!(
            normalize_ws_url("https://mesh.example.com", PATH).unwrap(),
            "wss://mesh.example.com/api/ws"
        );
        assert_eq!(
            normalize_ws_url("10.0.0.2:9000", PATH).unwrap(),
            "ws://10.0.0.2:9000/api/ws"
        );
    }

    #[test]
    fn test_existing_ws_paths_are_kept() {
        assert_eq!(
            normalize_ws_url("wss://relay.example.com/relay/abc", PATH).unwrap(),
            "wss://relay.example.com/relay/abc"
        );
        assert_eq!(
            normalize_ws_url("ws://host:1/mesh/ws", PATH).unwrap(),
            "ws://host:1/mesh/ws"
        );
        assert_eq!(
            normalize_ws_url("ws://host:1/api/ws", PATH).unwrap(),
            "ws://host:1/api/ws"
        );
    }

    #[test]
    fn test_other_paths_get_default_appended() {
        assert_eq!(
            normalize_ws_url("https://example.com/mesh/", PATH).unwrap(),
            "wss://example.com/mesh/api/ws"
        );
    }

    #[test]
    fn test_rejects_bad_addresses() {
        assert!(normalize_ws_url("", PATH).is_err());
        assert!(normalize_ws_url("ftp://host", PATH).is_err());
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify_address("http://192.168.1.5:8080"), Some(EndpointKind::Local));
        assert_eq!(classify_address("ws://127.0.0.1:1"), Some(EndpointKind::Local));
        assert_eq!(classify_address("ws://[fd00::1]:80"), Some(EndpointKind::Local));
        assert_eq!(classify_address("kitchen.local:8080"), Some(EndpointKind::Local));
        assert_eq!(classify_address("https://203.0.113.7"), Some(EndpointKind::Public));
        assert_eq!(classify_address("wss://cloud.example.com/relay"), Some(EndpointKind::Relay));
        assert_eq!(classify_address("gopher://nope"), None);
    }
}
