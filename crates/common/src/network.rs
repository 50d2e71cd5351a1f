// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// Network utility functions

use std::net::IpAddr;

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Unparseable hosts count as remote
    false
}

/// Format `host:port`, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split an endpoint like `ssh.example.com:2222`, `[::1]:2222` or a bare host.
///
/// A missing port yields `default_port`. Returns `None` for an empty host or
/// a port that is not a valid non-zero `u16`.
pub fn split_host_port(endpoint: &str, default_port: u16) -> Option<(String, u16)> {
    let endpoint = endpoint.trim();

    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return None,
        }
    } else if endpoint.matches(':').count() > 1 {
        // Unbracketed IPv6 literal, no port
        (endpoint, None)
    } else {
        match endpoint.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (endpoint, None),
        }
    };

    if host.is_empty() {
        return None;
    }

    let port = match port {
        Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0)?,
        None => default_port,
    };

    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_loopback_address() {
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("127.255.255.255"));
        assert!(is_loopback_address("::1"));
        assert!(is_loopback_address("[::1]"));
        assert!(is_loopback_address("localhost"));
        assert!(is_loopback_address("LocalHost"));

        assert!(!is_loopback_address("0.0.0.0"));
        assert!(!is_loopback_address("10.0.0.1"));
        assert!(!is_loopback_address("proxy.internal"));
        assert!(!is_loopback_address("::"));
    }

    #[test]
    fn test_format_host_port() {
        assert_eq!(format_host_port("127.0.0.1", 20003), "127.0.0.1:20003");
        assert_eq!(format_host_port("::1", 20003), "[::1]:20003");
        assert_eq!(format_host_port("[::1]", 20003), "[::1]:20003");
        assert_eq!(format_host_port("proxy", 20004), "proxy:20004");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("ssh.cf.eu10.hana.ondemand.com:2222", 22),
            Some(("ssh.cf.eu10.hana.ondemand.com".to_string(), 2222))
        );
        assert_eq!(
            split_host_port("ssh.example.com", 2222),
            Some(("ssh.example.com".to_string(), 2222))
        );
        assert_eq!(split_host_port("[::1]:2200", 22), Some(("::1".to_string(), 2200)));
        assert_eq!(split_host_port("[::1]", 2222), Some(("::1".to_string(), 2222)));
        assert_eq!(split_host_port("fe80::1", 2222), Some(("fe80::1".to_string(), 2222)));

        assert_eq!(split_host_port("", 2222), None);
        assert_eq!(split_host_port(":2222", 2222), None);
        assert_eq!(split_host_port("host:0", 2222), None);
        assert_eq!(split_host_port("host:99999", 2222), None);
        assert_eq!(split_host_port("host:ssh", 2222), None);
    }
}
