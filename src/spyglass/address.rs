use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("{0:?} does not match any known address")]
    Malformed(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

fn host_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-]+(\.[A-Za-z0-9_\-]+)+$").expect("host regex"))
}

/// Split `host[:port]`, falling back to `default_port` when no port is given.
///
/// The host must be a dotted name of alphanumerics, `-`, `_` and `.` with at
/// least two labels. Bare IPv6 literals are rejected; there is no bracket
/// form.
pub fn parse_address(address: &str, default_port: u16) -> Result<(String, u16), AddressError> {
    let (host, port) = match address.split_once(':') {
        None => (address, default_port),
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| AddressError::InvalidPort(address.to_string()))?;
            if port == 0 {
                return Err(AddressError::InvalidPort(address.to_string()));
            }
            (host, port)
        }
    };

    if !host_regex().is_match(host) {
        return Err(AddressError::Malformed(address.to_string()));
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_applied() {
        assert_eq!(
            parse_address("example.com", 25565),
            Ok(("example.com".into(), 25565))
        );
    }

    #[test]
    fn explicit_port_parsed() {
        assert_eq!(
            parse_address("example.com:65535", 25565),
            Ok(("example.com".into(), 65535))
        );
        assert_eq!(
            parse_address("mc.hypixel.net:25566", 25565),
            Ok(("mc.hypixel.net".into(), 25566))
        );
    }

    #[test]
    fn port_out_of_range_rejected() {
        assert!(matches!(
            parse_address("example.com:70000", 25565),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_address("example.com:0", 25565),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_address("example.com:abc", 25565),
            Err(AddressError::InvalidPort(_))
        ));
    }

    #[test]
    fn host_shape_enforced() {
        // A single label has nowhere to resolve; require a dotted name.
        assert!(parse_address("localhost", 25565).is_err());
        assert!(parse_address("", 25565).is_err());
        assert!(parse_address("exa mple.com", 25565).is_err());
        // IPv6 literals are out of scope, bracketed or not.
        assert!(parse_address("::1", 25565).is_err());
        assert!(parse_address("[::1]:25565", 25565).is_err());
        // Dotted IPv4 literals pass the same shape rule.
        assert_eq!(
            parse_address("127.0.0.1:19132", 19132),
            Ok(("127.0.0.1".into(), 19132))
        );
    }

    #[test]
    fn only_first_colon_splits() {
        assert!(parse_address("example.com:25565:junk", 25565).is_err());
    }
}
