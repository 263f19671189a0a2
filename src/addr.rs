//! Socket address and bind specification parsing.
//!
//! Endpoints are written `ip:port`, with IPv6 literals wrapped in
//! brackets (`[::1]:8080`). Bind specifications additionally allow a
//! port range: `ip:minport-maxport`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A bind specification: one IP address and an inclusive port range.
///
/// A single-port form parses to `minport == maxport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindSpec {
    pub ip: IpAddr,
    pub minport: u16,
    pub maxport: u16,
}

impl BindSpec {
    /// Number of ports covered by the range.
    pub fn port_count(&self) -> usize {
        (self.maxport - self.minport) as usize + 1
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minport == self.maxport {
            write!(f, "{}", SocketAddr::new(self.ip, self.minport))
        } else {
            match self.ip {
                IpAddr::V4(ip) => write!(f, "{}:{}-{}", ip, self.minport, self.maxport),
                IpAddr::V6(ip) => write!(f, "[{}]:{}-{}", ip, self.minport, self.maxport),
            }
        }
    }
}

/// Address parsing errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// No colon separating the address from the port.
    MissingPort(String),
    /// Empty address part in front of the port.
    MissingAddress(String),
    /// A `[` without a matching `]` before the port (or vice versa).
    UnmatchedBracket(String),
    /// The address is neither an IPv4 nor an IPv6 literal.
    InvalidAddress(String),
    /// The port is not a decimal number in [1, 65535].
    InvalidPort(String),
    /// A port range with `minport > maxport`.
    InvalidRange(u16, u16),
}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrError::MissingPort(s) => write!(f, "port is missing in '{s}'"),
            AddrError::MissingAddress(s) => write!(f, "address is missing in '{s}'"),
            AddrError::UnmatchedBracket(s) => write!(f, "unmatched bracket in '{s}'"),
            AddrError::InvalidAddress(s) => write!(f, "invalid IP address '{s}'"),
            AddrError::InvalidPort(s) => write!(f, "invalid port '{s}' (expected 1 - 65535)"),
            AddrError::InvalidRange(min, max) => {
                write!(f, "invalid port range {min} - {max}")
            }
        }
    }
}

impl std::error::Error for AddrError {}

/// Parse an `ip:port` / `[v6]:port` endpoint.
pub fn parse_endpoint(s: &str) -> Result<SocketAddr, AddrError> {
    let (host, port) = split_host_port(s)?;
    let ip = parse_ip(host)?;
    let port = parse_port(port)?;
    Ok(SocketAddr::new(ip, port))
}

/// Parse a bind specification: `ip:port` or `ip:minport-maxport`.
pub fn parse_bind_spec(s: &str) -> Result<BindSpec, AddrError> {
    let (host, ports) = split_host_port(s)?;
    let ip = parse_ip(host)?;

    match ports.split_once('-') {
        None => {
            let port = parse_port(ports)?;
            Ok(BindSpec {
                ip,
                minport: port,
                maxport: port,
            })
        }
        Some((min, max)) => {
            let minport = parse_port(min)?;
            let maxport = parse_port(max)?;
            if minport <= maxport {
                Ok(BindSpec {
                    ip,
                    minport,
                    maxport,
                })
            } else {
                Err(AddrError::InvalidRange(minport, maxport))
            }
        }
    }
}

/// Split on the last colon and strip brackets from the host part.
///
/// The last colon rule is what makes bracketed IPv6 literals parse:
/// `[::1]:8080` splits into `::1` and `8080`.
fn split_host_port(s: &str) -> Result<(&str, &str), AddrError> {
    let colon = s.rfind(':').ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
    let (host, port) = (&s[..colon], &s[colon + 1..]);

    if host.is_empty() {
        return Err(AddrError::MissingAddress(s.to_string()));
    }

    if let Some(inner) = host.strip_prefix('[') {
        match inner.strip_suffix(']') {
            Some(inner) if !inner.is_empty() => Ok((inner, port)),
            _ => Err(AddrError::UnmatchedBracket(s.to_string())),
        }
    } else if host.ends_with(']') {
        Err(AddrError::UnmatchedBracket(s.to_string()))
    } else {
        Ok((host, port))
    }
}

/// Parse an IP literal, trying IPv4 before IPv6.
fn parse_ip(s: &str) -> Result<IpAddr, AddrError> {
    s.parse::<Ipv4Addr>()
        .map(IpAddr::V4)
        .or_else(|_| s.parse::<Ipv6Addr>().map(IpAddr::V6))
        .map_err(|_| AddrError::InvalidAddress(s.to_string()))
}

/// Parse a decimal port in [1, 65535].
///
/// Only ASCII digits are accepted; no sign, no whitespace. Overflow past
/// 65535 is rejected rather than wrapped, and port 0 is refused.
fn parse_port(s: &str) -> Result<u16, AddrError> {
    if s.is_empty() {
        return Err(AddrError::InvalidPort(s.to_string()));
    }

    let mut n: u32 = 0;
    for b in s.bytes() {
        if !b.is_ascii_digit() {
            return Err(AddrError::InvalidPort(s.to_string()));
        }
        n = n * 10 + u32::from(b - b'0');
        if n > u32::from(u16::MAX) {
            return Err(AddrError::InvalidPort(s.to_string()));
        }
    }

    if n == 0 {
        return Err(AddrError::InvalidPort(s.to_string()));
    }

    Ok(n as u16)
}
