//! Address parsing and representation-insensitive comparison.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub fn parse_ip(s: &str) -> Result<IpAddr, String> {
    s.trim().parse::<IpAddr>().map_err(|_| format!("{:?} is not an ip address", s))
}

pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, String> {
    match parse_ip(s)? {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(format!("{:?} is not an ipv4 address", s)),
    }
}

pub fn parse_ipv6(s: &str) -> Result<Ipv6Addr, String> {
    match parse_ip(s)? {
        IpAddr::V6(v6) => Ok(v6),
        IpAddr::V4(_) => Err(format!("{:?} is not an ipv6 address", s)),
    }
}

/// `addr/len` with the length checked against the address family.
pub fn parse_prefix(s: &str) -> Result<(IpAddr, u8), String> {
    let (addr, len) = s.trim().split_once('/').ok_or_else(|| format!("{:?} is missing a prefix length", s))?;
    let addr = parse_ip(addr)?;
    let len: u8 = len.trim().parse().map_err(|_| format!("{:?} has an invalid prefix length", s))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if len > max {
        return Err(format!("{:?} prefix length exceeds {}", s, max));
    }
    Ok((addr, len))
}

fn mask(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let m = if len == 0 { 0 } else { u32::MAX << (32 - u32::from(len)) };
            IpAddr::V4(Ipv4Addr::from(bits & m))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let m = if len == 0 { 0 } else { u128::MAX << (128 - u32::from(len)) };
            IpAddr::V6(Ipv6Addr::from(bits & m))
        }
    }
}

pub fn trimmed_lowered(s: &str) -> String { s.trim().to_lowercase() }

pub fn equivalent_trimmed_lowered(a: &str, b: &str) -> bool { trimmed_lowered(a) == trimmed_lowered(b) }

/// Same address regardless of textual form; unparsable input falls back to
/// trimmed, case-insensitive text comparison.
pub fn equivalent_ip(a: &str, b: &str) -> bool {
    match (parse_ip(a), parse_ip(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => equivalent_trimmed_lowered(a, b),
    }
}

pub fn canonical_ip(s: &str) -> String {
    parse_ip(s).map(|ip| ip.to_string()).unwrap_or_else(|_| trimmed_lowered(s))
}

/// Network prefix with host bits cleared, e.g. `10.1.2.3/24` -> `10.1.2.0/24`.
pub fn canonical_network(s: &str) -> String {
    match parse_prefix(s) {
        Ok((addr, len)) => format!("{}/{}", mask(addr, len), len),
        Err(_) => trimmed_lowered(s),
    }
}

/// Interface address keeping host bits.
pub fn canonical_prefix(s: &str) -> String {
    match parse_prefix(s) {
        Ok((addr, len)) => format!("{}/{}", addr, len),
        Err(_) => trimmed_lowered(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_forms_compare_equal() {
        assert!(equivalent_ip("A::1", "a:0:0::0001"));
        assert!(!equivalent_ip("a::1", "a::2"));
        assert!(equivalent_ip(" not-an-ip ", "NOT-AN-IP"));
    }

    #[test]
    fn network_canonicalization_clears_host_bits() {
        assert_eq!(canonical_network("10.1.2.3/24"), "10.1.2.0/24");
        assert_eq!(canonical_network("2001:DB8::1/64"), "2001:db8::/64");
        assert_eq!(canonical_network("0.0.0.0/0"), "0.0.0.0/0");
        assert_eq!(canonical_prefix("10.1.2.3/24"), "10.1.2.3/24");
    }

    #[test]
    fn prefix_length_is_bounded() {
        assert!(parse_prefix("10.0.0.0/33").is_err());
        assert!(parse_prefix("10.0.0.0").is_err());
        assert!(parse_prefix("::/128").is_ok());
    }

    #[test]
    fn family_specific_parsers() {
        assert!(parse_ipv4("10.0.0.1").is_ok());
        assert!(parse_ipv4("::1").is_err());
        assert!(parse_ipv6("10.0.0.1").is_err());
    }
}
