use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use super::error::Error;

/// An allocatable range: a canonical CIDR, optional narrowing bounds and
/// excluded sub-CIDRs. Offsets are relative to the network address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    cidr: IpNet,
    range_start: Option<IpAddr>,
    range_end: Option<IpAddr>,
    exclude: Vec<IpNet>,
}

impl Range {
    /// Accepts `addr/prefix` and `start-end/prefix` notations. Leading zeros
    /// in octets and hextets are tolerated. The stored CIDR is truncated to
    /// its network address.
    pub fn parse(s: &str) -> Result<Range, Error> {
        let s = s.trim();
        let (addrs, prefix) = s
            .rsplit_once('/')
            .ok_or_else(|| Error::InvalidRange(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidRange(s.to_string()))?;

        match split_bounds(addrs) {
            Some((start, end)) => {
                let start = parse_addr(start)?;
                let end = parse_addr(end)?;
                let cidr = IpNet::new(start, prefix)
                    .map_err(|_| Error::InvalidRange(s.to_string()))?
                    .trunc();
                if !cidr.contains(&end) {
                    return Err(Error::InvalidRange(s.to_string()));
                }
                if addr_bits(&start) > addr_bits(&end) {
                    return Err(Error::InvalidRange(s.to_string()));
                }
                Ok(Range {
                    cidr,
                    range_start: Some(start),
                    range_end: Some(end),
                    exclude: Vec::new(),
                })
            }
            None => {
                let addr = parse_addr(addrs)?;
                let cidr = IpNet::new(addr, prefix)
                    .map_err(|_| Error::InvalidRange(s.to_string()))?
                    .trunc();
                Ok(Range {
                    cidr,
                    range_start: None,
                    range_end: None,
                    exclude: Vec::new(),
                })
            }
        }
    }

    pub fn with_bounds(
        mut self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Range, Error> {
        if let Some(start) = start {
            let start = parse_addr(start)?;
            if !self.cidr.contains(&start) {
                return Err(Error::NotContains);
            }
            self.range_start = Some(start);
        }
        if let Some(end) = end {
            let end = parse_addr(end)?;
            if !self.cidr.contains(&end) {
                return Err(Error::NotContains);
            }
            self.range_end = Some(end);
        }
        if let (Some(start), Some(end)) = (self.range_start, self.range_end) {
            if addr_bits(&start) > addr_bits(&end) {
                return Err(Error::InvalidRange(format!("{start}-{end}")));
            }
        }
        Ok(self)
    }

    pub fn with_exclusions(mut self, exclude: &[String]) -> Result<Range, Error> {
        for e in exclude {
            let net = parse_cidr(e)?;
            if net.network().is_ipv4() != self.cidr.network().is_ipv4() {
                return Err(Error::ProtocolMismatch);
            }
            self.exclude.push(net);
        }
        Ok(self)
    }

    pub fn cidr(&self) -> &IpNet {
        &self.cidr
    }

    pub fn prefix_len(&self) -> u8 {
        self.cidr.prefix_len()
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.cidr, IpNet::V4(_))
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.cidr.contains(ip)
    }

    pub fn first_address(&self) -> IpAddr {
        self.cidr.network()
    }

    pub fn last_address(&self) -> IpAddr {
        self.cidr.broadcast()
    }

    pub fn offset_of(&self, ip: &IpAddr) -> Result<u128, Error> {
        if ip.is_ipv4() != self.is_ipv4() {
            return Err(Error::ProtocolMismatch);
        }
        if !self.cidr.contains(ip) {
            return Err(Error::NotContains);
        }
        Ok(addr_bits(ip) - addr_bits(&self.first_address()))
    }

    pub fn address_at(&self, offset: u128) -> Result<IpAddr, Error> {
        let bits = addr_bits(&self.first_address())
            .checked_add(offset)
            .ok_or(Error::NotContains)?;
        let ip = bits_to_addr(bits, self.is_ipv4())?;
        if !self.cidr.contains(&ip) {
            return Err(Error::NotContains);
        }
        Ok(ip)
    }

    /// The lowest and highest allocatable offsets after applying the bounds.
    /// IPv4 prefixes up to /30 withhold the network and broadcast addresses;
    /// /31, /32 and IPv6 ranges allocate the full interval.
    pub fn effective_interval(&self) -> Result<(u128, u128), Error> {
        let first = addr_bits(&self.first_address());
        let last = addr_bits(&self.last_address());
        let host_skip = self.is_ipv4() && self.prefix_len() <= 30;
        let mut lo = if host_skip { first + 1 } else { first };
        let mut hi = if host_skip { last - 1 } else { last };
        if let Some(start) = self.range_start {
            lo = lo.max(addr_bits(&start));
        }
        if let Some(end) = self.range_end {
            hi = hi.min(addr_bits(&end));
        }
        if lo > hi {
            return Err(Error::RangeExhausted);
        }
        Ok((lo - first, hi - first))
    }

    pub fn is_excluded(&self, offset: u128) -> bool {
        self.excluded_span_end(offset).is_some()
    }

    /// If `offset` falls in an exclusion, the last excluded offset of the
    /// widest exclusion covering it. Lets the allocator skip whole spans.
    pub fn excluded_span_end(&self, offset: u128) -> Option<u128> {
        let first = addr_bits(&self.first_address());
        let bits = first.checked_add(offset)?;
        self.exclude
            .iter()
            .filter(|e| addr_bits(&e.network()) <= bits && bits <= addr_bits(&e.broadcast()))
            .map(|e| addr_bits(&e.broadcast()) - first)
            .max()
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cidr)
    }
}

// "start-end" splits on the dash between addresses. IPv6 text never contains
// a dash, so a single split is unambiguous.
fn split_bounds(addrs: &str) -> Option<(&str, &str)> {
    addrs.split_once('-')
}

/// Strips leading zeros from each octet or hextet so that strings like
/// `00192.00168.01.209` survive the std parser.
pub fn sanitize_addr(addr: &str) -> String {
    if addr.contains('.') && !addr.contains(':') {
        addr.split('.')
            .map(strip_zeros)
            .collect::<Vec<_>>()
            .join(".")
    } else {
        addr.split(':')
            .map(strip_zeros)
            .collect::<Vec<_>>()
            .join(":")
    }
}

fn strip_zeros(group: &str) -> &str {
    if group.is_empty() {
        return group;
    }
    let trimmed = group.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

pub fn parse_addr(s: &str) -> Result<IpAddr, Error> {
    sanitize_addr(s.trim())
        .parse()
        .map_err(|_| Error::InvalidAddress(s.to_string()))
}

pub fn parse_cidr(s: &str) -> Result<IpNet, Error> {
    let s = s.trim();
    let (addr, prefix) = s
        .rsplit_once('/')
        .ok_or_else(|| Error::InvalidRange(s.to_string()))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::InvalidRange(s.to_string()))?;
    let addr = parse_addr(addr)?;
    IpNet::new(addr, prefix)
        .map(|net| net.trunc())
        .map_err(|_| Error::InvalidRange(s.to_string()))
}

fn addr_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}

fn bits_to_addr(bits: u128, v4: bool) -> Result<IpAddr, Error> {
    if v4 {
        let bits = u32::try_from(bits).map_err(|_| Error::NotContains)?;
        Ok(IpAddr::V4(Ipv4Addr::from(bits)))
    } else {
        Ok(IpAddr::V6(Ipv6Addr::from(bits)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest(
        input,
        expected,
        case("00192.00168.01.209", "192.168.1.209"),
        case("192.168.1.1", "192.168.1.1"),
        case("2001:0db8::0001", "2001:db8::1"),
        case("caa5::0", "caa5::0"),
        case("::1", "::1")
    )]
    fn works_sanitize_addr(input: &str, expected: &str) {
        assert_eq!(sanitize_addr(input), expected);
    }

    #[rstest(
        input,
        cidr,
        start,
        end,
        case("192.168.1.5/24", "192.168.1.0/24", None, None),
        case("00192.00168.1.0/24", "192.168.1.0/24", None, None),
        case(
            "192.168.1.11-192.168.1.23/24",
            "192.168.1.0/24",
            Some("192.168.1.11"),
            Some("192.168.1.23")
        ),
        case(
            "2001:db8:480:603d:0304:0403:0:0-2001:db8:480:603d:0304:0403:0:4/64",
            "2001:db8:480:603d::/64",
            Some("2001:db8:480:603d:304:403:0:0"),
            Some("2001:db8:480:603d:304:403:0:4")
        )
    )]
    fn works_range_parse(input: &str, cidr: &str, start: Option<&str>, end: Option<&str>) {
        let range = Range::parse(input).unwrap();
        assert_eq!(*range.cidr(), IpNet::from_str(cidr).unwrap());
        assert_eq!(
            range.range_start,
            start.map(|s| IpAddr::from_str(s).unwrap())
        );
        assert_eq!(range.range_end, end.map(|s| IpAddr::from_str(s).unwrap()));
    }

    #[rstest(
        input,
        case("192.168.1.0"),
        case("192.168.1.0/33"),
        case("192.168.1.23-192.168.1.11/24"),
        case("192.168.1.11-192.168.2.23/24")
    )]
    fn fails_range_parse(input: &str) {
        assert!(Range::parse(input).is_err());
    }

    #[rstest(
        range,
        addr,
        offset,
        case("10.0.0.0/24", "10.0.0.1", 1),
        case("10.0.0.0/24", "10.0.0.100", 100),
        case("153.128.0.0/13", "153.130.0.149", 131221),
        case("2001:db8::/32", "2001:db8::80", 128)
    )]
    fn works_offset_roundtrip(range: &str, addr: &str, offset: u128) {
        let range = Range::parse(range).unwrap();
        let addr = IpAddr::from_str(addr).unwrap();
        assert_eq!(range.offset_of(&addr).unwrap(), offset);
        assert_eq!(range.address_at(offset).unwrap(), addr);
    }

    #[test]
    fn fails_offset_outside_range() {
        let range = Range::parse("10.0.0.0/24").unwrap();
        let addr = IpAddr::from_str("10.0.1.0").unwrap();
        assert_eq!(range.offset_of(&addr), Err(Error::NotContains));
        assert_eq!(range.address_at(256), Err(Error::NotContains));
    }

    #[test]
    fn fails_offset_protocol_mismatch() {
        let range = Range::parse("10.0.0.0/24").unwrap();
        let addr = IpAddr::from_str("2001:db8::1").unwrap();
        assert_eq!(range.offset_of(&addr), Err(Error::ProtocolMismatch));
    }

    #[rstest(
        range,
        lo,
        hi,
        case("192.168.1.0/24", 1, 254),
        case("10.0.0.0/30", 1, 2),
        case("10.0.0.0/31", 0, 1),
        case("10.0.0.4/32", 0, 0),
        case("2001::0/116", 0, 4095),
        case("caa5::0/112", 0, 65535)
    )]
    fn works_effective_interval(range: &str, lo: u128, hi: u128) {
        let range = Range::parse(range).unwrap();
        assert_eq!(range.effective_interval().unwrap(), (lo, hi));
    }

    #[test]
    fn works_effective_interval_with_bounds() {
        let range = Range::parse("192.168.1.0/24")
            .unwrap()
            .with_bounds(Some("192.168.1.5"), Some("192.168.1.12"))
            .unwrap();
        assert_eq!(range.effective_interval().unwrap(), (5, 12));
    }

    #[test]
    fn fails_effective_interval_empty() {
        // /30 allocates offsets 1..=2; a range_start at the broadcast
        // address leaves nothing
        let range = Range::parse("10.0.0.0/30")
            .unwrap()
            .with_bounds(Some("10.0.0.3"), None)
            .unwrap();
        assert_eq!(range.effective_interval(), Err(Error::RangeExhausted));
    }

    #[test]
    fn fails_bounds_outside_cidr() {
        let res = Range::parse("192.168.1.0/24")
            .unwrap()
            .with_bounds(Some("192.168.2.5"), None);
        assert_eq!(res.unwrap_err(), Error::NotContains);
    }

    #[test]
    fn works_exclusion_spans() {
        let range = Range::parse("192.168.1.0/24")
            .unwrap()
            .with_exclusions(&["192.168.1.0/28".to_string(), "192.168.1.16/28".to_string()])
            .unwrap();
        assert!(range.is_excluded(0));
        assert!(range.is_excluded(15));
        assert_eq!(range.excluded_span_end(3), Some(15));
        assert_eq!(range.excluded_span_end(20), Some(31));
        assert!(!range.is_excluded(32));
    }

    #[test]
    fn works_exclusion_straddles_half_range() {
        let range = Range::parse("caa5::0/112")
            .unwrap()
            .with_exclusions(&["caa5::0/113".to_string()])
            .unwrap();
        assert_eq!(range.excluded_span_end(0), Some(0x7fff));
        assert!(!range.is_excluded(0x8000));
    }

    #[test]
    fn fails_exclusion_protocol_mismatch() {
        let res = Range::parse("192.168.1.0/24")
            .unwrap()
            .with_exclusions(&["2001:db8::/64".to_string()]);
        assert_eq!(res.unwrap_err(), Error::ProtocolMismatch);
    }

    #[test]
    fn works_canonical_display() {
        let range = Range::parse("192.168.1.5/24").unwrap();
        assert_eq!(range.to_string(), "192.168.1.0/24");
    }
}
