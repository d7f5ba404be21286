//! IPv4 subnet arithmetic for addressing decisions

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::Error;

/// Ranges no cluster network may overlap
pub const RESERVED_RANGES: [&str; 4] = ["0.0.0.0/8", "127.0.0.0/8", "169.254.0.0/16", "224.0.0.0/4"];

/// Parse an IPv4 CIDR, requiring the address to be the network address
pub fn parse_cidr(value: &str) -> Result<Ipv4Net, Error> {
    let net: Ipv4Net = value
        .parse()
        .map_err(|e| Error::validation(format!("'{}' is not a valid IPv4 CIDR: {}", value, e)))?;
    if net.addr() != net.network() {
        return Err(Error::validation(format!(
            "'{}' has host bits set; expected {}",
            value,
            net.trunc()
        )));
    }
    Ok(net)
}

/// True when two networks share any address
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// The first reserved range `net` overlaps, if any
pub fn reserved_overlap(net: &Ipv4Net) -> Option<Ipv4Net> {
    RESERVED_RANGES
        .iter()
        .filter_map(|r| r.parse::<Ipv4Net>().ok())
        .find(|r| overlaps(net, r))
}

/// Internal load-balancer address for a control plane subnet
///
/// The second-to-last usable address: broadcast minus two. For
/// `10.0.0.0/24` this is `10.0.0.253`; for a /30 it is the first host.
/// /31 and /32 have no such address.
pub fn load_balancer_address(subnet: &Ipv4Net) -> Result<Ipv4Addr, Error> {
    if subnet.prefix_len() > 30 {
        return Err(Error::validation(format!(
            "subnet {} is too small for an internal load balancer",
            subnet
        )));
    }
    let broadcast = u32::from(subnet.broadcast());
    Ok(Ipv4Addr::from(broadcast - 2))
}
