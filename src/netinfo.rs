//! Local interface, gateway and routing-table helpers used to reach servers on
//! a different subnet.
//!
//! The Connector only talks to these through the [`NetworkInfo`] and
//! [`RouteMutator`] traits, so its retry logic can be exercised without
//! touching real interfaces or needing root.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::error::RouteError;

/// Prefix length of the fixed "same subnet" heuristic
pub const SUBNET_PREFIX_LEN: u8 = 16;

pub const PROC_NET_ROUTE: &str = "/proc/net/route";

/// One IPv4 address bound to a local interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalAddress {
    pub interface: String,
    pub ip: Ipv4Addr,
}

impl LocalAddress {
    pub fn new(interface: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            interface: interface.into(),
            ip,
        }
    }
}

/// A route the Connector tried to insert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteAttempt {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

impl RouteAttempt {
    /// The `ip route` invocation a user can run by hand
    pub fn manual_command(&self) -> String {
        format!("sudo ip route add {}", self)
    }
}

impl fmt::Display for RouteAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} via {}", self.network, self.prefix_len, self.gateway)
    }
}

/// Bitwise AND of address and mask
pub fn network_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & u32::from(mask))
}

/// Text form of [`network_address`]; malformed input yields `0.0.0.0`,
/// which callers must treat as an unknown network.
pub fn network_address_str(ip: &str, mask: &str) -> Ipv4Addr {
    match (ip.trim().parse::<Ipv4Addr>(), mask.trim().parse::<Ipv4Addr>()) {
        (Ok(ip), Ok(mask)) => network_address(ip, mask),
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

pub fn prefix_mask(bits: u8) -> Ipv4Addr {
    let bits = u32::from(bits.min(32));
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    Ipv4Addr::from(mask)
}

/// Network of `ip` under the fixed /16 heuristic
pub fn subnet_of(ip: Ipv4Addr) -> Ipv4Addr {
    network_address(ip, prefix_mask(SUBNET_PREFIX_LEN))
}

/// Pick the local address most likely to reach `target`.
///
/// Compatibility heuristic, not a reachability guarantee: first address in
/// the same /16, then first address sharing the leading octet, then the first
/// address at all. The leading-octet step compares whole octets rather than
/// the first three characters of the dotted text, so `1.2.3.4` matches any
/// `1.*` address.
pub fn find_matching_local(locals: &[LocalAddress], target: Ipv4Addr) -> Option<LocalAddress> {
    let target_net = subnet_of(target);
    locals
        .iter()
        .find(|l| subnet_of(l.ip) == target_net)
        .or_else(|| locals.iter().find(|l| l.ip.octets()[0] == target.octets()[0]))
        .or_else(|| locals.first())
        .cloned()
}

/// Extract the default gateway from the text of `/proc/net/route`.
///
/// Fields are whitespace separated; the gateway column is a little-endian
/// hex quartet, so `0101A8C0` is `192.168.1.1`.
pub fn parse_default_gateway(table: &str) -> Option<Ipv4Addr> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[1] != "00000000" {
            continue;
        }
        let Ok(raw) = u32::from_str_radix(fields[2], 16) else {
            continue;
        };
        let gateway = Ipv4Addr::from(raw.to_le_bytes());
        if gateway.is_unspecified() {
            continue;
        }
        return Some(gateway);
    }
    None
}

/// Source of interface and gateway facts
pub trait NetworkInfo: Send + Sync {
    /// Active non-loopback IPv4 addresses, in enumeration order
    fn local_ipv4_addresses(&self) -> io::Result<Vec<LocalAddress>>;

    fn default_gateway(&self) -> Option<Ipv4Addr>;
}

/// Privileged routing-table mutation
pub trait RouteMutator: Send + Sync {
    fn add_route(&self, route: &RouteAttempt) -> Result<(), RouteError>;
}

/// Reads the live host state
#[derive(Clone, Debug)]
pub struct SystemNetwork {
    route_table: PathBuf,
}

impl SystemNetwork {
    pub fn with_route_table(path: impl Into<PathBuf>) -> Self {
        Self {
            route_table: path.into(),
        }
    }
}

impl Default for SystemNetwork {
    fn default() -> Self {
        Self::with_route_table(PROC_NET_ROUTE)
    }
}

impl NetworkInfo for SystemNetwork {
    fn local_ipv4_addresses(&self) -> io::Result<Vec<LocalAddress>> {
        local_ipv4_addresses()
    }

    fn default_gateway(&self) -> Option<Ipv4Addr> {
        match std::fs::read_to_string(&self.route_table) {
            Ok(table) => parse_default_gateway(&table),
            Err(e) => {
                warn!("Error opening route table {}: {}", self.route_table.display(), e);
                None
            }
        }
    }
}

/// Enumerate active, non-loopback IPv4 interface addresses
#[cfg(unix)]
pub fn local_ipv4_addresses() -> io::Result<Vec<LocalAddress>> {
    use std::ffi::CStr;

    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut out = Vec::new();
    let mut cur = ifap;
    while !cur.is_null() {
        // SAFETY: `cur` walks the list returned by getifaddrs, freed below
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;

        if ifa.ifa_addr.is_null() || ifa.ifa_flags & (libc::IFF_UP as libc::c_uint) == 0 {
            continue;
        }
        let family = unsafe { (*ifa.ifa_addr).sa_family };
        if i32::from(family) != libc::AF_INET {
            continue;
        }
        let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
        let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        if ip.is_loopback() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
            .to_string_lossy()
            .into_owned();
        out.push(LocalAddress::new(name, ip));
    }

    unsafe { libc::freeifaddrs(ifap) };
    debug!("local IPv4 addresses: {:?}", out);
    Ok(out)
}

#[cfg(not(unix))]
pub fn local_ipv4_addresses() -> io::Result<Vec<LocalAddress>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface enumeration is not supported on this platform",
    ))
}

/// Inserts routes with `ip route add`; requires root
#[derive(Clone, Copy, Debug, Default)]
pub struct IpRouteMutator;

impl RouteMutator for IpRouteMutator {
    fn add_route(&self, route: &RouteAttempt) -> Result<(), RouteError> {
        add_route(route)
    }
}

#[cfg(unix)]
fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(unix)]
pub fn add_route(route: &RouteAttempt) -> Result<(), RouteError> {
    use std::process::{Command, Stdio};

    if !is_privileged() {
        return Err(RouteError::NeedsPrivilege {
            manual: route.manual_command(),
        });
    }

    let status = Command::new("ip")
        .args(["route", "add"])
        .arg(format!("{}/{}", route.network, route.prefix_len))
        .arg("via")
        .arg(route.gateway.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(RouteError::Spawn)?;

    if !status.success() {
        return Err(RouteError::Rejected {
            manual: route.manual_command(),
        });
    }

    info!("Added route to {}", route);
    Ok(())
}

#[cfg(not(unix))]
pub fn add_route(_route: &RouteAttempt) -> Result<(), RouteError> {
    Err(RouteError::Unsupported)
}
