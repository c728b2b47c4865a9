use crate::utils::exec::CommandExecutor;
use crate::utils::string::bytes_to_string;
use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

/// Interface and source address of the IPv4 default route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub interface: String,
    pub source: Option<IpAddr>,
}

/// Parse `ip -4 route show default`
///
/// e.g. `default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.50 metric 100`.
/// The first default route wins when there are several.
pub fn parse_default_route(output: &str) -> Option<DefaultRoute> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("default"))?;

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let value_after = |key: &str| {
        tokens
            .windows(2)
            .find(|pair| pair[0] == key)
            .map(|pair| pair[1])
    };

    let interface = value_after("dev")?.to_string();
    let source = value_after("src").and_then(|s| s.parse().ok());
    Some(DefaultRoute { interface, source })
}

/// Parse the first address out of `ip -4 -o addr show dev <iface>`
///
/// e.g. `2: eth0    inet 192.168.1.50/24 brd 192.168.1.255 scope global eth0`
pub fn parse_interface_address(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "inet")?;
        tokens.next()?.split('/').next()?.parse().ok()
    })
}

/// Detect the default route, resolving its source address if the route omits one
pub fn detect_default_route<E: CommandExecutor + ?Sized>(exec: &E) -> Result<(String, IpAddr)> {
    let output = exec
        .execute_simple("ip", &["-4", "route", "show", "default"])
        .context("Failed to query the routing table")?;
    let route = parse_default_route(&bytes_to_string(&output.stdout))
        .context("No IPv4 default route found; cannot choose an advertise address")?;

    if let Some(source) = route.source {
        return Ok((route.interface, source));
    }

    let output = exec
        .execute_simple("ip", &["-4", "-o", "addr", "show", "dev", &route.interface])
        .with_context(|| format!("Failed to query addresses of {}", route.interface))?;
    let address = parse_interface_address(&bytes_to_string(&output.stdout)).with_context(|| {
        format!(
            "Default route interface {} has no IPv4 address",
            route.interface
        )
    })?;
    Ok((route.interface, address))
}

/// Get the current hostname from the system
pub fn get_current_hostname() -> Result<String> {
    let hostname = whoami::fallible::hostname().context("Failed to get hostname")?;
    let hostname = hostname.trim().to_lowercase();
    if hostname.is_empty() {
        anyhow::bail!("System hostname is empty");
    }
    Ok(hostname)
}

/// Check whether something accepts TCP connections on addr:port
pub fn is_port_open(address: IpAddr, port: u16, timeout: Duration) -> bool {
    TcpStream::connect_timeout(&SocketAddr::new(address, port), timeout).is_ok()
}
