use std::net::IpAddr;

/// Convert bytes to a trimmed string, handling UTF-8 conversion errors gracefully
pub fn bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Format an address and port as `host:port`, bracketing IPv6 literals
pub fn format_address(address: IpAddr, port: u16) -> String {
    match address {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}
