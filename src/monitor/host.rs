//! Host introspection
//!
//! Facts about the machine, gathered fresh on each registration
//! attempt. Rolling load averages come from the resource monitor
//! instead.

use std::net::{IpAddr, ToSocketAddrs, UdpSocket};

use sysinfo::System;

const MB: u64 = 1024 * 1024;

/// Hardware and OS facts advertised at registration.
#[derive(Debug, Clone)]
pub struct HostInfo {
    /// Machine hostname.
    pub hostname: String,
    /// Best-guess outbound IP address.
    pub ip_address: String,
    /// Logical CPU count.
    pub cpu_cores: usize,
    /// CPU brand string.
    pub cpu_model: String,
    /// Total physical memory, in MB.
    pub total_memory_mb: u64,
    /// Memory available at collection time, in MB.
    pub available_memory_mb: u64,
    /// OS name and version, human readable.
    pub operating_system: String,
}

impl HostInfo {
    /// Gathers host facts.
    #[must_use]
    pub fn collect() -> Self {
        let system = System::new_all();

        let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());
        let cpu_model = system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let os_name =
            System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
        let os_version = System::os_version().unwrap_or_default();

        Self {
            ip_address: resolve_ip(&hostname),
            hostname,
            cpu_cores: system.cpus().len(),
            cpu_model,
            total_memory_mb: system.total_memory() / MB,
            available_memory_mb: system.available_memory() / MB,
            operating_system: format!("{os_name} {os_version}").trim().to_string(),
        }
    }
}

/// Resolves the host's own address, preferring what the hostname
/// resolves to and falling back to the outbound route address.
fn resolve_ip(hostname: &str) -> String {
    if let Ok(addrs) = (hostname, 0u16).to_socket_addrs() {
        let mut addrs: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        addrs.sort_by_key(|ip| !ip.is_ipv4());
        if let Some(ip) = addrs.into_iter().find(|ip| !ip.is_loopback()) {
            return ip.to_string();
        }
    }

    outbound_ip().unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Address the default route would use, discovered without sending
/// anything.
fn outbound_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_reports_plausible_host() {
        let host = HostInfo::collect();
        assert!(!host.hostname.is_empty());
        assert!(!host.ip_address.is_empty());
        assert!(host.cpu_cores > 0);
        assert!(host.total_memory_mb > 0);
        assert!(host.available_memory_mb <= host.total_memory_mb);
        assert!(!host.operating_system.is_empty());
    }

    #[test]
    fn test_resolve_ip_never_empty() {
        let ip = resolve_ip("definitely-not-a-real-host-name-xyz");
        assert!(!ip.is_empty());
        assert!(ip.parse::<IpAddr>().is_ok());
    }
}
