use local_ip_address::list_afinet_netifas;
use std::net::IpAddr;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over `level`.
pub fn init_log(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Addresses a remote peer could use to reach this host.
///
/// Lists every IPv4 interface address, skipping loopback and link-local
/// ones. Returns an empty list when interfaces cannot be enumerated.
pub fn host_addresses() -> Vec<IpAddr> {
    let mut addrs: Vec<IpAddr> = vec![];
    if let Ok(network_interfaces) = list_afinet_netifas() {
        for (name, ip) in network_interfaces {
            debug!("iface: {} / {:?}", name, ip);
            if let IpAddr::V4(ip4) = ip {
                if !ip4.is_loopback() && !ip4.is_link_local() && !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
        }
    }

    addrs
}
