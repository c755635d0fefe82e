//! Initial peer set: hard-coded addresses plus two DNS seeds.

use std::net::IpAddr;

use bitmessage_governor::Governor;

/// Known long-lived nodes. The duplicate entry is kept as a separate peer.
pub const BOOTSTRAP_PEERS: [(&str, u16); 7] = [
    ("109.91.57.2", 8443),
    ("66.65.120.151", 8080),
    ("188.18.69.115", 8443),
    ("204.236.246.212", 8444),
    ("85.177.81.73", 8444),
    ("78.81.56.239", 8444),
    ("204.236.246.212", 8444),
];

/// DNS names whose A records are nodes listening on the paired port.
pub const DNS_SEEDS: [(&str, u16); 2] = [
    ("bootstrap8080.bitmessage.org", 8080),
    ("bootstrap8444.bitmessage.org", 8444),
];

/// Resolve every DNS seed. Failures are logged and skipped.
///
/// Returns `(host, port)` pairs, unique per seed. Only IPv4 results are
/// kept since the wire address format carries IPv4 only.
pub async fn resolve_dns_seeds() -> Vec<(String, u16)> {
    let mut out = Vec::new();
    for (name, port) in DNS_SEEDS {
        match tokio::net::lookup_host((name, port)).await {
            Ok(addrs) => {
                let ips = unique_ipv4(addrs.map(|a| a.ip()));
                tracing::debug!(seed = name, found = ips.len(), "dns seed resolved");
                out.extend(ips.into_iter().map(|ip| (ip.to_string(), port)));
            }
            Err(e) => {
                tracing::debug!(seed = name, "dns seed resolution failed: {e}");
            }
        }
    }
    out
}

/// Add the hard-coded peers and the resolved seed hosts to the registry.
/// Returns the number of peers added.
pub fn seed_registry(governor: &mut Governor, resolved: &[(String, u16)], services: u64) -> usize {
    for (host, port) in BOOTSTRAP_PEERS {
        governor.add_peer(host, port, services);
    }
    for (host, port) in resolved {
        governor.add_peer(host.clone(), *port, services);
    }
    BOOTSTRAP_PEERS.len() + resolved.len()
}

/// Resolve the DNS seeds, then seed the registry. Bootstrapped peers are
/// assumed to provide the services we provide.
pub async fn bootstrap(governor: &mut Governor, services: u64) -> usize {
    let resolved = resolve_dns_seeds().await;
    let added = seed_registry(governor, &resolved, services);
    tracing::info!(
        hard_coded = BOOTSTRAP_PEERS.len(),
        from_dns = resolved.len(),
        "bootstrap complete"
    );
    added
}

fn unique_ipv4(ips: impl Iterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut out: Vec<IpAddr> = Vec::new();
    for ip in ips.filter(IpAddr::is_ipv4) {
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}
