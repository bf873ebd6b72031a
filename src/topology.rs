use anyhow::{Context, ensure};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::warn;

/// One entry of the static routing table, serialized in the topology JSON
/// as `[interface, hop_count, [path...]]`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Route {
    pub interface: String,
    pub hop_count: u32,
    pub path: Vec<String>,
}

impl<'de> Deserialize<'de> for Route {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (interface, hop_count, path) = Deserialize::deserialize(deserializer)?;
        Ok(Self {
            interface,
            hop_count,
            path,
        })
    }
}

/// One way to reach a peer: its address on some interface, paired with the
/// local interface the route leaves through.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionOption {
    pub target_ip: Ipv4Addr,
    pub local_interface: String,
}

/// The static fleet description: routes between nodes and each node's
/// interface addresses. Both maps are ordered so "first neighbor" and
/// "first interface" are deterministic.
#[derive(Debug, Clone)]
pub struct Network {
    routes: BTreeMap<String, BTreeMap<String, Vec<Route>>>,
    ips: BTreeMap<String, BTreeMap<String, Ipv4Addr>>,
}

impl Network {
    /// Parse the two trusted topology inputs:
    /// `network_info = {src: {dst: [[iface, hops, [path...]], ...]}}` and
    /// `ip_map = {node: [[iface, ip], ...]}`.
    pub fn from_json(network_info: &str, ip_map: &str) -> anyhow::Result<Self> {
        let routes = serde_json::from_str(network_info).context("parse network info JSON")?;
        let raw: BTreeMap<String, Vec<(String, String)>> =
            serde_json::from_str(ip_map).context("parse IP map JSON")?;
        let mut ips = BTreeMap::new();
        for (node, interfaces) in raw {
            let mut by_interface = BTreeMap::new();
            for (interface, ip) in interfaces {
                let ip = ip
                    .parse()
                    .with_context(|| format!("invalid IP {ip} for {node}/{interface}"))?;
                by_interface.insert(interface, ip);
            }
            ips.insert(node, by_interface);
        }
        Ok(Self { routes, ips })
    }

    pub fn total_nodes(&self) -> usize {
        self.routes.len()
    }

    /// The node's primary address: its first interface's IP.
    pub fn node_ip(&self, node: &str) -> anyhow::Result<Ipv4Addr> {
        let interfaces = self
            .ips
            .get(node)
            .with_context(|| format!("no IPs found for node {node}"))?;
        let (_, ip) = interfaces
            .iter()
            .next()
            .with_context(|| format!("node {node} has no interfaces"))?;
        Ok(*ip)
    }

    /// All nodes reachable from `node` with hop count exactly 1, in name
    /// order. Routes that share a local interface to one destination are
    /// flagged; only the first is ever used.
    pub fn immediate_neighbors(&self, node: &str) -> anyhow::Result<Vec<String>> {
        let routes = self
            .routes
            .get(node)
            .with_context(|| format!("no routes found for {node}"))?;
        let mut neighbors = Vec::new();
        for (dest, routes) in routes {
            let mut interfaces = BTreeSet::new();
            for route in routes {
                if !interfaces.insert(route.interface.as_str()) {
                    warn!(
                        "multiple routes to {dest} share interface {}; extras are unused",
                        route.interface
                    );
                }
            }
            if routes.iter().any(|route| route.hop_count == 1) {
                neighbors.push(dest.clone());
            }
        }
        ensure!(!neighbors.is_empty(), "no one-hop neighbors found for {node}");
        Ok(neighbors)
    }

    /// Ways to reach `target` from `node`: each route crossed with the
    /// target's interface addresses, in declaration order.
    pub fn connection_options(
        &self,
        node: &str,
        target: &str,
    ) -> anyhow::Result<Vec<ConnectionOption>> {
        let routes = self
            .routes
            .get(node)
            .with_context(|| format!("no routes found from {node}"))?
            .get(target)
            .with_context(|| format!("no routes found to {target}"))?;
        let mut options = Vec::new();
        for route in routes {
            let Some(interfaces) = self.ips.get(target) else {
                continue;
            };
            for (_, ip) in interfaces {
                options.push(ConnectionOption {
                    target_ip: *ip,
                    local_interface: route.interface.clone(),
                });
            }
        }
        ensure!(
            !options.is_empty(),
            "no valid connection options found to {target}"
        );
        Ok(options)
    }

    /// Every node of the fleet except `node`, in name order.
    pub fn peers_of(&self, node: &str) -> Vec<String> {
        self.routes
            .keys()
            .filter(|name| name.as_str() != node)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
fn line_topology() -> Network {
    // src -- d1 -- d2
    let network_info = r#"{
        "src": {"d1": [["src-eth0", 1, ["src"]]], "d2": [["src-eth0", 2, ["src", "d1"]]]},
        "d1": {"src": [["d1-eth0", 1, ["d1"]]], "d2": [["d1-eth1", 1, ["d1"]]]},
        "d2": {"src": [["d2-eth0", 2, ["d2", "d1"]]], "d1": [["d2-eth0", 1, ["d2"]]]}
    }"#;
    let ip_map = r#"{
        "src": [["src-eth0", "10.0.0.1"]],
        "d1": [["d1-eth0", "10.0.0.2"], ["d1-eth1", "10.0.1.2"]],
        "d2": [["d2-eth0", "10.0.1.3"]]
    }"#;
    Network::from_json(network_info, ip_map).unwrap()
}

#[test]
fn parses_topology_and_counts_nodes() {
    let network = line_topology();
    assert_eq!(network.total_nodes(), 3);
    assert_eq!(network.node_ip("src").unwrap(), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
    // first interface in name order
    assert_eq!(network.node_ip("d1").unwrap(), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
}

#[test]
fn neighbors_are_one_hop_only() {
    let network = line_topology();
    assert_eq!(network.immediate_neighbors("d1").unwrap(), vec!["d2", "src"]);
    assert_eq!(network.immediate_neighbors("d2").unwrap(), vec!["d1"]);
    assert_eq!(network.immediate_neighbors("src").unwrap(), vec!["d1"]);
}

#[test]
fn connection_options_cross_routes_with_target_interfaces() {
    let network = line_topology();
    let options = network.connection_options("d2", "d1").unwrap();
    assert_eq!(options.len(), 2);
    assert_eq!(options[0].local_interface, "d2-eth0");
    assert_eq!(options[0].target_ip, "10.0.0.2".parse::<Ipv4Addr>().unwrap());

    assert!(network.connection_options("d2", "nope").is_err());
}

#[test]
fn peers_exclude_self() {
    let network = line_topology();
    assert_eq!(network.peers_of("d1"), vec!["d2", "src"]);
}
