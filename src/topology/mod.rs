//! Topology service.
//!
//! A validated, read-only labeled graph of the fabric, loaded once at
//! startup from a YAML file and shared by immutable reference. Blast radius
//! and SPOF answers are precomputed at load so the correlator's queries are
//! plain map lookups.
//!
//! File format:
//! ```yaml
//! devices:
//!   spine-01: { role: spine, neighbors: [tor-01, tor-02], priority: critical }
//!   tor-01:   { role: tor, neighbors: [leaf-01] }
//! bgp_peers:
//!   - [spine-01, tor-01]
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Device roles in the fabric. `Unknown` is synthesized at runtime for
/// topology misses and is rejected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Spine,
    Tor,
    Leaf,
    Server,
    Rr,
    Edge,
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Spine => "spine",
            Role::Tor => "tor",
            Role::Leaf => "leaf",
            Role::Server => "server",
            Role::Rr => "rr",
            Role::Edge => "edge",
            Role::Unknown => "unknown",
        }
    }

    /// Fabric layer this role lives in.
    pub fn layer(&self) -> Option<Layer> {
        match self {
            Role::Edge => Some(Layer::Edge),
            Role::Rr => Some(Layer::Core),
            Role::Spine => Some(Layer::Spine),
            Role::Tor => Some(Layer::Tor),
            Role::Leaf => Some(Layer::Leaf),
            Role::Server => Some(Layer::Server),
            Role::Unknown => None,
        }
    }

    /// Tier used to orient downstream edges: lower ranks sit above higher
    /// ranks (edge/rr above spine, spine above tor, and so on).
    fn rank(&self) -> u8 {
        match self {
            Role::Edge | Role::Rr => 0,
            Role::Spine => 1,
            Role::Tor => 2,
            Role::Leaf => 3,
            Role::Server => 4,
            Role::Unknown => u8::MAX,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fabric layers reported in alert triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Edge,
    Core,
    Spine,
    Tor,
    Leaf,
    Server,
}

/// Static operator-assigned importance, carried through to triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceConfig {
    role: Role,
    #[serde(default)]
    neighbors: Vec<String>,
    #[serde(default)]
    priority: DevicePriority,
}

#[derive(Debug, Clone, Deserialize)]
struct TopologyFile {
    devices: BTreeMap<String, DeviceConfig>,
    #[serde(default)]
    bgp_peers: Vec<(String, String)>,
}

/// One device with its precomputed triage answers.
#[derive(Debug, Clone)]
pub struct DeviceNode {
    pub id: String,
    pub role: Role,
    pub layer: Option<Layer>,
    pub neighbors: Vec<String>,
    pub priority: DevicePriority,
    pub blast_radius: usize,
    pub affected_layers: BTreeSet<Layer>,
    pub spof: bool,
}

/// The loaded fabric graph. Immutable after [`Topology::load`].
#[derive(Debug)]
pub struct Topology {
    nodes: HashMap<String, DeviceNode>,
    /// Undirected adjacency: physical neighbors plus BGP sessions.
    adjacency: HashMap<String, BTreeSet<String>>,
}

impl Topology {
    /// Load and validate a topology file. Any validation failure is fatal.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!("failed to read topology file: {}", path.as_ref().display())
        })?;
        Self::from_yaml(&content).with_context(|| {
            format!("invalid topology file: {}", path.as_ref().display())
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: TopologyFile =
            serde_yaml::from_str(content).context("failed to parse topology YAML")?;
        Self::build(file)
    }

    fn build(file: TopologyFile) -> Result<Self> {
        if file.devices.is_empty() {
            bail!("topology declares no devices");
        }

        // Structural validation before any graph work.
        for (id, entry) in &file.devices {
            if entry.role == Role::Unknown {
                bail!("device {id} has role 'unknown'; roles must be one of spine|tor|leaf|server|rr|edge");
            }
            for n in &entry.neighbors {
                if n == id {
                    bail!("device {id} lists itself as a neighbor");
                }
                if !file.devices.contains_key(n) {
                    bail!("device {id} references undeclared neighbor {n}");
                }
            }
        }
        for (a, b) in &file.bgp_peers {
            if a == b {
                bail!("bgp_peers entry pairs {a} with itself");
            }
            for id in [a, b] {
                if !file.devices.contains_key(id) {
                    bail!("bgp_peers references undeclared device {id}");
                }
            }
        }

        let mut adjacency: HashMap<String, BTreeSet<String>> = file
            .devices
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (id, entry) in &file.devices {
            for n in &entry.neighbors {
                adjacency.get_mut(id).expect("declared above").insert(n.clone());
                adjacency.get_mut(n).expect("validated above").insert(id.clone());
            }
        }
        for (a, b) in &file.bgp_peers {
            adjacency.get_mut(a).expect("validated above").insert(b.clone());
            adjacency.get_mut(b).expect("validated above").insert(a.clone());
        }

        let roles: HashMap<String, Role> =
            file.devices.iter().map(|(id, s)| (id.clone(), s.role)).collect();

        let mut nodes = HashMap::with_capacity(file.devices.len());
        for (id, entry) in &file.devices {
            let downstream = downstream_reachable(id, &adjacency, &roles);
            let mut affected_layers = BTreeSet::new();
            if let Some(layer) = entry.role.layer() {
                affected_layers.insert(layer);
            }
            for d in &downstream {
                if let Some(layer) = roles[d].layer() {
                    affected_layers.insert(layer);
                }
            }
            nodes.insert(
                id.clone(),
                DeviceNode {
                    id: id.clone(),
                    role: entry.role,
                    layer: entry.role.layer(),
                    neighbors: adjacency[id].iter().cloned().collect(),
                    priority: entry.priority,
                    // A device with nothing downstream still takes itself out.
                    blast_radius: downstream.len().max(1),
                    affected_layers,
                    spof: false,
                },
            );
        }

        let mut topology = Self { nodes, adjacency };
        let spof_devices = topology.compute_spofs(&roles);
        for id in spof_devices {
            if let Some(node) = topology.nodes.get_mut(&id) {
                node.spof = true;
            }
        }
        Ok(topology)
    }

    /// Devices whose removal disconnects some server from every spine.
    fn compute_spofs(&self, roles: &HashMap<String, Role>) -> Vec<String> {
        let servers: Vec<&String> =
            roles.iter().filter(|(_, r)| **r == Role::Server).map(|(id, _)| id).collect();
        let has_spine = roles.values().any(|r| *r == Role::Spine);
        if servers.is_empty() || !has_spine {
            return Vec::new();
        }

        let mut spofs = Vec::new();
        for removed in self.nodes.keys() {
            if roles[removed] == Role::Server {
                continue;
            }
            let cut = servers.iter().any(|server| {
                *server != removed
                    && !reaches_role(
                        server.as_str(),
                        Role::Spine,
                        &self.adjacency,
                        roles,
                        Some(removed.as_str()),
                    )
            });
            if cut {
                spofs.push(removed.clone());
            }
        }
        spofs
    }

    pub fn node(&self, device: &str) -> Option<&DeviceNode> {
        self.nodes.get(device)
    }

    pub fn contains(&self, device: &str) -> bool {
        self.nodes.contains_key(device)
    }

    pub fn role(&self, device: &str) -> Role {
        self.nodes.get(device).map_or(Role::Unknown, |n| n.role)
    }

    pub fn neighbors(&self, device: &str) -> impl Iterator<Item = &str> {
        self.adjacency.get(device).into_iter().flatten().map(String::as_str)
    }

    /// Downstream-reachable device count, cached at load. Unknown devices
    /// report a blast radius of 1.
    pub fn blast_radius(&self, device: &str) -> usize {
        self.nodes.get(device).map_or(1, |n| n.blast_radius)
    }

    pub fn affected_layers(&self, device: &str) -> BTreeSet<Layer> {
        self.nodes.get(device).map(|n| n.affected_layers.clone()).unwrap_or_default()
    }

    pub fn is_spof(&self, device: &str) -> bool {
        self.nodes.get(device).is_some_and(|n| n.spof)
    }

    /// Whether `a` and `b` are within `hops` adjacency steps of each other.
    /// Zero hops means only the device itself.
    pub fn within_hops(&self, a: &str, b: &str, hops: usize) -> bool {
        if a == b {
            return true;
        }
        if hops == 0 {
            return false;
        }
        let mut visited = HashSet::from([a]);
        let mut frontier = vec![a];
        for _ in 0..hops {
            let mut next = Vec::new();
            for dev in frontier {
                for n in self.neighbors(dev) {
                    if n == b {
                        return true;
                    }
                    if visited.insert(n) {
                        next.push(n);
                    }
                }
            }
            frontier = next;
        }
        false
    }

    pub fn device_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Devices reachable from `start` by walking strictly down the fabric
/// tiers (spine toward server), excluding `start` itself.
fn downstream_reachable(
    start: &str,
    adjacency: &HashMap<String, BTreeSet<String>>,
    roles: &HashMap<String, Role>,
) -> BTreeSet<String> {
    let mut reached = BTreeSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(current) = queue.pop_front() {
        let current_rank = roles[&current].rank();
        for next in adjacency.get(&current).into_iter().flatten() {
            if roles[next].rank() > current_rank
                && next != start
                && reached.insert(next.clone())
            {
                queue.push_back(next.clone());
            }
        }
    }
    reached
}

/// Undirected reachability test to any device of `target` role, optionally
/// treating one device as removed.
fn reaches_role(
    start: &str,
    target: Role,
    adjacency: &HashMap<String, BTreeSet<String>>,
    roles: &HashMap<String, Role>,
    removed: Option<&str>,
) -> bool {
    let mut visited = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        for next in adjacency.get(current).into_iter().flatten() {
            let next = next.as_str();
            if Some(next) == removed || !visited.insert(next) {
                continue;
            }
            if roles[next] == target {
                return true;
            }
            queue.push_back(next);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two spines over two ToRs over two leaves, each leaf with a pair of
    /// servers; tor-02 has a single uplink so spine-02 side is thinner.
    fn fabric_yaml() -> &'static str {
        r#"
devices:
  spine-01: { role: spine, neighbors: [tor-01, tor-02], priority: critical }
  spine-02: { role: spine, neighbors: [tor-01], priority: critical }
  tor-01:   { role: tor, neighbors: [leaf-01], priority: high }
  tor-02:   { role: tor, neighbors: [leaf-02], priority: high }
  leaf-01:  { role: leaf, neighbors: [server-01, server-02] }
  leaf-02:  { role: leaf, neighbors: [server-03, server-04] }
  server-01: { role: server }
  server-02: { role: server }
  server-03: { role: server }
  server-04: { role: server }
bgp_peers:
  - [spine-01, tor-01]
  - [spine-01, tor-02]
  - [spine-02, tor-01]
"#
    }

    #[test]
    fn test_load_and_lookup() {
        let topo = Topology::from_yaml(fabric_yaml()).unwrap();
        assert_eq!(topo.device_count(), 10);
        assert_eq!(topo.role("spine-01"), Role::Spine);
        assert_eq!(topo.role("nonexistent"), Role::Unknown);
        assert!(topo.neighbors("leaf-01").any(|n| n == "server-01"));
    }

    #[test]
    fn test_blast_radius_descends_tiers() {
        let topo = Topology::from_yaml(fabric_yaml()).unwrap();
        // spine-01 reaches both tors, both leaves, and all four servers.
        assert_eq!(topo.blast_radius("spine-01"), 8);
        // spine-02 only uplinks tor-01.
        assert_eq!(topo.blast_radius("spine-02"), 4);
        assert_eq!(topo.blast_radius("tor-01"), 3);
        assert_eq!(topo.blast_radius("leaf-01"), 2);
        // Leaf devices of the graph floor at one.
        assert_eq!(topo.blast_radius("server-01"), 1);
        // Unknown devices degrade to a radius of 1.
        assert_eq!(topo.blast_radius("ghost-device"), 1);
    }

    #[test]
    fn test_blast_radius_is_stable() {
        let topo = Topology::from_yaml(fabric_yaml()).unwrap();
        let first = topo.blast_radius("spine-01");
        for _ in 0..3 {
            assert_eq!(topo.blast_radius("spine-01"), first);
        }
    }

    #[test]
    fn test_affected_layers() {
        let topo = Topology::from_yaml(fabric_yaml()).unwrap();
        let layers = topo.affected_layers("tor-01");
        assert!(layers.contains(&Layer::Tor));
        assert!(layers.contains(&Layer::Leaf));
        assert!(layers.contains(&Layer::Server));
        assert!(!layers.contains(&Layer::Spine));
    }

    #[test]
    fn test_spof_detection() {
        let topo = Topology::from_yaml(fabric_yaml()).unwrap();
        // tor-02 is the only path from leaf-02's servers to any spine.
        assert!(topo.is_spof("tor-02"));
        assert!(topo.is_spof("leaf-01"));
        // tor-01 is backed by two spines, but it is still the sole path
        // upward for leaf-01's servers.
        assert!(topo.is_spof("tor-01"));
        // Neither spine is a SPOF for tor-01's side; spine-01 is the sole
        // spine for leaf-02's servers though.
        assert!(topo.is_spof("spine-01"));
        assert!(!topo.is_spof("spine-02"));
        assert!(!topo.is_spof("server-01"));
    }

    #[test]
    fn test_within_hops() {
        let topo = Topology::from_yaml(fabric_yaml()).unwrap();
        assert!(topo.within_hops("spine-01", "spine-01", 0));
        assert!(!topo.within_hops("spine-01", "tor-01", 0));
        assert!(topo.within_hops("spine-01", "tor-01", 1));
        assert!(!topo.within_hops("spine-01", "leaf-01", 1));
        assert!(topo.within_hops("spine-01", "leaf-01", 2));
    }

    #[test]
    fn test_validation_rejects_dangling_neighbor() {
        let yaml = r#"
devices:
  spine-01: { role: spine, neighbors: [tor-99] }
"#;
        let err = Topology::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("undeclared neighbor"));
    }

    #[test]
    fn test_validation_rejects_self_loop() {
        let yaml = r#"
devices:
  spine-01: { role: spine, neighbors: [spine-01] }
"#;
        assert!(Topology::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_role() {
        let yaml = r#"
devices:
  box-01: { role: toaster }
"#;
        assert!(Topology::from_yaml(yaml).is_err());
        let yaml = r#"
devices:
  box-01: { role: unknown }
"#;
        assert!(Topology::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_validation_rejects_dangling_bgp_peer() {
        let yaml = r#"
devices:
  spine-01: { role: spine }
bgp_peers:
  - [spine-01, tor-77]
"#;
        assert!(Topology::from_yaml(yaml).is_err());
    }
}
