//! Fat-Tree topology model
//!
//! Builds the static core/aggregation/edge/host graph once and validates
//! its structural invariants. The model is immutable after construction
//! and shared read-only by every other component; element health lives
//! elsewhere.
//!
//! Naming follows the deployed network: core routers `cr1..`,
//! aggregation routers `ar1..`, edge switches `es1..`, hosts `h1..`.
//! Each pod owns a slice of the aggregation and edge layers; every edge
//! switch links to both aggregation routers of its pod (straight and
//! diagonal links), every aggregation router links to every core router,
//! and every host hangs off exactly one edge switch.

use crate::error::{FabricError, FabricResult};
use crate::types::{Layer, Link, LinkId, Node, NodeId};
use std::collections::{BTreeMap, HashMap};

/// Shape of the Fat-Tree; the default matches the deployed 2-pod network
/// (2 core, 4 aggregation, 4 edge, 8 hosts).
#[derive(Debug, Clone)]
pub struct FatTreeConfig {
    pub core_count: usize,
    pub pods: usize,
    pub aggregation_per_pod: usize,
    pub edge_per_pod: usize,
    pub hosts_per_edge: usize,
    /// Base latency seeds per link class, in milliseconds
    pub host_link_latency_ms: f64,
    pub edge_link_latency_ms: f64,
    pub core_link_latency_ms: f64,
}

impl Default for FatTreeConfig {
    fn default() -> Self {
        Self {
            core_count: 2,
            pods: 2,
            aggregation_per_pod: 2,
            edge_per_pod: 2,
            hosts_per_edge: 2,
            host_link_latency_ms: 0.1,
            edge_link_latency_ms: 0.2,
            core_link_latency_ms: 0.5,
        }
    }
}

/// Immutable adjacency of the Fat-Tree graph
#[derive(Debug)]
pub struct TopologyModel {
    nodes: BTreeMap<NodeId, Node>,
    links: BTreeMap<LinkId, Link>,
    /// Sorted neighbor lists for deterministic iteration
    adjacency: HashMap<NodeId, Vec<NodeId>>,
}

impl TopologyModel {
    /// Build and validate the Fat-Tree described by `config`
    pub fn new(config: FatTreeConfig) -> FabricResult<Self> {
        if config.core_count == 0
            || config.pods == 0
            || config.aggregation_per_pod == 0
            || config.edge_per_pod == 0
            || config.hosts_per_edge == 0
        {
            return Err(FabricError::Configuration {
                message: "all fat-tree layer counts must be non-zero".to_string(),
            });
        }

        let mut nodes = Vec::new();
        let mut links = Vec::new();

        for c in 0..config.core_count {
            nodes.push(Node {
                id: NodeId::new(format!("cr{}", c + 1)),
                layer: Layer::Core,
                pod: None,
            });
        }

        for pod in 0..config.pods {
            for a in 0..config.aggregation_per_pod {
                let idx = pod * config.aggregation_per_pod + a;
                nodes.push(Node {
                    id: NodeId::new(format!("ar{}", idx + 1)),
                    layer: Layer::Aggregation,
                    pod: Some(pod),
                });
            }
            for e in 0..config.edge_per_pod {
                let idx = pod * config.edge_per_pod + e;
                nodes.push(Node {
                    id: NodeId::new(format!("es{}", idx + 1)),
                    layer: Layer::Edge,
                    pod: Some(pod),
                });
            }
        }

        let edge_total = config.pods * config.edge_per_pod;
        for e in 0..edge_total {
            for h in 0..config.hosts_per_edge {
                let idx = e * config.hosts_per_edge + h;
                let pod = e / config.edge_per_pod;
                nodes.push(Node {
                    id: NodeId::new(format!("h{}", idx + 1)),
                    layer: Layer::Host,
                    pod: Some(pod),
                });
            }
        }

        // Aggregation to every core: full bipartite
        for pod in 0..config.pods {
            for a in 0..config.aggregation_per_pod {
                let ar = NodeId::new(format!("ar{}", pod * config.aggregation_per_pod + a + 1));
                for c in 0..config.core_count {
                    links.push(Link {
                        id: LinkId::new(ar.clone(), NodeId::new(format!("cr{}", c + 1))),
                        capacity_mbps: 40_000,
                        base_latency_ms: config.core_link_latency_ms,
                    });
                }
            }
        }

        // Every edge switch to both aggregation routers of its pod
        // (straight plus diagonal links)
        for pod in 0..config.pods {
            for e in 0..config.edge_per_pod {
                let es = NodeId::new(format!("es{}", pod * config.edge_per_pod + e + 1));
                for a in 0..config.aggregation_per_pod {
                    let ar =
                        NodeId::new(format!("ar{}", pod * config.aggregation_per_pod + a + 1));
                    links.push(Link {
                        id: LinkId::new(ar, es.clone()),
                        capacity_mbps: 10_000,
                        base_latency_ms: config.edge_link_latency_ms,
                    });
                }
            }
        }

        // Each host to its single edge switch
        for e in 0..edge_total {
            let es = NodeId::new(format!("es{}", e + 1));
            for h in 0..config.hosts_per_edge {
                let host = NodeId::new(format!("h{}", e * config.hosts_per_edge + h + 1));
                links.push(Link {
                    id: LinkId::new(es.clone(), host),
                    capacity_mbps: 1_000,
                    base_latency_ms: config.host_link_latency_ms,
                });
            }
        }

        Self::from_parts(nodes, links)
    }

    /// Assemble a model from explicit parts, validating the structural
    /// invariants. Exposed so tests can exercise rejection of malformed
    /// graphs.
    pub fn from_parts(nodes: Vec<Node>, links: Vec<Link>) -> FabricResult<Self> {
        let mut node_map = BTreeMap::new();
        for node in nodes {
            if node_map.insert(node.id.clone(), node.clone()).is_some() {
                return Err(FabricError::Configuration {
                    message: format!("duplicate node id {}", node.id),
                });
            }
        }

        let mut link_map = BTreeMap::new();
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for link in links {
            let (a, b) = link.id.endpoints();
            for end in [a, b] {
                if !node_map.contains_key(end) {
                    return Err(FabricError::Configuration {
                        message: format!("link {} references unknown node {}", link.id, end),
                    });
                }
            }
            if link_map.insert(link.id.clone(), link.clone()).is_some() {
                return Err(FabricError::Configuration {
                    message: format!("duplicate link {}", link.id),
                });
            }
            adjacency.entry(a.clone()).or_default().push(b.clone());
            adjacency.entry(b.clone()).or_default().push(a.clone());
        }
        for neighbors in adjacency.values_mut() {
            neighbors.sort();
        }

        let model = Self {
            nodes: node_map,
            links: link_map,
            adjacency,
        };
        model.validate()?;
        Ok(model)
    }

    /// Check the Fat-Tree structural invariants, failing with a fatal
    /// configuration error on the first violation.
    fn validate(&self) -> FabricResult<()> {
        let cores: Vec<&Node> = self.nodes_in_layer(Layer::Core).collect();
        if cores.is_empty() {
            return Err(FabricError::Configuration {
                message: "topology has no core layer".to_string(),
            });
        }

        for node in self.nodes.values() {
            match node.layer {
                Layer::Core => {
                    if node.pod.is_some() {
                        return Err(FabricError::Configuration {
                            message: format!("core node {} must not carry a pod index", node.id),
                        });
                    }
                }
                Layer::Aggregation => {
                    // Full bipartite aggregation <-> core
                    for core in &cores {
                        if !self.are_adjacent(&node.id, &core.id) {
                            return Err(FabricError::Configuration {
                                message: format!(
                                    "aggregation {} is not connected to core {}",
                                    node.id, core.id
                                ),
                            });
                        }
                    }
                }
                Layer::Edge => {
                    let pod = node.pod.ok_or_else(|| FabricError::Configuration {
                        message: format!("edge node {} has no pod index", node.id),
                    })?;
                    let pod_aggs: Vec<&Node> = self
                        .nodes_in_layer(Layer::Aggregation)
                        .filter(|n| n.pod == Some(pod))
                        .collect();
                    let connected: Vec<&NodeId> =
                        self.neighbors_in_layer(&node.id, Layer::Aggregation);
                    if connected.len() != pod_aggs.len()
                        || pod_aggs.iter().any(|a| !connected.contains(&&a.id))
                    {
                        return Err(FabricError::Configuration {
                            message: format!(
                                "edge {} must connect to exactly the aggregation nodes of pod {}",
                                node.id, pod
                            ),
                        });
                    }
                }
                Layer::Host => {
                    let edges = self.neighbors_in_layer(&node.id, Layer::Edge);
                    if edges.len() != 1 || self.neighbors(&node.id).len() != 1 {
                        return Err(FabricError::Configuration {
                            message: format!(
                                "host {} must connect to exactly one edge switch",
                                node.id
                            ),
                        });
                    }
                }
            }
        }

        // Links must not skip layers
        for link in self.links.values() {
            let (a, b) = link.id.endpoints();
            let da = self.nodes[a].layer.depth();
            let db = self.nodes[b].layer.depth();
            if da.abs_diff(db) != 1 {
                return Err(FabricError::Configuration {
                    message: format!("link {} skips a layer", link.id),
                });
            }
        }

        Ok(())
    }

    pub fn node(&self, id: &NodeId) -> FabricResult<&Node> {
        self.nodes.get(id).ok_or_else(|| FabricError::UnknownElement {
            element: id.to_string(),
        })
    }

    pub fn layer_of(&self, id: &NodeId) -> FabricResult<Layer> {
        Ok(self.node(id)?.layer)
    }

    pub fn pod_of(&self, id: &NodeId) -> FabricResult<Option<usize>> {
        Ok(self.node(id)?.pod)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn neighbors(&self, id: &NodeId) -> &[NodeId] {
        self.adjacency.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn neighbors_in_layer(&self, id: &NodeId, layer: Layer) -> Vec<&NodeId> {
        self.neighbors(id)
            .iter()
            .filter(|n| self.nodes.get(*n).map(|node| node.layer) == Some(layer))
            .collect()
    }

    pub fn are_adjacent(&self, a: &NodeId, b: &NodeId) -> bool {
        self.adjacency
            .get(a)
            .map(|n| n.binary_search(b).is_ok())
            .unwrap_or(false)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_in_layer(&self, layer: Layer) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |n| n.layer == layer)
    }

    pub fn hosts(&self) -> Vec<&NodeId> {
        self.nodes_in_layer(Layer::Host).map(|n| &n.id).collect()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn link(&self, id: &LinkId) -> FabricResult<&Link> {
        self.links.get(id).ok_or_else(|| FabricError::UnknownElement {
            element: id.to_string(),
        })
    }

    pub fn link_between(&self, a: &NodeId, b: &NodeId) -> Option<&Link> {
        self.links.get(&LinkId::new(a.clone(), b.clone()))
    }

    /// The single edge switch a host hangs off
    pub fn edge_of_host(&self, host: &NodeId) -> FabricResult<&NodeId> {
        let node = self.node(host)?;
        if node.layer != Layer::Host {
            return Err(FabricError::Internal {
                message: format!("{} is not a host", host),
            });
        }
        self.neighbors_in_layer(host, Layer::Edge)
            .into_iter()
            .next()
            .ok_or_else(|| FabricError::Configuration {
                message: format!("host {} has no edge switch", host),
            })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_topology_builds_and_validates() {
        let topology = TopologyModel::new(FatTreeConfig::default()).unwrap();
        // 2 core + 4 aggregation + 4 edge + 8 hosts
        assert_eq!(topology.node_count(), 18);
        // 8 agg-core + 8 agg-edge + 8 host-edge
        assert_eq!(topology.link_count(), 24);
        assert_eq!(topology.hosts().len(), 8);
    }

    #[test]
    fn aggregation_reaches_every_core() {
        let topology = TopologyModel::new(FatTreeConfig::default()).unwrap();
        for agg in topology.nodes_in_layer(Layer::Aggregation) {
            let cores = topology.neighbors_in_layer(&agg.id, Layer::Core);
            assert_eq!(cores.len(), 2, "{} must reach both cores", agg.id);
        }
    }

    #[test]
    fn edges_connect_to_own_pod_aggregation_only() {
        let topology = TopologyModel::new(FatTreeConfig::default()).unwrap();
        let es1 = NodeId::from("es1");
        let aggs = topology.neighbors_in_layer(&es1, Layer::Aggregation);
        let mut names: Vec<&str> = aggs.iter().map(|n| n.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["ar1", "ar2"]);

        let es3 = NodeId::from("es3");
        let aggs = topology.neighbors_in_layer(&es3, Layer::Aggregation);
        let mut names: Vec<&str> = aggs.iter().map(|n| n.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["ar3", "ar4"]);
    }

    #[test]
    fn hosts_have_single_uplink() {
        let topology = TopologyModel::new(FatTreeConfig::default()).unwrap();
        assert_eq!(
            topology.edge_of_host(&NodeId::from("h1")).unwrap().as_str(),
            "es1"
        );
        assert_eq!(
            topology.edge_of_host(&NodeId::from("h8")).unwrap().as_str(),
            "es4"
        );
        for host in topology.hosts() {
            assert_eq!(topology.neighbors(host).len(), 1);
        }
    }

    #[test]
    fn pods_partition_lower_layers() {
        let topology = TopologyModel::new(FatTreeConfig::default()).unwrap();
        assert_eq!(topology.pod_of(&NodeId::from("h1")).unwrap(), Some(0));
        assert_eq!(topology.pod_of(&NodeId::from("h5")).unwrap(), Some(1));
        assert_eq!(topology.pod_of(&NodeId::from("ar2")).unwrap(), Some(0));
        assert_eq!(topology.pod_of(&NodeId::from("ar3")).unwrap(), Some(1));
        assert_eq!(topology.pod_of(&NodeId::from("cr1")).unwrap(), None);
    }

    #[test]
    fn missing_core_link_is_fatal() {
        let topology = TopologyModel::new(FatTreeConfig::default()).unwrap();
        let nodes: Vec<Node> = topology.nodes().cloned().collect();
        let removed = LinkId::new(NodeId::from("ar1"), NodeId::from("cr2"));
        let links: Vec<Link> = topology
            .links()
            .filter(|l| l.id != removed)
            .cloned()
            .collect();
        let err = TopologyModel::from_parts(nodes, links).unwrap_err();
        assert!(matches!(err, FabricError::Configuration { .. }));
    }

    #[test]
    fn host_with_two_uplinks_is_fatal() {
        let topology = TopologyModel::new(FatTreeConfig::default()).unwrap();
        let nodes: Vec<Node> = topology.nodes().cloned().collect();
        let mut links: Vec<Link> = topology.links().cloned().collect();
        links.push(Link {
            id: LinkId::new(NodeId::from("h1"), NodeId::from("es2")),
            capacity_mbps: 1_000,
            base_latency_ms: 0.1,
        });
        let err = TopologyModel::from_parts(nodes, links).unwrap_err();
        assert!(matches!(err, FabricError::Configuration { .. }));
    }

    #[test]
    fn layer_skipping_link_is_fatal() {
        let topology = TopologyModel::new(FatTreeConfig::default()).unwrap();
        let nodes: Vec<Node> = topology.nodes().cloned().collect();
        let mut links: Vec<Link> = topology.links().cloned().collect();
        links.push(Link {
            id: LinkId::new(NodeId::from("es1"), NodeId::from("cr1")),
            capacity_mbps: 10_000,
            base_latency_ms: 0.2,
        });
        let err = TopologyModel::from_parts(nodes, links).unwrap_err();
        assert!(matches!(err, FabricError::Configuration { .. }));
    }

    #[test]
    fn unknown_node_lookup_fails() {
        let topology = TopologyModel::new(FatTreeConfig::default()).unwrap();
        assert!(topology.node(&NodeId::from("h99")).is_err());
    }
}
