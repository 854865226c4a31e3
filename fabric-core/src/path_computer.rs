//! Multipath computation over the Fat-Tree
//!
//! Pure with respect to shared state: callers pass an immutable
//! [`StatusView`] and [`CostBias`], so computations may run concurrently
//! with monitoring and recovery.
//!
//! Candidate paths are loop-free and layer-monotonic: the hop sequence
//! climbs to a single peak layer and descends, never skipping a layer
//! and never revisiting a node. Down elements are pruned outright;
//! Suspect elements stay usable but their links are penalized so they
//! only win when nothing healthier exists.

use crate::config::PathConfig;
use crate::error::{FabricError, FabricResult};
use crate::snapshot::StatusView;
use crate::topology::TopologyModel;
use crate::types::{CostBias, ElementStatus, Layer, LinkId, NodeId, Path, RoutingEntry, WeightedPath};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct PathComputer {
    topology: Arc<TopologyModel>,
    config: PathConfig,
}

impl PathComputer {
    pub fn new(topology: Arc<TopologyModel>, config: PathConfig) -> Self {
        Self { topology, config }
    }

    pub fn topology(&self) -> &TopologyModel {
        &self.topology
    }

    /// Compute the ranked multipath set for one host pair
    ///
    /// Returns up to `fan_out` paths, preferring link-disjoint ones,
    /// with equal weights summing to 1. Fails with `NoPathAvailable`
    /// when Down elements structurally partition the pair.
    pub fn compute(
        &self,
        source: &NodeId,
        destination: &NodeId,
        view: &StatusView,
        bias: &CostBias,
    ) -> FabricResult<RoutingEntry> {
        let candidates = self.candidate_paths(source, destination, view, bias)?;
        if candidates.is_empty() {
            debug!(%source, %destination, "no usable path");
            return Err(FabricError::NoPathAvailable {
                from: source.to_string(),
                to: destination.to_string(),
            });
        }

        let selected = self.select_disjoint(candidates);
        let weight = 1.0 / selected.len() as f64;
        let paths = selected
            .into_iter()
            .map(|path| WeightedPath { path, weight })
            .collect();

        Ok(RoutingEntry {
            source: source.clone(),
            destination: destination.clone(),
            paths,
        })
    }

    /// All loop-free layer-monotonic candidates, cheapest first,
    /// ties broken by ascending node-identifier sequence
    pub fn candidate_paths(
        &self,
        source: &NodeId,
        destination: &NodeId,
        view: &StatusView,
        bias: &CostBias,
    ) -> FabricResult<Vec<Path>> {
        for endpoint in [source, destination] {
            if self.topology.layer_of(endpoint)? != Layer::Host {
                return Err(FabricError::Internal {
                    message: format!("path endpoint {} is not a host", endpoint),
                });
            }
        }
        if source == destination {
            return Err(FabricError::Internal {
                message: format!("source and destination are both {}", source),
            });
        }
        if view.node_status(source) == ElementStatus::Down
            || view.node_status(destination) == ElementStatus::Down
        {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let mut hops = vec![source.clone()];
        self.walk(source, destination, false, view, bias, 0.0, &mut hops, &mut found);

        found.sort_by(|a, b| {
            a.cost
                .partial_cmp(&b.cost)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.hops.cmp(&b.hops))
        });
        trace!(%source, %destination, candidates = found.len(), "path enumeration done");
        Ok(found)
    }

    fn walk(
        &self,
        current: &NodeId,
        destination: &NodeId,
        descending: bool,
        view: &StatusView,
        bias: &CostBias,
        cost: f64,
        hops: &mut Vec<NodeId>,
        found: &mut Vec<Path>,
    ) {
        // Adjacency lists are sorted, so enumeration order is stable.
        for next in self.topology.neighbors(current) {
            if hops.contains(next) {
                continue;
            }
            let going_up = self.depth(next) > self.depth(current);
            if descending && going_up {
                continue;
            }
            if view.node_status(next) == ElementStatus::Down {
                continue;
            }
            let link = LinkId::new(current.clone(), next.clone());
            if view.link_status(&link) == ElementStatus::Down {
                continue;
            }

            let step = self.link_cost(&link, current, next, view, bias);
            if next == destination {
                hops.push(next.clone());
                found.push(Path {
                    hops: hops.clone(),
                    cost: cost + step,
                });
                hops.pop();
                continue;
            }
            // Dead end: hosts other than the destination
            if self.depth(next) == 0 {
                continue;
            }

            hops.push(next.clone());
            self.walk(
                next,
                destination,
                descending || !going_up,
                view,
                bias,
                cost + step,
                hops,
                found,
            );
            hops.pop();
        }
    }

    fn depth(&self, node: &NodeId) -> u8 {
        // Nodes come from the validated topology, so the lookup cannot fail.
        self.topology
            .layer_of(node)
            .map(|l| l.depth())
            .unwrap_or(0)
    }

    fn link_cost(
        &self,
        link: &LinkId,
        from: &NodeId,
        to: &NodeId,
        view: &StatusView,
        bias: &CostBias,
    ) -> f64 {
        let base = self
            .topology
            .link(link)
            .map(|l| l.base_latency_ms)
            .unwrap_or(1.0);
        let mut cost = base * bias.factor(link);
        let suspect = view.link_status(link) == ElementStatus::Suspect
            || view.node_status(from) == ElementStatus::Suspect
            || view.node_status(to) == ElementStatus::Suspect;
        if suspect {
            cost *= self.config.suspect_penalty;
        }
        cost
    }

    /// Greedy selection: always take the cheapest candidate, then prefer
    /// candidates link-disjoint from everything already selected. Only
    /// when no disjoint candidate remains does selection fall back to
    /// overlapping ones.
    fn select_disjoint(&self, candidates: Vec<Path>) -> Vec<Path> {
        let mut selected: Vec<Path> = Vec::new();
        let mut remaining = candidates;

        while selected.len() < self.config.fan_out && !remaining.is_empty() {
            let pick = if selected.is_empty() {
                0
            } else {
                remaining
                    .iter()
                    .position(|c| selected.iter().all(|s| c.link_disjoint_from(s)))
                    .unwrap_or(0)
            };
            selected.push(remaining.remove(pick));
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::FatTreeConfig;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn computer() -> PathComputer {
        let topology = Arc::new(TopologyModel::new(FatTreeConfig::default()).unwrap());
        PathComputer::new(topology, PathConfig::default())
    }

    fn assert_layer_monotonic(computer: &PathComputer, path: &Path) {
        let depths: Vec<u8> = path
            .hops
            .iter()
            .map(|n| computer.topology().layer_of(n).unwrap().depth())
            .collect();
        let peak = depths.iter().max().copied().unwrap();
        let peak_at = depths.iter().position(|d| *d == peak).unwrap();
        for w in depths[..=peak_at].windows(2) {
            assert_eq!(w[1], w[0] + 1, "ascent must not skip layers: {:?}", depths);
        }
        for w in depths[peak_at..].windows(2) {
            assert_eq!(w[1] + 1, w[0], "descent must not skip layers: {:?}", depths);
        }
        let mut seen = std::collections::HashSet::new();
        for hop in &path.hops {
            assert!(seen.insert(hop), "node {} visited twice", hop);
        }
    }

    #[test]
    fn same_edge_pair_uses_the_edge_switch() {
        let computer = computer();
        let entry = computer
            .compute(
                &NodeId::from("h1"),
                &NodeId::from("h2"),
                &StatusView::all_up(),
                &CostBias::neutral(),
            )
            .unwrap();
        let hops: Vec<&str> = entry.paths[0].path.hops.iter().map(|n| n.as_str()).collect();
        assert_eq!(hops, vec!["h1", "es1", "h2"]);
    }

    #[test]
    fn inter_pod_pair_gets_two_core_disjoint_paths() {
        let computer = computer();
        let entry = computer
            .compute(
                &NodeId::from("h1"),
                &NodeId::from("h8"),
                &StatusView::all_up(),
                &CostBias::neutral(),
            )
            .unwrap();
        assert_eq!(entry.paths.len(), 2);
        assert!(entry.paths[0].path.link_disjoint_from(&entry.paths[1].path));

        let cores: Vec<&str> = entry
            .paths
            .iter()
            .flat_map(|wp| wp.path.hops.iter())
            .filter(|n| n.as_str().starts_with("cr"))
            .map(|n| n.as_str())
            .collect();
        assert_eq!(cores.len(), 2);
        assert_ne!(cores[0], cores[1], "paths must cross distinct cores");

        let total: f64 = entry.paths.iter().map(|wp| wp.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn down_core_is_never_traversed() {
        let computer = computer();
        let view =
            StatusView::all_up().with_node_status(NodeId::from("cr1"), ElementStatus::Down);
        let entry = computer
            .compute(
                &NodeId::from("h1"),
                &NodeId::from("h8"),
                &view,
                &CostBias::neutral(),
            )
            .unwrap();
        for wp in &entry.paths {
            assert!(!wp.path.traverses_node(&NodeId::from("cr1")));
            assert!(wp.path.traverses_node(&NodeId::from("cr2")));
        }
    }

    #[test]
    fn down_link_is_never_traversed() {
        let computer = computer();
        let broken = LinkId::new(NodeId::from("ar1"), NodeId::from("es1"));
        let view = StatusView::all_up().with_link_status(broken.clone(), ElementStatus::Down);
        let entry = computer
            .compute(
                &NodeId::from("h1"),
                &NodeId::from("h5"),
                &view,
                &CostBias::neutral(),
            )
            .unwrap();
        for wp in &entry.paths {
            assert!(!wp.path.traverses_link(&broken));
        }
    }

    #[test]
    fn both_cores_down_partitions_inter_pod_pairs() {
        let computer = computer();
        let view = StatusView::all_up()
            .with_node_status(NodeId::from("cr1"), ElementStatus::Down)
            .with_node_status(NodeId::from("cr2"), ElementStatus::Down);

        let err = computer
            .compute(
                &NodeId::from("h1"),
                &NodeId::from("h8"),
                &view,
                &CostBias::neutral(),
            )
            .unwrap_err();
        assert!(matches!(err, FabricError::NoPathAvailable { .. }));

        // Intra-pod traffic never needs the core layer
        let entry = computer
            .compute(
                &NodeId::from("h1"),
                &NodeId::from("h3"),
                &view,
                &CostBias::neutral(),
            )
            .unwrap();
        assert!(!entry.paths.is_empty());
    }

    #[test]
    fn suspect_elements_are_discouraged_but_usable() {
        let computer = computer();
        let view =
            StatusView::all_up().with_node_status(NodeId::from("cr1"), ElementStatus::Suspect);
        let candidates = computer
            .candidate_paths(
                &NodeId::from("h1"),
                &NodeId::from("h8"),
                &view,
                &CostBias::neutral(),
            )
            .unwrap();
        // The cheapest candidate avoids the suspect core
        assert!(!candidates[0].traverses_node(&NodeId::from("cr1")));
        // But suspect paths still exist further down the ranking
        assert!(candidates
            .iter()
            .any(|p| p.traverses_node(&NodeId::from("cr1"))));

        // With cr2 also suspect nothing healthy remains, yet paths survive
        let view = view.with_node_status(NodeId::from("cr2"), ElementStatus::Suspect);
        let entry = computer
            .compute(
                &NodeId::from("h1"),
                &NodeId::from("h8"),
                &view,
                &CostBias::neutral(),
            )
            .unwrap();
        assert!(!entry.paths.is_empty());
    }

    #[test]
    fn cost_bias_steers_ranking() {
        let computer = computer();
        let neutral = computer
            .candidate_paths(
                &NodeId::from("h1"),
                &NodeId::from("h8"),
                &StatusView::all_up(),
                &CostBias::neutral(),
            )
            .unwrap();
        let best_core = neutral[0]
            .hops
            .iter()
            .find(|n| n.as_str().starts_with("cr"))
            .unwrap()
            .clone();

        // Penalize every link of the previously best core
        let mut raw = HashMap::new();
        for agg in 1..=4 {
            raw.insert(
                LinkId::new(NodeId::new(format!("ar{}", agg)), best_core.clone()),
                2.0,
            );
        }
        let (bias, _) = CostBias::from_raw(raw);
        let biased = computer
            .candidate_paths(
                &NodeId::from("h1"),
                &NodeId::from("h8"),
                &StatusView::all_up(),
                &bias,
            )
            .unwrap();
        assert!(!biased[0].traverses_node(&best_core));
    }

    #[test]
    fn ranking_is_deterministic() {
        let computer = computer();
        let a = computer
            .candidate_paths(
                &NodeId::from("h1"),
                &NodeId::from("h8"),
                &StatusView::all_up(),
                &CostBias::neutral(),
            )
            .unwrap();
        let b = computer
            .candidate_paths(
                &NodeId::from("h1"),
                &NodeId::from("h8"),
                &StatusView::all_up(),
                &CostBias::neutral(),
            )
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_host_endpoint_is_rejected() {
        let computer = computer();
        let err = computer
            .compute(
                &NodeId::from("ar1"),
                &NodeId::from("h8"),
                &StatusView::all_up(),
                &CostBias::neutral(),
            )
            .unwrap_err();
        assert!(matches!(err, FabricError::Internal { .. }));
    }

    #[test]
    fn all_candidates_are_layer_monotonic() {
        let computer = computer();
        let hosts = ["h1", "h2", "h3", "h5", "h8"];
        for src in hosts {
            for dst in hosts {
                if src == dst {
                    continue;
                }
                let candidates = computer
                    .candidate_paths(
                        &NodeId::from(src),
                        &NodeId::from(dst),
                        &StatusView::all_up(),
                        &CostBias::neutral(),
                    )
                    .unwrap();
                assert!(!candidates.is_empty());
                for path in &candidates {
                    assert_layer_monotonic(&computer, path);
                }
            }
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn host_index() -> impl Strategy<Value = usize> {
            0usize..8
        }

        proptest! {
            /// Whatever subset of routers is Down, every returned path is
            /// layer-monotonic, loop-free and avoids Down elements.
            #[test]
            fn paths_respect_status_and_shape(
                src in host_index(),
                dst in host_index(),
                down_mask in 0u16..64,
            ) {
                prop_assume!(src != dst);
                let computer = computer();
                let routers = ["cr1", "cr2", "ar1", "ar2", "ar3", "ar4"];
                let mut view = StatusView::all_up();
                let mut downed = Vec::new();
                for (i, name) in routers.iter().enumerate() {
                    if down_mask & (1 << i) != 0 {
                        view.set_node_status(NodeId::from(*name), ElementStatus::Down);
                        downed.push(NodeId::from(*name));
                    }
                }

                let source = NodeId::new(format!("h{}", src + 1));
                let destination = NodeId::new(format!("h{}", dst + 1));
                let candidates = computer
                    .candidate_paths(&source, &destination, &view, &CostBias::neutral())
                    .unwrap();

                for path in &candidates {
                    assert_layer_monotonic(&computer, path);
                    for down in &downed {
                        prop_assert!(!path.traverses_node(down));
                    }
                }
            }
        }
    }
}
