//! Core data types shared across the control plane
//!
//! Identifiers, layer/status enums, links, paths, routing entries and
//! health events. Everything here is cheap to clone and serde-friendly
//! so snapshots can be handed to external observers as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of a switch, router or host (e.g. "cr1", "ar3", "h7")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Layer of the Fat-Tree a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layer {
    Host,
    Edge,
    Aggregation,
    Core,
}

impl Layer {
    /// Height of the layer in the tree, hosts at the bottom
    pub fn depth(&self) -> u8 {
        match self {
            Layer::Host => 0,
            Layer::Edge => 1,
            Layer::Aggregation => 2,
            Layer::Core => 3,
        }
    }
}

/// Health status of a node or link as seen by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementStatus {
    Up,
    Suspect,
    Down,
}

impl ElementStatus {
    pub fn is_usable(&self) -> bool {
        !matches!(self, ElementStatus::Down)
    }
}

impl fmt::Display for ElementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementStatus::Up => "up",
            ElementStatus::Suspect => "suspect",
            ElementStatus::Down => "down",
        };
        f.write_str(s)
    }
}

/// A node in the topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub layer: Layer,
    /// Pod index for aggregation/edge/host nodes; None for core
    pub pod: Option<usize>,
}

/// Unordered pair of node identifiers naming a link
///
/// Endpoints are normalized so that `a <= b`, making the pair usable as
/// a map key regardless of construction order. Serializes as the string
/// "a<->b" so link-keyed maps survive the trip through JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId {
    a: NodeId,
    b: NodeId,
}

impl LinkId {
    pub fn new(x: NodeId, y: NodeId) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    pub fn endpoints(&self) -> (&NodeId, &NodeId) {
        (&self.a, &self.b)
    }

    pub fn touches(&self, node: &NodeId) -> bool {
        &self.a == node || &self.b == node
    }

    /// The endpoint that is not `node`, if `node` is an endpoint at all
    pub fn other(&self, node: &NodeId) -> Option<&NodeId> {
        if &self.a == node {
            Some(&self.b)
        } else if &self.b == node {
            Some(&self.a)
        } else {
            None
        }
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.a, self.b)
    }
}

impl Serialize for LinkId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LinkId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let (a, b) = s
            .split_once("<->")
            .ok_or_else(|| serde::de::Error::custom("link id must be of the form a<->b"))?;
        Ok(LinkId::new(NodeId::from(a), NodeId::from(b)))
    }
}

/// A physical link with its nominal characteristics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    /// Nominal capacity in mbps
    pub capacity_mbps: u64,
    /// Base one-way latency in milliseconds, seeds path costs
    pub base_latency_ms: f64,
}

/// Reference to a monitored element, either a node or a link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementId {
    Node(NodeId),
    Link(LinkId),
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementId::Node(n) => write!(f, "node {}", n),
            ElementId::Link(l) => write!(f, "link {}", l),
        }
    }
}

/// An ordered host-to-host path through the tree
///
/// Stored as the node sequence; the link sequence is derived. The
/// computer guarantees the layer sequence rises to a single peak and
/// descends, with no node visited twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    pub hops: Vec<NodeId>,
    /// Cost at computation time (base latency x bias, suspect penalty applied)
    pub cost: f64,
}

impl Path {
    pub fn links(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.hops
            .windows(2)
            .map(|w| LinkId::new(w[0].clone(), w[1].clone()))
    }

    pub fn traverses_node(&self, node: &NodeId) -> bool {
        self.hops.contains(node)
    }

    pub fn traverses_link(&self, link: &LinkId) -> bool {
        self.links().any(|l| &l == link)
    }

    /// True when this path shares no link with `other`
    pub fn link_disjoint_from(&self, other: &Path) -> bool {
        let theirs: Vec<LinkId> = other.links().collect();
        !self.links().any(|l| theirs.contains(&l))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.hops.iter().map(|n| n.as_str()).collect();
        write!(f, "{} (cost {:.3})", hops.join(" -> "), self.cost)
    }
}

/// A path with its ECMP weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedPath {
    pub path: Path,
    pub weight: f64,
}

/// Multipath forwarding decision for one source/destination host pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub source: NodeId,
    pub destination: NodeId,
    pub paths: Vec<WeightedPath>,
}

impl RoutingEntry {
    pub fn key(&self) -> (NodeId, NodeId) {
        (self.source.clone(), self.destination.clone())
    }
}

/// Kind of event the monitor or recovery engine can emit for an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthEventKind {
    /// Element confirmed Down after hysteresis
    Failure,
    /// Element confirmed back Up after a full Down -> Up cycle
    Recovery,
    /// Any other status transition (Up -> Suspect, Down -> Suspect, ...)
    Transition,
    /// Recovery work for the element blew its deadline; emitted by the
    /// recovery engine, never by the monitor
    RecoveryTimeout,
}

/// Control-plane state of one element as tracked by the recovery engine
///
/// Mirrors the monitor's Up/Suspect/Down and adds Recovering, the hold
/// between a completed Down -> Up cycle and confirmed stability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementState {
    Healthy,
    Suspect,
    Failed,
    Recovering,
}

/// Status transition observed by the health monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub element: ElementId,
    pub prior: ElementStatus,
    pub new: ElementStatus,
    pub kind: HealthEventKind,
    /// Latency measured by the probe that triggered the transition, if any
    pub latency_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded per-link multiplicative cost adjustment supplied by the
/// external optimizer
///
/// Values are clamped into [0.5, 2.0] on ingestion; a missing link
/// defaults to the neutral 1.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBias {
    factors: HashMap<LinkId, f64>,
}

pub const COST_BIAS_MIN: f64 = 0.5;
pub const COST_BIAS_MAX: f64 = 2.0;

impl CostBias {
    pub fn neutral() -> Self {
        Self::default()
    }

    /// Build from raw multipliers, clamping out-of-range values.
    /// Returns the bias and the number of values that needed clamping.
    pub fn from_raw(raw: HashMap<LinkId, f64>) -> (Self, usize) {
        let mut clamped = 0;
        let factors = raw
            .into_iter()
            .map(|(link, v)| {
                let c = v.clamp(COST_BIAS_MIN, COST_BIAS_MAX);
                if (c - v).abs() > f64::EPSILON {
                    clamped += 1;
                }
                (link, c)
            })
            .collect();
        (Self { factors }, clamped)
    }

    pub fn factor(&self, link: &LinkId) -> f64 {
        self.factors.get(link).copied().unwrap_or(1.0)
    }

    pub fn is_neutral(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
}
