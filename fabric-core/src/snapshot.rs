//! Published state snapshots and event export
//!
//! The recovery engine owns the mutable network state; everyone else
//! (dashboard, logger, path computation) works from the immutable views
//! defined here. Snapshots are serde-serializable so external observers
//! can consume them as JSON.

use crate::types::{ElementId, ElementState, ElementStatus, HealthEvent, LinkId, NodeId, RoutingEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::info;

/// Immutable view of element health, handed to the path computer
///
/// Elements absent from the maps are treated as Up, so a freshly built
/// view over a healthy network is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    nodes: HashMap<NodeId, ElementStatus>,
    links: HashMap<LinkId, ElementStatus>,
}

impl StatusView {
    pub fn all_up() -> Self {
        Self::default()
    }

    pub fn node_status(&self, node: &NodeId) -> ElementStatus {
        self.nodes.get(node).copied().unwrap_or(ElementStatus::Up)
    }

    pub fn link_status(&self, link: &LinkId) -> ElementStatus {
        self.links.get(link).copied().unwrap_or(ElementStatus::Up)
    }

    pub fn status_of(&self, element: &ElementId) -> ElementStatus {
        match element {
            ElementId::Node(n) => self.node_status(n),
            ElementId::Link(l) => self.link_status(l),
        }
    }

    pub fn set_node_status(&mut self, node: NodeId, status: ElementStatus) {
        if status == ElementStatus::Up {
            self.nodes.remove(&node);
        } else {
            self.nodes.insert(node, status);
        }
    }

    pub fn set_link_status(&mut self, link: LinkId, status: ElementStatus) {
        if status == ElementStatus::Up {
            self.links.remove(&link);
        } else {
            self.links.insert(link, status);
        }
    }

    pub fn set_status(&mut self, element: ElementId, status: ElementStatus) {
        match element {
            ElementId::Node(n) => self.set_node_status(n, status),
            ElementId::Link(l) => self.set_link_status(l, status),
        }
    }

    pub fn with_node_status(mut self, node: NodeId, status: ElementStatus) -> Self {
        self.set_node_status(node, status);
        self
    }

    pub fn with_link_status(mut self, link: LinkId, status: ElementStatus) -> Self {
        self.set_link_status(link, status);
        self
    }

    /// Non-Up nodes, for snapshot reporting
    pub fn degraded_nodes(&self) -> impl Iterator<Item = (&NodeId, ElementStatus)> {
        self.nodes.iter().map(|(n, s)| (n, *s))
    }

    /// Non-Up links, for snapshot reporting
    pub fn degraded_links(&self) -> impl Iterator<Item = (&LinkId, ElementStatus)> {
        self.links.iter().map(|(l, s)| (l, *s))
    }
}

/// Structured record of the whole control-plane state, refreshed at
/// least once per monitoring interval and consumed read-only by the
/// dashboard collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: StatusView,
    /// Recovery-engine control states for elements not currently
    /// Healthy; diverges from `status` while a recovery is unconfirmed
    /// or its deadline was blown
    pub control: BTreeMap<String, ElementState>,
    /// Current committed routing table keyed by "src->dst"
    pub routing: BTreeMap<String, RoutingEntry>,
    /// Destinations with no installable path, per source
    pub unreachable: BTreeSet<String>,
    /// Most recent failure/recovery events, oldest first
    pub recent_events: Vec<HealthEvent>,
    /// Monotonic revision, bumped on every publish
    pub revision: u64,
}

impl StatusSnapshot {
    pub fn routing_entry(&self, source: &NodeId, destination: &NodeId) -> Option<&RoutingEntry> {
        self.routing.get(&flow_key(source, destination))
    }

    pub fn is_unreachable(&self, source: &NodeId, destination: &NodeId) -> bool {
        self.unreachable.contains(&flow_key(source, destination))
    }

    pub fn control_state(&self, element: &ElementId) -> ElementState {
        self.control
            .get(&element.to_string())
            .copied()
            .unwrap_or(ElementState::Healthy)
    }
}

pub fn flow_key(source: &NodeId, destination: &NodeId) -> String {
    format!("{}->{}", source, destination)
}

/// Export seam for the logging collaborator; CSV/JSON persistence is
/// owned on their side of the boundary.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn export(&self, event: &HealthEvent);
}

/// Default sink that emits structured log records
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn export(&self, event: &HealthEvent) {
        info!(
            element = %event.element,
            prior = %event.prior,
            new = %event.new,
            kind = ?event.kind,
            latency_ms = ?event.latency_ms,
            "health event"
        );
    }
}

/// Sink that records everything it sees, for tests
#[derive(Default)]
pub struct RecordingEventSink {
    events: parking_lot::Mutex<Vec<HealthEvent>>,
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn export(&self, event: &HealthEvent) {
        self.events.lock().push(event.clone());
    }
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementStatus;

    #[test]
    fn absent_elements_default_to_up() {
        let view = StatusView::all_up();
        assert_eq!(view.node_status(&NodeId::from("cr1")), ElementStatus::Up);
        let link = LinkId::new(NodeId::from("ar1"), NodeId::from("cr1"));
        assert_eq!(view.link_status(&link), ElementStatus::Up);
    }

    #[test]
    fn setting_up_clears_the_entry() {
        let mut view = StatusView::all_up();
        view.set_node_status(NodeId::from("cr1"), ElementStatus::Down);
        assert_eq!(view.node_status(&NodeId::from("cr1")), ElementStatus::Down);
        view.set_node_status(NodeId::from("cr1"), ElementStatus::Up);
        assert_eq!(view.degraded_nodes().count(), 0);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let link = LinkId::new(NodeId::from("ar1"), NodeId::from("cr1"));
        let view = StatusView::all_up()
            .with_node_status(NodeId::from("cr1"), ElementStatus::Suspect)
            .with_link_status(link.clone(), ElementStatus::Down);
        let snapshot = StatusSnapshot {
            status: view,
            revision: 7,
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: StatusSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.revision, 7);
        assert_eq!(
            back.status.node_status(&NodeId::from("cr1")),
            ElementStatus::Suspect
        );
        assert_eq!(back.status.link_status(&link), ElementStatus::Down);
    }
}
