//! Failure detection and recovery engine
//!
//! Single consumer of the health-event channel and sole owner of the
//! mutable network state (element statuses, routing table, unreachable
//! set). Processing one event at a time gives a total order over
//! recovery operations; no two routing mutations ever run concurrently.
//!
//! Per-element control states mirror the monitor's Up/Suspect/Down and
//! add Recovering: entered when a failed element completes its Down ->
//! Up hysteresis, held until one full monitoring interval passes without
//! the element degrading again, then promoted to Healthy.
//!
//! Routing changes follow a stage/commit discipline: new entries are
//! computed against an effective status view, handed to the
//! [`RoutingController`] (which guarantees rollback on partial failure),
//! and only committed to the in-memory table once installation succeeds.
//! Installation is retried with exponential backoff up to a bound;
//! exhaustion demotes the affected flows to Unreachable instead of
//! leaving inconsistent state. A recovery operation that outlives its
//! deadline is aborted and the element treated as still failed.

use crate::config::{Config, RecoveryConfig};
use crate::error::{FabricError, FabricResult};
use crate::optimizer::OptimizerFeedbackPort;
use crate::path_computer::PathComputer;
use crate::routing::RoutingController;
use crate::snapshot::{flow_key, EventSink, StatusSnapshot, StatusView};
use crate::topology::TopologyModel;
use crate::types::{
    ElementId, ElementStatus, HealthEvent, HealthEventKind, Layer, NodeId, RoutingEntry,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

pub use crate::types::ElementState;

#[derive(Debug, Clone, Copy)]
struct ControlRecord {
    state: ElementState,
    /// When the element entered Recovering, for the stability hold
    recovering_since: Option<Instant>,
}

impl ControlRecord {
    fn healthy() -> Self {
        Self {
            state: ElementState::Healthy,
            recovering_since: None,
        }
    }
}

type FlowKey = (NodeId, NodeId);

pub struct FailureRecoveryEngine {
    topology: Arc<TopologyModel>,
    computer: PathComputer,
    controller: Arc<RoutingController>,
    optimizer: Arc<OptimizerFeedbackPort>,
    sink: Arc<dyn EventSink>,
    config: Config,

    // Exclusively owned mutable state
    view: StatusView,
    control: HashMap<ElementId, ControlRecord>,
    routing: HashMap<FlowKey, RoutingEntry>,
    unreachable: BTreeSet<String>,
    recent_events: VecDeque<HealthEvent>,
    host_pairs: Vec<FlowKey>,
    revision: u64,
    snapshot_tx: watch::Sender<StatusSnapshot>,
}

impl FailureRecoveryEngine {
    pub fn new(
        topology: Arc<TopologyModel>,
        computer: PathComputer,
        controller: RoutingController,
        optimizer: Arc<OptimizerFeedbackPort>,
        sink: Arc<dyn EventSink>,
        config: Config,
    ) -> (Self, watch::Receiver<StatusSnapshot>) {
        let hosts = topology.hosts();
        let mut host_pairs = Vec::new();
        for src in &hosts {
            for dst in &hosts {
                if src != dst {
                    host_pairs.push(((*src).clone(), (*dst).clone()));
                }
            }
        }
        let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
        let engine = Self {
            topology,
            computer,
            controller: Arc::new(controller),
            optimizer,
            sink,
            config,
            view: StatusView::all_up(),
            control: HashMap::new(),
            routing: HashMap::new(),
            unreachable: BTreeSet::new(),
            recent_events: VecDeque::new(),
            host_pairs,
            revision: 0,
            snapshot_tx,
        };
        (engine, snapshot_rx)
    }

    /// Compute and install the full routing table for a healthy network
    pub async fn bootstrap(&mut self) -> FabricResult<()> {
        info!(pairs = self.host_pairs.len(), "installing initial routes");
        let pairs = self.host_pairs.clone();
        self.recompute_and_install(&pairs).await?;
        self.publish();
        Ok(())
    }

    /// Consume events until the monitor side closes the channel
    pub async fn run(mut self, mut events: mpsc::Receiver<HealthEvent>) {
        let mut ticker = tokio::time::interval(self.config.probe.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => {
                        self.handle_event(event).await;
                        self.publish();
                    }
                    None => {
                        info!("event channel closed, recovery engine stopping");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.handle_tick().await;
                    self.publish();
                }
            }
        }
    }

    /// Spawn the engine onto its own task
    pub fn spawn(self, events: mpsc::Receiver<HealthEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn handle_event(&mut self, event: HealthEvent) {
        debug!(element = %event.element, prior = %event.prior, new = %event.new,
            kind = ?event.kind, "processing health event");

        self.view.set_status(event.element.clone(), event.new);
        self.remember(event.clone());
        if matches!(
            event.kind,
            HealthEventKind::Failure | HealthEventKind::Recovery
        ) {
            self.sink.export(&event).await;
        }

        let record = self
            .control
            .entry(event.element.clone())
            .or_insert_with(ControlRecord::healthy);

        match event.kind {
            HealthEventKind::Failure => {
                record.state = ElementState::Failed;
                record.recovering_since = None;
                self.handle_failure(&event.element).await;
            }
            HealthEventKind::Recovery => {
                record.state = ElementState::Recovering;
                record.recovering_since = Some(Instant::now());
                self.handle_recovery(&event.element).await;
            }
            HealthEventKind::Transition => match event.new {
                // Up -> Suspect, or a Recovering element degrading again:
                // no reroute yet, hysteresis is still running
                ElementStatus::Suspect if event.prior == ElementStatus::Up => {
                    record.state = ElementState::Suspect;
                    record.recovering_since = None;
                }
                // Down -> Suspect: element is climbing out, stay Failed
                // until the full hysteresis completes
                ElementStatus::Suspect => {}
                ElementStatus::Up => {
                    record.state = ElementState::Healthy;
                    record.recovering_since = None;
                }
                ElementStatus::Down => {}
            },
            // Only the engine itself emits these
            HealthEventKind::RecoveryTimeout => {}
        }
    }

    async fn handle_tick(&mut self) {
        // Promote Recovering elements that stayed clean for a full
        // monitoring interval
        let hold = self.config.probe.interval();
        let mut promoted = Vec::new();
        for (element, record) in self.control.iter_mut() {
            if record.state == ElementState::Recovering {
                if let Some(since) = record.recovering_since {
                    if since.elapsed() >= hold
                        && self.view.status_of(element) == ElementStatus::Up
                    {
                        record.state = ElementState::Healthy;
                        record.recovering_since = None;
                        promoted.push(element.clone());
                    }
                }
            }
        }
        for element in &promoted {
            info!(element = %element, "recovery confirmed stable");
        }

        // Retry elements whose recovery was aborted by the deadline: the
        // monitor reports them Up but control still holds them Failed
        let retries: Vec<ElementId> = self
            .control
            .iter()
            .filter(|(element, record)| {
                record.state == ElementState::Failed
                    && self.view.status_of(element) == ElementStatus::Up
            })
            .map(|(element, _)| element.clone())
            .collect();
        for element in retries {
            info!(element = %element, "retrying aborted recovery");
            if let Some(record) = self.control.get_mut(&element) {
                record.state = ElementState::Recovering;
                record.recovering_since = Some(Instant::now());
            }
            self.handle_recovery(&element).await;
        }
    }

    /// Reroute around a confirmed-Down element
    async fn handle_failure(&mut self, element: &ElementId) {
        // A failed host cannot be routed around; tear its routes down
        if let ElementId::Node(node) = element {
            if self.topology.layer_of(node).ok() == Some(Layer::Host) {
                self.demote_host(node).await;
                return;
            }
        }

        let affected: Vec<FlowKey> = self
            .routing
            .values()
            .filter(|entry| entry_traverses(entry, element))
            .map(|entry| entry.key())
            .collect();
        if affected.is_empty() {
            debug!(element = %element, "failure affects no installed routes");
            return;
        }
        info!(element = %element, flows = affected.len(), "rerouting around failed element");

        match self.recompute_and_install(&affected).await {
            Ok(()) => {}
            Err(FabricError::Timeout { duration, .. }) => {
                error!(element = %element, ?duration, "reroute exceeded recovery deadline");
                for key in &affected {
                    self.mark_unreachable(key);
                }
                self.report_recovery_timeout(element).await;
            }
            Err(e) => {
                // recompute_and_install already demoted the flows it
                // could not serve
                warn!(element = %element, error = %e, "reroute completed with demotions");
            }
        }
    }

    /// Rebalance traffic back onto a restored element
    async fn handle_recovery(&mut self, element: &ElementId) {
        info!(element = %element, "rebalancing onto recovered element");
        let pairs = self.host_pairs.clone();
        match self.recompute_and_install(&pairs).await {
            Ok(()) => {}
            Err(FabricError::Timeout { duration, .. }) => {
                error!(element = %element, ?duration,
                    "rebalance exceeded recovery deadline, element treated as still failed");
                if let Some(record) = self.control.get_mut(element) {
                    record.state = ElementState::Failed;
                    record.recovering_since = None;
                }
                self.report_recovery_timeout(element).await;
            }
            Err(e) => {
                warn!(element = %element, error = %e, "rebalance completed with demotions");
            }
        }
    }

    /// Surface a blown recovery deadline to observers; the element's
    /// control state already reflects the demotion
    async fn report_recovery_timeout(&mut self, element: &ElementId) {
        let status = self.view.status_of(element);
        let event = HealthEvent {
            element: element.clone(),
            prior: status,
            new: status,
            kind: HealthEventKind::RecoveryTimeout,
            latency_ms: None,
            timestamp: Utc::now(),
        };
        self.remember(event.clone());
        self.sink.export(&event).await;
    }

    /// Recompute the given flows against the effective view, stage the
    /// results, install them, and commit on success.
    ///
    /// Flows with no usable path are staged as empty (drop) entries and
    /// reported Unreachable. Installation runs on its own task so the
    /// recovery deadline never cancels the controller mid-batch: on
    /// overrun this returns `Timeout` while the detached install runs to
    /// completion (or rolls back), and the idempotent controller
    /// reconciles any late success on the next recompute. Exhausted
    /// retries demote the affected flows and return
    /// `InstallationFailure`.
    async fn recompute_and_install(&mut self, flows: &[FlowKey]) -> FabricResult<()> {
        let view = self.effective_view();
        let bias = self.optimizer.take_for_cycle();

        let mut staged: Vec<RoutingEntry> = Vec::new();
        for (src, dst) in flows {
            match self.computer.compute(src, dst, &view, &bias) {
                Ok(entry) => staged.push(entry),
                Err(FabricError::NoPathAvailable { .. }) => {
                    // Program an explicit drop so the substrate never
                    // forwards along a stale path
                    staged.push(RoutingEntry {
                        source: src.clone(),
                        destination: dst.clone(),
                        paths: Vec::new(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        // Only stage entries that actually change the table
        staged.retain(|entry| self.routing.get(&entry.key()) != Some(entry));
        if staged.is_empty() {
            debug!("recompute produced no routing changes");
            return Ok(());
        }

        let deadline = self.config.recovery.recovery_deadline();
        let install = tokio::spawn(Self::install_with_retry(
            Arc::clone(&self.controller),
            staged.clone(),
            self.config.recovery.clone(),
        ));
        let installed = match timeout(deadline, install).await {
            Ok(Ok(installed)) => installed,
            Ok(Err(e)) => {
                return Err(FabricError::Internal {
                    message: format!("install task failed: {}", e),
                })
            }
            Err(_) => {
                return Err(FabricError::Timeout {
                    operation: "route installation".to_string(),
                    duration: deadline,
                })
            }
        };

        if installed {
            for entry in staged {
                let key = entry.key();
                if entry.paths.is_empty() {
                    self.mark_unreachable(&key);
                } else {
                    self.unreachable.remove(&flow_key(&key.0, &key.1));
                }
                self.routing.insert(key, entry);
            }
            Ok(())
        } else {
            // Exhausted: demote every staged flow rather than guessing
            // which sub-rules the substrate accepted
            let demoted = staged.len();
            for entry in staged {
                self.mark_unreachable(&entry.key());
            }
            Err(FabricError::InstallationFailure {
                destination: format!("{} flows", demoted),
                attempts: self.config.recovery.max_install_attempts,
                source: None,
            })
        }
    }

    /// Bounded install retries with exponential backoff
    ///
    /// Detached from the engine so a deadline overrun abandons the wait,
    /// never the work: each controller call still completes or rolls
    /// back atomically.
    async fn install_with_retry(
        controller: Arc<RoutingController>,
        entries: Vec<RoutingEntry>,
        config: RecoveryConfig,
    ) -> bool {
        let mut delay = config.retry_delay();
        for attempt in 1..=config.max_install_attempts {
            match controller.install(&entries).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(attempt, error = %e, "route installation failed");
                    if attempt < config.max_install_attempts {
                        tokio::time::sleep(delay).await;
                        delay = Duration::from_secs_f64(
                            delay.as_secs_f64() * config.backoff_multiplier,
                        );
                    }
                }
            }
        }
        false
    }

    /// Tear down all routes toward a failed host and blackhole the
    /// routes originating from it
    async fn demote_host(&mut self, host: &NodeId) {
        info!(host = %host, "host failed, removing its routes");
        if let Err(e) = self.controller.remove(&[host.clone()]).await {
            warn!(host = %host, error = %e, "failed to remove routes toward host");
        }
        let toward: Vec<FlowKey> = self
            .routing
            .keys()
            .filter(|(_, dst)| dst == host)
            .cloned()
            .collect();
        for key in toward {
            self.routing.remove(&key);
            self.mark_unreachable(&key);
        }

        let from: Vec<FlowKey> = self
            .routing
            .keys()
            .filter(|(src, _)| src == host)
            .cloned()
            .collect();
        if !from.is_empty() {
            if let Err(e) = self.recompute_and_install(&from).await {
                warn!(host = %host, error = %e, "demoting flows from failed host");
                for key in &from {
                    self.mark_unreachable(key);
                }
            }
        }
    }

    fn mark_unreachable(&mut self, key: &FlowKey) {
        self.unreachable.insert(flow_key(&key.0, &key.1));
    }

    /// Raw monitor view with control-Failed elements forced Down, so
    /// path computation never reuses an element whose recovery has not
    /// been confirmed
    fn effective_view(&self) -> StatusView {
        let mut view = self.view.clone();
        for (element, record) in &self.control {
            if record.state == ElementState::Failed {
                view.set_status(element.clone(), ElementStatus::Down);
            }
        }
        view
    }

    fn remember(&mut self, event: HealthEvent) {
        self.recent_events.push_back(event);
        while self.recent_events.len() > self.config.snapshot.recent_events {
            self.recent_events.pop_front();
        }
    }

    fn publish(&mut self) {
        self.revision += 1;
        let routing: BTreeMap<String, RoutingEntry> = self
            .routing
            .values()
            .map(|entry| (flow_key(&entry.source, &entry.destination), entry.clone()))
            .collect();
        let control: BTreeMap<String, ElementState> = self
            .control
            .iter()
            .filter(|(_, record)| record.state != ElementState::Healthy)
            .map(|(element, record)| (element.to_string(), record.state))
            .collect();
        let snapshot = StatusSnapshot {
            status: self.view.clone(),
            control,
            routing,
            unreachable: self.unreachable.clone(),
            recent_events: self.recent_events.iter().cloned().collect(),
            revision: self.revision,
        };
        // Observers may come and go; publishing to none is fine.
        let _ = self.snapshot_tx.send(snapshot);
    }

    pub fn control_state(&self, element: &ElementId) -> ElementState {
        self.control
            .get(element)
            .map(|r| r.state)
            .unwrap_or(ElementState::Healthy)
    }

    pub fn routing_entry(&self, source: &NodeId, destination: &NodeId) -> Option<&RoutingEntry> {
        self.routing.get(&(source.clone(), destination.clone()))
    }
}

fn entry_traverses(entry: &RoutingEntry, element: &ElementId) -> bool {
    entry.paths.iter().any(|wp| match element {
        ElementId::Node(node) => wp.path.traverses_node(node),
        ElementId::Link(link) => wp.path.traverses_link(link),
    })
}
