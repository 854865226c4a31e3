//! Active health probing with hysteresis
//!
//! Probes every node and link on a fixed schedule through a [`Prober`],
//! tracks per-element success/failure streaks and a rolling latency
//! window, and emits a [`HealthEvent`] for every status transition.
//! Events go into a bounded channel; when the consumer stalls the
//! monitor blocks on `send` rather than dropping a failure signal.
//!
//! Transition rules:
//! - Up -> Suspect after a single probe failure
//! - Suspect -> Down after `failure_threshold` consecutive failures
//! - Suspect -> Up after `success_threshold` consecutive successes
//! - Down -> Suspect after `success_threshold` consecutive successes,
//!   and only the subsequent Suspect -> Up completes the recovery
//!
//! Probe timeouts count as failures; probe errors never escape the loop.

use crate::config::ProbeConfig;
use crate::error::{FabricError, FabricResult};
use crate::topology::TopologyModel;
use crate::types::{ElementId, ElementStatus, HealthEvent, HealthEventKind};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Active reachability/latency probe for a single element
///
/// Implementations talk to the real network (or a simulation); the
/// monitor adds the timeout on top, so probes may block indefinitely.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe one element, returning measured latency in milliseconds
    async fn probe(&self, element: &ElementId) -> FabricResult<f64>;
}

/// Per-element probe bookkeeping
#[derive(Debug, Clone)]
struct ProbeRecord {
    status: ElementStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Set while an element climbs out of Down; the Suspect -> Up edge
    /// then emits Recovery instead of a plain transition
    recovering: bool,
    latency_window: VecDeque<f64>,
}

impl ProbeRecord {
    fn new() -> Self {
        Self {
            status: ElementStatus::Up,
            consecutive_failures: 0,
            consecutive_successes: 0,
            recovering: false,
            latency_window: VecDeque::new(),
        }
    }
}

/// Outcome of folding one probe result into a record
struct Transition {
    prior: ElementStatus,
    new: ElementStatus,
    kind: HealthEventKind,
}

fn apply_probe_outcome(
    record: &mut ProbeRecord,
    success: bool,
    config: &ProbeConfig,
) -> Option<Transition> {
    let prior = record.status;
    if success {
        record.consecutive_failures = 0;
        record.consecutive_successes += 1;
        match record.status {
            ElementStatus::Up => None,
            ElementStatus::Suspect => {
                if record.consecutive_successes >= config.success_threshold {
                    record.status = ElementStatus::Up;
                    record.consecutive_successes = 0;
                    let kind = if record.recovering {
                        HealthEventKind::Recovery
                    } else {
                        HealthEventKind::Transition
                    };
                    record.recovering = false;
                    Some(Transition {
                        prior,
                        new: ElementStatus::Up,
                        kind,
                    })
                } else {
                    None
                }
            }
            ElementStatus::Down => {
                if record.consecutive_successes >= config.success_threshold {
                    record.status = ElementStatus::Suspect;
                    record.consecutive_successes = 0;
                    record.recovering = true;
                    Some(Transition {
                        prior,
                        new: ElementStatus::Suspect,
                        kind: HealthEventKind::Transition,
                    })
                } else {
                    None
                }
            }
        }
    } else {
        record.consecutive_successes = 0;
        record.consecutive_failures += 1;
        match record.status {
            ElementStatus::Up => {
                record.status = ElementStatus::Suspect;
                Some(Transition {
                    prior,
                    new: ElementStatus::Suspect,
                    kind: HealthEventKind::Transition,
                })
            }
            ElementStatus::Suspect => {
                if record.consecutive_failures >= config.failure_threshold {
                    record.status = ElementStatus::Down;
                    record.consecutive_failures = 0;
                    record.recovering = false;
                    Some(Transition {
                        prior,
                        new: ElementStatus::Down,
                        kind: HealthEventKind::Failure,
                    })
                } else {
                    None
                }
            }
            ElementStatus::Down => None,
        }
    }
}

/// Periodic prober for all topology elements
pub struct HealthMonitor {
    prober: Arc<dyn Prober>,
    config: ProbeConfig,
    events_tx: mpsc::Sender<HealthEvent>,
    records: Arc<Mutex<HashMap<ElementId, ProbeRecord>>>,
    task_handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(
        topology: Arc<TopologyModel>,
        prober: Arc<dyn Prober>,
        config: ProbeConfig,
        events_tx: mpsc::Sender<HealthEvent>,
    ) -> Self {
        let records = topology
            .nodes()
            .map(|n| (ElementId::Node(n.id.clone()), ProbeRecord::new()))
            .chain(
                topology
                    .links()
                    .map(|l| (ElementId::Link(l.id.clone()), ProbeRecord::new())),
            )
            .collect();
        Self {
            prober,
            config,
            events_tx,
            records: Arc::new(Mutex::new(records)),
            task_handle: None,
        }
    }

    /// Spawn the periodic probe task
    pub fn start(&mut self) {
        info!(
            interval_ms = self.config.interval_ms,
            timeout_ms = self.config.timeout_ms,
            "starting health monitor"
        );
        let prober = Arc::clone(&self.prober);
        let config = self.config.clone();
        let events_tx = self.events_tx.clone();
        let records = Arc::clone(&self.records);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = Self::probe_cycle(&prober, &config, &events_tx, &records).await {
                    // Channel gone means the engine shut down; stop probing.
                    warn!(error = %e, "probe cycle aborted");
                    break;
                }
            }
        });
        self.task_handle = Some(handle);
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            info!("stopping health monitor");
            handle.abort();
        }
    }

    /// Run a single probe cycle over every element
    ///
    /// All probes of a cycle run concurrently, so a stalled element
    /// costs one probe timeout per cycle rather than one per element.
    /// Outcomes are folded into the records in sorted element order to
    /// keep event emission deterministic. Errors only when the event
    /// channel is closed; individual probe failures feed the hysteresis
    /// counters instead.
    async fn probe_cycle(
        prober: &Arc<dyn Prober>,
        config: &ProbeConfig,
        events_tx: &mpsc::Sender<HealthEvent>,
        records: &Arc<Mutex<HashMap<ElementId, ProbeRecord>>>,
    ) -> FabricResult<()> {
        // Element set was derived from the topology at construction time.
        let mut elements: Vec<ElementId> = {
            let records = records.lock();
            records.keys().cloned().collect()
        };
        elements.sort_by_key(|e| e.to_string());

        let mut probes = JoinSet::new();
        for element in elements.iter().cloned() {
            let prober = Arc::clone(prober);
            let probe_timeout = config.timeout();
            let timeout_ms = config.timeout_ms;
            probes.spawn(async move {
                let outcome = match timeout(probe_timeout, prober.probe(&element)).await {
                    Ok(Ok(latency_ms)) => Some(latency_ms),
                    Ok(Err(e)) => {
                        trace!(element = %element, error = %e, "probe failed");
                        None
                    }
                    Err(_) => {
                        trace!(element = %element, timeout_ms, "probe timed out");
                        None
                    }
                };
                (element, outcome)
            });
        }
        let mut outcomes: HashMap<ElementId, Option<f64>> = HashMap::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok((element, outcome)) = joined {
                outcomes.insert(element, outcome);
            }
        }

        for element in elements {
            let outcome = outcomes.remove(&element).flatten();
            let event = {
                let mut records = records.lock();
                let record = records
                    .entry(element.clone())
                    .or_insert_with(ProbeRecord::new);
                if let Some(latency) = outcome {
                    record.latency_window.push_back(latency);
                    while record.latency_window.len() > config.latency_window {
                        record.latency_window.pop_front();
                    }
                }
                apply_probe_outcome(record, outcome.is_some(), config).map(|t| HealthEvent {
                    element: element.clone(),
                    prior: t.prior,
                    new: t.new,
                    kind: t.kind,
                    latency_ms: outcome,
                    timestamp: Utc::now(),
                })
            };

            if let Some(event) = event {
                debug!(element = %event.element, prior = %event.prior, new = %event.new,
                    "status transition");
                events_tx
                    .send(event)
                    .await
                    .map_err(|_| FabricError::ChannelClosed {
                        channel: "health events".to_string(),
                    })?;
            }
        }
        Ok(())
    }

    /// Run one cycle against this monitor's own state, for callers that
    /// drive probing manually
    pub async fn run_cycle(&self) -> FabricResult<()> {
        Self::probe_cycle(&self.prober, &self.config, &self.events_tx, &self.records).await
    }

    pub fn status_of(&self, element: &ElementId) -> Option<ElementStatus> {
        self.records.lock().get(element).map(|r| r.status)
    }

    /// Mean of the rolling latency window, if any samples exist
    pub fn mean_latency_ms(&self, element: &ElementId) -> Option<f64> {
        let records = self.records.lock();
        let window = &records.get(element)?.latency_window;
        if window.is_empty() {
            return None;
        }
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shared fault set driving [`SimProber`], the simulated counterpart of
/// taking interfaces down on the real network
#[derive(Clone, Default)]
pub struct FaultInjector {
    down: Arc<RwLock<HashSet<ElementId>>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, element: ElementId) {
        self.down.write().insert(element);
    }

    pub fn restore(&self, element: &ElementId) {
        self.down.write().remove(element);
    }

    pub fn is_down(&self, element: &ElementId) -> bool {
        let down = self.down.read();
        if down.contains(element) {
            return true;
        }
        // A link is unreachable when either endpoint node is down
        if let ElementId::Link(link) = element {
            let (a, b) = link.endpoints();
            return down.contains(&ElementId::Node(a.clone()))
                || down.contains(&ElementId::Node(b.clone()));
        }
        false
    }
}

/// Prober over the fault set, with jittered synthetic latencies
pub struct SimProber {
    faults: FaultInjector,
    base_latency_ms: f64,
}

impl SimProber {
    pub fn new(faults: FaultInjector) -> Self {
        Self {
            faults,
            base_latency_ms: 1.0,
        }
    }
}

#[async_trait]
impl Prober for SimProber {
    async fn probe(&self, element: &ElementId) -> FabricResult<f64> {
        if self.faults.is_down(element) {
            return Err(FabricError::ProbeFailed {
                element: element.to_string(),
                reason: "element is down".to_string(),
            });
        }
        let jitter: f64 = rand::random::<f64>() * 0.2;
        Ok(self.base_latency_ms + jitter)
    }
}
