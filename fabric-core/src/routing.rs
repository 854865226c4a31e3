//! Routing installation against the forwarding substrate
//!
//! [`FlowProgrammer`] is the opaque boundary to the OpenFlow/flow-table
//! programmer. [`RoutingController`] layers the contract the recovery
//! engine relies on: idempotent installs and all-or-nothing application
//! per call, rolling back partially applied sub-rules before reporting
//! failure. It never touches topology or health state.

use crate::error::{FabricError, FabricResult};
use crate::types::{NodeId, RoutingEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Boundary to the external forwarding substrate
#[async_trait]
pub trait FlowProgrammer: Send + Sync {
    /// Program the forwarding rules for one host pair
    async fn apply(&self, entry: &RoutingEntry) -> FabricResult<()>;

    /// Remove the forwarding rules for one host pair
    async fn clear(&self, source: &NodeId, destination: &NodeId) -> FabricResult<()>;
}

type FlowKey = (NodeId, NodeId);

pub struct RoutingController {
    substrate: Arc<dyn FlowProgrammer>,
    installed: Mutex<HashMap<FlowKey, RoutingEntry>>,
}

impl RoutingController {
    pub fn new(substrate: Arc<dyn FlowProgrammer>) -> Self {
        Self {
            substrate,
            installed: Mutex::new(HashMap::new()),
        }
    }

    /// Install a set of routing entries atomically
    ///
    /// Entries identical to what is already installed are skipped
    /// (idempotent no-op success). If any sub-rule fails, sub-rules
    /// applied earlier in this call are rolled back to their prior
    /// state before the error is returned.
    pub async fn install(&self, entries: &[RoutingEntry]) -> FabricResult<()> {
        let mut installed = self.installed.lock().await;
        let mut applied: Vec<(FlowKey, Option<RoutingEntry>)> = Vec::new();

        for entry in entries {
            let key = entry.key();
            if installed.get(&key) == Some(entry) {
                debug!(source = %entry.source, destination = %entry.destination,
                    "entry already installed, skipping");
                continue;
            }
            match self.substrate.apply(entry).await {
                Ok(()) => {
                    let prior = installed.insert(key.clone(), entry.clone());
                    applied.push((key, prior));
                }
                Err(e) => {
                    self.rollback(&mut installed, applied).await;
                    return Err(FabricError::Substrate {
                        message: format!(
                            "apply for {}->{} failed: {}",
                            entry.source, entry.destination, e
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Remove all entries toward the given destinations, atomically
    pub async fn remove(&self, destinations: &[NodeId]) -> FabricResult<()> {
        let mut installed = self.installed.lock().await;
        let keys: Vec<FlowKey> = installed
            .keys()
            .filter(|(_, dst)| destinations.contains(dst))
            .cloned()
            .collect();

        let mut cleared: Vec<(FlowKey, Option<RoutingEntry>)> = Vec::new();
        for key in keys {
            match self.substrate.clear(&key.0, &key.1).await {
                Ok(()) => {
                    let prior = installed.remove(&key);
                    cleared.push((key, prior));
                }
                Err(e) => {
                    // Re-apply what this call already cleared
                    for (key, prior) in cleared.into_iter().rev() {
                        if let Some(entry) = prior {
                            if let Err(re) = self.substrate.apply(&entry).await {
                                warn!(source = %key.0, destination = %key.1, error = %re,
                                    "rollback re-apply failed");
                            }
                            installed.insert(key, entry);
                        }
                    }
                    return Err(FabricError::Substrate {
                        message: format!("clear for {}->{} failed: {}", key.0, key.1, e),
                    });
                }
            }
        }
        Ok(())
    }

    async fn rollback(
        &self,
        installed: &mut HashMap<FlowKey, RoutingEntry>,
        applied: Vec<(FlowKey, Option<RoutingEntry>)>,
    ) {
        for (key, prior) in applied.into_iter().rev() {
            let result = match &prior {
                Some(entry) => self.substrate.apply(entry).await,
                None => self.substrate.clear(&key.0, &key.1).await,
            };
            if let Err(e) = result {
                warn!(source = %key.0, destination = %key.1, error = %e,
                    "rollback of partially applied install failed");
            }
            match prior {
                Some(entry) => {
                    installed.insert(key, entry);
                }
                None => {
                    installed.remove(&key);
                }
            }
        }
    }

    pub async fn installed_entries(&self) -> Vec<RoutingEntry> {
        self.installed.lock().await.values().cloned().collect()
    }
}

/// In-memory substrate with scriptable failures, for tests and the
/// simulated run mode
#[derive(Default)]
pub struct MockFlowProgrammer {
    rules: parking_lot::Mutex<HashMap<FlowKey, RoutingEntry>>,
    apply_calls: AtomicUsize,
    /// Per-apply outcome script: `true` makes that apply fail. Empty
    /// script means every apply succeeds.
    apply_script: parking_lot::Mutex<std::collections::VecDeque<bool>>,
}

impl MockFlowProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome of upcoming apply calls, front first;
    /// `true` entries fail, and applies beyond the script succeed
    pub fn script_applies(&self, outcomes: impl IntoIterator<Item = bool>) {
        let mut script = self.apply_script.lock();
        script.clear();
        script.extend(outcomes);
    }

    /// Make the next `n` apply calls fail
    pub fn fail_next_applies(&self, n: usize) {
        self.script_applies(std::iter::repeat(true).take(n));
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn rules(&self) -> HashMap<(NodeId, NodeId), RoutingEntry> {
        self.rules.lock().clone()
    }

    pub fn rule_for(&self, source: &NodeId, destination: &NodeId) -> Option<RoutingEntry> {
        self.rules
            .lock()
            .get(&(source.clone(), destination.clone()))
            .cloned()
    }
}

#[async_trait]
impl FlowProgrammer for MockFlowProgrammer {
    async fn apply(&self, entry: &RoutingEntry) -> FabricResult<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let fail = self.apply_script.lock().pop_front().unwrap_or(false);
        if fail {
            return Err(FabricError::Substrate {
                message: "injected apply failure".to_string(),
            });
        }
        self.rules.lock().insert(entry.key(), entry.clone());
        Ok(())
    }

    async fn clear(&self, source: &NodeId, destination: &NodeId) -> FabricResult<()> {
        self.rules
            .lock()
            .remove(&(source.clone(), destination.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Path, WeightedPath};
    use pretty_assertions::assert_eq;

    fn entry(src: &str, dst: &str, via: &str) -> RoutingEntry {
        RoutingEntry {
            source: NodeId::from(src),
            destination: NodeId::from(dst),
            paths: vec![WeightedPath {
                path: Path {
                    hops: vec![NodeId::from(src), NodeId::from(via), NodeId::from(dst)],
                    cost: 1.0,
                },
                weight: 1.0,
            }],
        }
    }

    #[tokio::test]
    async fn install_is_idempotent() {
        let substrate = Arc::new(MockFlowProgrammer::new());
        let controller = RoutingController::new(substrate.clone());

        let entries = vec![entry("h1", "h2", "es1")];
        controller.install(&entries).await.unwrap();
        assert_eq!(substrate.apply_calls(), 1);

        // Second identical install is a no-op success
        controller.install(&entries).await.unwrap();
        assert_eq!(substrate.apply_calls(), 1);
        assert_eq!(substrate.rules().len(), 1);
    }

    #[tokio::test]
    async fn changed_entry_is_reapplied() {
        let substrate = Arc::new(MockFlowProgrammer::new());
        let controller = RoutingController::new(substrate.clone());

        controller.install(&[entry("h1", "h2", "es1")]).await.unwrap();
        controller.install(&[entry("h1", "h2", "es2")]).await.unwrap();
        assert_eq!(substrate.apply_calls(), 2);

        let rule = substrate
            .rule_for(&NodeId::from("h1"), &NodeId::from("h2"))
            .unwrap();
        assert_eq!(rule.paths[0].path.hops[1].as_str(), "es2");
    }

    #[tokio::test]
    async fn partial_failure_rolls_back_this_call() {
        let substrate = Arc::new(MockFlowProgrammer::new());
        let controller = RoutingController::new(substrate.clone());

        controller.install(&[entry("h1", "h2", "es1")]).await.unwrap();

        // In the next call the first sub-rule applies, the second fails.
        // Rollback must restore the prior h1->h2 rule and leave no trace
        // of the failed call.
        substrate.script_applies([false, true]);
        let batch = vec![entry("h1", "h2", "es2"), entry("h1", "h3", "es1")];
        let err = controller.install(&batch).await.unwrap_err();
        assert!(matches!(err, FabricError::Substrate { .. }));

        let rule = substrate
            .rule_for(&NodeId::from("h1"), &NodeId::from("h2"))
            .unwrap();
        assert_eq!(rule.paths[0].path.hops[1].as_str(), "es1");
        assert!(substrate
            .rule_for(&NodeId::from("h1"), &NodeId::from("h3"))
            .is_none());
        assert_eq!(controller.installed_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_clears_entries_toward_destinations() {
        let substrate = Arc::new(MockFlowProgrammer::new());
        let controller = RoutingController::new(substrate.clone());

        controller
            .install(&[
                entry("h1", "h2", "es1"),
                entry("h3", "h2", "es2"),
                entry("h1", "h5", "es1"),
            ])
            .await
            .unwrap();

        controller.remove(&[NodeId::from("h2")]).await.unwrap();
        let rules = substrate.rules();
        assert_eq!(rules.len(), 1);
        assert!(substrate
            .rule_for(&NodeId::from("h1"), &NodeId::from("h5"))
            .is_some());
        assert_eq!(controller.installed_entries().await.len(), 1);
    }
}
