//! Ingress port for external optimizer feedback
//!
//! The latency optimizer pushes per-link cost multipliers at its own
//! pace. Updates are latched here and only picked up at the start of
//! the next path-computation cycle, never mid-computation. Out-of-range
//! multipliers are clamped rather than rejected so a misbehaving
//! optimizer cannot destabilize routing; disabling the port via config
//! pins the bias at neutral.

use crate::config::OptimizerConfig;
use crate::types::{CostBias, LinkId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

pub struct OptimizerFeedbackPort {
    config: OptimizerConfig,
    latched: Mutex<Option<CostBias>>,
}

impl OptimizerFeedbackPort {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            latched: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Accept a bias payload, clamping every multiplier into the
    /// allowed range. The previous latched payload, if any, is replaced.
    pub fn submit(&self, raw: HashMap<LinkId, f64>) {
        let (bias, clamped) = CostBias::from_raw(raw);
        if clamped > 0 {
            warn!(clamped, "optimizer bias values clamped into allowed range");
        }
        debug!(links = bias.len(), "cost bias latched");
        *self.latched.lock() = Some(bias);
    }

    /// Consume the latched bias for one computation cycle
    ///
    /// The bias resets to neutral after being taken; the optimizer must
    /// refresh it to keep steering subsequent cycles. A disabled port
    /// always yields neutral.
    pub fn take_for_cycle(&self) -> CostBias {
        if !self.config.enabled {
            return CostBias::neutral();
        }
        self.latched.lock().take().unwrap_or_else(CostBias::neutral)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeId, COST_BIAS_MAX, COST_BIAS_MIN};

    fn link(a: &str, b: &str) -> LinkId {
        LinkId::new(NodeId::from(a), NodeId::from(b))
    }

    #[test]
    fn bias_is_consumed_once_per_cycle() {
        let port = OptimizerFeedbackPort::new(OptimizerConfig { enabled: true });
        let mut raw = HashMap::new();
        raw.insert(link("ar1", "cr1"), 1.5);
        port.submit(raw);

        let bias = port.take_for_cycle();
        assert_eq!(bias.factor(&link("ar1", "cr1")), 1.5);

        // Not refreshed: the next cycle runs neutral
        assert!(port.take_for_cycle().is_neutral());
    }

    #[test]
    fn out_of_range_values_are_clamped_not_rejected() {
        let port = OptimizerFeedbackPort::new(OptimizerConfig { enabled: true });
        let mut raw = HashMap::new();
        raw.insert(link("ar1", "cr1"), 100.0);
        raw.insert(link("ar2", "cr1"), 0.0);
        port.submit(raw);

        let bias = port.take_for_cycle();
        assert_eq!(bias.factor(&link("ar1", "cr1")), COST_BIAS_MAX);
        assert_eq!(bias.factor(&link("ar2", "cr1")), COST_BIAS_MIN);
    }

    #[test]
    fn disabled_port_always_yields_neutral() {
        let port = OptimizerFeedbackPort::new(OptimizerConfig { enabled: false });
        let mut raw = HashMap::new();
        raw.insert(link("ar1", "cr1"), 1.5);
        port.submit(raw);
        assert!(port.take_for_cycle().is_neutral());
    }

    #[test]
    fn resubmission_replaces_latched_payload() {
        let port = OptimizerFeedbackPort::new(OptimizerConfig { enabled: true });
        let mut first = HashMap::new();
        first.insert(link("ar1", "cr1"), 1.5);
        port.submit(first);
        let mut second = HashMap::new();
        second.insert(link("ar1", "cr1"), 0.8);
        port.submit(second);

        assert_eq!(port.take_for_cycle().factor(&link("ar1", "cr1")), 0.8);
    }
}
