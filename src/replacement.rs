//! Single-flight replacement negotiation.
//!
//! A low-battery crossing opens a negotiation offering every garaged bus with
//! enough charge. The operator then selects one, postpones (at most twice),
//! or cancels. Only one negotiation is ever open; crossings for other buses
//! that arrive meanwhile are dropped, not queued.

use crate::fleet::{
    BusStatus, BusStatusMachine, FleetRegistry, RouteName, StatusError, StatusTransition,
    LOW_BATTERY_THRESHOLD_PERCENT, MS_PER_MINUTE, REPLACEMENT_MIN_BATTERY_PERCENT,
};
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_POSTPONEMENTS: u8 = 2;
const POSTPONE_DELAY_MINUTES: u64 = 30;
const MAX_PENDING_REOPENS: usize = 16;

const_assert!(MAX_POSTPONEMENTS > 0);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplacementPolicy {
    pub candidate_min_battery_percent: f64,
    pub low_battery_percent: f64,
    pub postpone_delay_ms: u64,
    pub max_postponements: u8,
}

impl Default for ReplacementPolicy {
    fn default() -> Self {
        Self {
            candidate_min_battery_percent: f64::from(REPLACEMENT_MIN_BATTERY_PERCENT),
            low_battery_percent: f64::from(LOW_BATTERY_THRESHOLD_PERCENT),
            postpone_delay_ms: POSTPONE_DELAY_MINUTES * MS_PER_MINUTE,
            max_postponements: MAX_POSTPONEMENTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Negotiation {
    pub id: u32,
    pub bus_id: String,
    pub route: RouteName,
    pub opened_at_ms: u64,
    pub candidates: Vec<String>,
    pub postpone_count: u8,
    pub max_postponements: u8,
}

impl Negotiation {
    pub fn can_postpone(&self) -> bool {
        self.postpone_count < self.max_postponements
    }

    pub fn is_candidate(&self, bus_id: &str) -> bool {
        self.candidates.iter().any(|c| c.eq_ignore_ascii_case(bus_id.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReopen {
    pub bus_id: String,
    pub due_at_ms: u64,
    pub postpone_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum ReplacementOutcome {
    Selected { candidate_id: String },
    Postponed { reopen_at_ms: u64, can_postpone: bool },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementDecision {
    pub negotiation_id: u32,
    pub bus_id: String,
    pub outcome: ReplacementOutcome,
    pub decided_at_ms: u64,
}

/// What happened to a low-battery crossing handed to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Opened(Negotiation),
    Dropped { open_for: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("no replacement negotiation is open")]
    NothingOpen,
    #[error("bus {0} is not a replacement candidate")]
    NotACandidate(String),
    #[error("unknown bus {0}")]
    UnknownBus(String),
    #[error("postponement limit of {0} reached, select or cancel")]
    PostponeLimitReached(u8),
    #[error("too many postponed negotiations")]
    ReopenQueueFull,
    #[error(transparent)]
    Status(#[from] StatusError),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub opened: u32,
    pub selected: u32,
    pub postponed: u32,
    pub cancelled: u32,
    pub dropped_events: u32,
    pub discarded_reopens: u32,
    pub released: u32,
}

#[derive(Debug)]
pub struct ReplacementCoordinator {
    policy: ReplacementPolicy,
    active: Option<Negotiation>,
    pending: BoundedVec<PendingReopen, MAX_PENDING_REOPENS>,
    next_negotiation_id: u32,
    stats: CoordinatorStats,
}

impl ReplacementCoordinator {
    pub fn new(policy: ReplacementPolicy) -> Self {
        Self {
            policy,
            active: None,
            pending: BoundedVec::new(),
            next_negotiation_id: 1,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn policy(&self) -> &ReplacementPolicy {
        &self.policy
    }

    pub fn active(&self) -> Option<&Negotiation> {
        self.active.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn pending_reopens(&self) -> &[PendingReopen] {
        &self.pending
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Garaged buses charged to at least the policy minimum, in fleet order.
    pub fn candidates(&self, registry: &FleetRegistry) -> Vec<String> {
        registry
            .iter()
            .filter(|b| {
                b.status == BusStatus::Garage
                    && b.battery_level >= self.policy.candidate_min_battery_percent
            })
            .map(|b| b.id.clone())
            .collect()
    }

    /// Reacts to a `LowBatteryCrossed` event.
    pub fn on_low_battery(
        &mut self,
        bus_id: &str,
        registry: &FleetRegistry,
        now_ms: u64,
    ) -> Result<OpenOutcome, CoordinatorError> {
        if let Some(open) = &self.active {
            self.stats.dropped_events = self.stats.dropped_events.saturating_add(1);
            warn!(
                bus = bus_id,
                open_for = %open.bus_id,
                "Low-battery event dropped, a negotiation is already open"
            );
            return Ok(OpenOutcome::Dropped {
                open_for: open.bus_id.clone(),
            });
        }

        let negotiation = self.open(bus_id, 0, registry, now_ms)?;
        Ok(OpenOutcome::Opened(negotiation))
    }

    /// Reopens the earliest postponed negotiation that has come due, if the
    /// coordinator is idle. Reopens for buses that no longer need a
    /// replacement are discarded.
    pub fn poll(&mut self, registry: &FleetRegistry, now_ms: u64) -> Option<Negotiation> {
        if self.active.is_some() {
            return None;
        }

        loop {
            let index = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, p)| p.due_at_ms <= now_ms)
                .min_by_key(|(_, p)| p.due_at_ms)
                .map(|(i, _)| i)?;
            let reopen = self.pending.remove(index);

            let still_low = registry.get(&reopen.bus_id).map_or(false, |b| {
                b.status == BusStatus::Inroute && b.battery_level < self.policy.low_battery_percent
            });
            if !still_low {
                self.stats.discarded_reopens = self.stats.discarded_reopens.saturating_add(1);
                info!(bus = %reopen.bus_id, "Postponed replacement no longer needed");
                continue;
            }

            // The bus was just looked up, so this cannot be UnknownBus.
            return self
                .open(&reopen.bus_id, reopen.postpone_count, registry, now_ms)
                .ok();
        }
    }

    /// Dispatches `candidate_id` to take over the low-battery bus's route.
    ///
    /// The low-battery bus stays `Inroute` with its status timer restarted,
    /// which opens its handoff window.
    pub fn select(
        &mut self,
        candidate_id: &str,
        registry: &mut FleetRegistry,
        now_ms: u64,
    ) -> Result<(ReplacementDecision, StatusTransition), CoordinatorError> {
        let negotiation = self.active.as_ref().ok_or(CoordinatorError::NothingOpen)?;

        if !negotiation.is_candidate(candidate_id) {
            return Err(CoordinatorError::NotACandidate(candidate_id.to_string()));
        }
        let candidate = registry
            .get(candidate_id)
            .ok_or_else(|| CoordinatorError::UnknownBus(candidate_id.to_string()))?;
        // The fleet keeps moving while the operator decides.
        if candidate.status != BusStatus::Garage
            || candidate.battery_level < self.policy.candidate_min_battery_percent
        {
            return Err(CoordinatorError::NotACandidate(candidate_id.to_string()));
        }
        let low_bus = registry
            .get(&negotiation.bus_id)
            .ok_or_else(|| CoordinatorError::UnknownBus(negotiation.bus_id.clone()))?;
        let route = low_bus.route;
        let low_bus_id = low_bus.id.clone();

        let transition = {
            let candidate = registry
                .get_mut(candidate_id)
                .ok_or_else(|| CoordinatorError::UnknownBus(candidate_id.to_string()))?;
            let transition = BusStatusMachine::assign_intercept(candidate, route, now_ms)?;
            candidate.replacing_bus = Some(low_bus_id.clone());
            transition
        };
        if let Some(low_bus) = registry.get_mut(&low_bus_id) {
            BusStatusMachine::restart_status_timer(low_bus);
        }

        let decision = self.close(
            ReplacementOutcome::Selected {
                candidate_id: transition.bus_id.clone(),
            },
            now_ms,
        )?;
        self.stats.selected = self.stats.selected.saturating_add(1);
        info!(bus = %low_bus_id, replacement = %transition.bus_id, %route, "Replacement dispatched");
        Ok((decision, transition))
    }

    /// Closes the negotiation and schedules a reopen for the same bus.
    ///
    /// With nothing open this is a no-op. Past the postponement limit the
    /// negotiation stays open and the caller must select or cancel.
    pub fn postpone(&mut self, now_ms: u64) -> Result<Option<ReplacementDecision>, CoordinatorError> {
        let Some(negotiation) = self.active.as_ref() else {
            return Ok(None);
        };
        if !negotiation.can_postpone() {
            return Err(CoordinatorError::PostponeLimitReached(negotiation.max_postponements));
        }
        if self.pending.is_full() {
            return Err(CoordinatorError::ReopenQueueFull);
        }

        let postpone_count = negotiation.postpone_count + 1;
        let reopen = PendingReopen {
            bus_id: negotiation.bus_id.clone(),
            due_at_ms: now_ms.saturating_add(self.policy.postpone_delay_ms),
            postpone_count,
        };
        let reopen_at_ms = reopen.due_at_ms;
        let _ = self.pending.push(reopen);

        let decision = self.close(
            ReplacementOutcome::Postponed {
                reopen_at_ms,
                can_postpone: postpone_count < self.policy.max_postponements,
            },
            now_ms,
        )?;
        self.stats.postponed = self.stats.postponed.saturating_add(1);
        info!(bus = %decision.bus_id, reopen_at_ms, postpone_count, "Replacement postponed");
        Ok(Some(decision))
    }

    /// Closes the negotiation without touching the fleet. No-op when idle.
    pub fn cancel(&mut self, now_ms: u64) -> Option<ReplacementDecision> {
        let decision = self.close(ReplacementOutcome::Cancelled, now_ms).ok()?;
        self.stats.cancelled = self.stats.cancelled.saturating_add(1);
        warn!(bus = %decision.bus_id, "Replacement cancelled, bus continues below threshold");
        Some(decision)
    }

    /// Cancels the open negotiation once its bus has left the fleet or is no
    /// longer `Inroute`. No-op otherwise.
    pub fn release_stale(&mut self, registry: &FleetRegistry, now_ms: u64) -> Option<ReplacementDecision> {
        let negotiation = self.active.as_ref()?;
        let still_driving = registry
            .get(&negotiation.bus_id)
            .map_or(false, |b| b.status == BusStatus::Inroute);
        if still_driving {
            return None;
        }

        let decision = self.close(ReplacementOutcome::Cancelled, now_ms).ok()?;
        self.stats.cancelled = self.stats.cancelled.saturating_add(1);
        self.stats.released = self.stats.released.saturating_add(1);
        info!(bus = %decision.bus_id, "Replacement withdrawn, bus no longer in route");
        Some(decision)
    }

    fn open(
        &mut self,
        bus_id: &str,
        postpone_count: u8,
        registry: &FleetRegistry,
        now_ms: u64,
    ) -> Result<Negotiation, CoordinatorError> {
        let bus = registry
            .get(bus_id)
            .ok_or_else(|| CoordinatorError::UnknownBus(bus_id.to_string()))?;

        let negotiation = Negotiation {
            id: self.next_negotiation_id,
            bus_id: bus.id.clone(),
            route: bus.route,
            opened_at_ms: now_ms,
            candidates: self.candidates(registry),
            postpone_count,
            max_postponements: self.policy.max_postponements,
        };
        self.next_negotiation_id = self.next_negotiation_id.wrapping_add(1);
        self.stats.opened = self.stats.opened.saturating_add(1);

        debug!(
            negotiation = negotiation.id,
            bus = %negotiation.bus_id,
            candidates = negotiation.candidates.len(),
            "Replacement negotiation opened"
        );

        self.active = Some(negotiation.clone());
        Ok(negotiation)
    }

    fn close(
        &mut self,
        outcome: ReplacementOutcome,
        now_ms: u64,
    ) -> Result<ReplacementDecision, CoordinatorError> {
        let negotiation = self.active.take().ok_or(CoordinatorError::NothingOpen)?;
        Ok(ReplacementDecision {
            negotiation_id: negotiation.id,
            bus_id: negotiation.bus_id,
            outcome,
            decided_at_ms: now_ms,
        })
    }
}

impl Default for ReplacementCoordinator {
    fn default() -> Self {
        Self::new(ReplacementPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{Bus, BusModel};

    fn fleet() -> FleetRegistry {
        FleetRegistry::from_buses([
            Bus::new("A", BusModel::YutongE12)
                .with_status(BusStatus::Inroute)
                .with_route(RouteName::R1A)
                .with_battery_level(29.0),
            Bus::new("B", BusModel::YutongE12).with_battery_level(80.0),
            Bus::new("C", BusModel::YutongE12).with_battery_level(49.0),
            Bus::new("D", BusModel::YutongE12).with_battery_level(50.0),
            Bus::new("E", BusModel::YutongE12)
                .with_status(BusStatus::Charging)
                .with_battery_level(90.0),
        ])
    }

    #[test]
    fn test_candidate_threshold_is_inclusive() {
        let coordinator = ReplacementCoordinator::default();
        assert_eq!(coordinator.candidates(&fleet()), vec!["B".to_string(), "D".to_string()]);
    }

    #[test]
    fn test_single_flight_drops_second_event() {
        let mut registry = fleet();
        registry
            .add(Bus::new("F", BusModel::BydK9).with_status(BusStatus::Inroute).with_battery_level(10.0))
            .unwrap();
        let mut coordinator = ReplacementCoordinator::default();

        assert!(matches!(
            coordinator.on_low_battery("A", &registry, 0).unwrap(),
            OpenOutcome::Opened(_)
        ));
        assert_eq!(
            coordinator.on_low_battery("F", &registry, 0).unwrap(),
            OpenOutcome::Dropped { open_for: "A".to_string() }
        );
        assert_eq!(coordinator.active().unwrap().bus_id, "A");
        assert_eq!(coordinator.stats().dropped_events, 1);
    }

    #[test]
    fn test_select_rejects_non_candidates() {
        let mut registry = fleet();
        let mut coordinator = ReplacementCoordinator::default();
        coordinator.on_low_battery("A", &registry, 0).unwrap();

        assert_eq!(
            coordinator.select("C", &mut registry, 0).unwrap_err(),
            CoordinatorError::NotACandidate("C".to_string())
        );
        assert!(coordinator.is_open());
    }

    #[test]
    fn test_postpone_idle_is_noop() {
        let mut coordinator = ReplacementCoordinator::default();
        assert_eq!(coordinator.postpone(0), Ok(None));
        assert!(coordinator.cancel(0).is_none());
        assert_eq!(coordinator.stats().postponed, 0);
    }

    #[test]
    fn test_reopen_discarded_when_bus_recovered() {
        let mut registry = fleet();
        let mut coordinator = ReplacementCoordinator::default();
        coordinator.on_low_battery("A", &registry, 0).unwrap();
        coordinator.postpone(0).unwrap();

        registry.get_mut("A").unwrap().battery_level = 45.0;
        assert!(coordinator.poll(&registry, 30 * MS_PER_MINUTE).is_none());
        assert!(coordinator.pending_reopens().is_empty());
        assert_eq!(coordinator.stats().discarded_reopens, 1);
    }

    #[test]
    fn test_negotiation_released_when_bus_leaves_route() {
        let mut registry = fleet();
        let mut coordinator = ReplacementCoordinator::default();
        coordinator.on_low_battery("A", &registry, 0).unwrap();

        // Still driving: nothing to release
        assert!(coordinator.release_stale(&registry, 0).is_none());
        assert!(coordinator.is_open());

        registry.get_mut("A").unwrap().status = BusStatus::Repair;
        let decision = coordinator.release_stale(&registry, 5).unwrap();
        assert_eq!(decision.bus_id, "A");
        assert_eq!(decision.outcome, ReplacementOutcome::Cancelled);
        assert!(!coordinator.is_open());
        assert_eq!(coordinator.stats().released, 1);

        coordinator.on_low_battery("A", &registry, 10).unwrap();
        registry.remove("A").unwrap();
        assert!(coordinator.release_stale(&registry, 10).is_some());
        assert_eq!(coordinator.stats().released, 2);
    }
}
