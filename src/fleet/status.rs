use super::battery::{BatteryError, BatteryModel};
use super::bus::{clamp_level, Bus, BusStatus, ModelSpec};
use super::route::RouteName;
use super::{FULL_BATTERY_PERCENT, LOW_BATTERY_THRESHOLD_PERCENT, MS_PER_HOUR, MS_PER_MINUTE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const HANDOFF_WINDOW_MINUTES: u64 = 30;
const RETURN_TRIP_MINUTES: u64 = 30;

/// Time gates of the automatic transition table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransitionRules {
    /// Intercept -> Inroute, and the Inroute -> Returning handoff window.
    pub handoff_window_ms: u64,
    /// Returning -> Charging.
    pub return_trip_ms: u64,
    pub low_battery_percent: f64,
}

impl Default for TransitionRules {
    fn default() -> Self {
        Self {
            handoff_window_ms: HANDOFF_WINDOW_MINUTES * MS_PER_MINUTE,
            return_trip_ms: RETURN_TRIP_MINUTES * MS_PER_MINUTE,
            low_battery_percent: f64::from(LOW_BATTERY_THRESHOLD_PERCENT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub bus_id: String,
    pub from: BusStatus,
    pub to: BusStatus,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("bus {bus_id} is {status} and cannot be dispatched")]
    NotDispatchable { bus_id: String, status: BusStatus },
    #[error("a dispatched bus needs a route")]
    NoRoute,
}

/// Per-bus failure while advancing one tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusFault {
    #[error("bus {bus_id} has a non-finite battery level")]
    CorruptBatteryLevel { bus_id: String },
    #[error("battery model misconfigured: {0}")]
    Configuration(#[from] BatteryError),
}

impl BusFault {
    /// Configuration faults are fatal; everything else is skipped per bus.
    pub fn is_configuration(&self) -> bool {
        matches!(self, BusFault::Configuration(_))
    }
}

/// The parts of a bus other buses' rules may look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusView {
    pub id: String,
    pub status: BusStatus,
    pub route: RouteName,
}

impl From<&Bus> for BusView {
    fn from(bus: &Bus) -> Self {
        Self {
            id: bus.id.clone(),
            status: bus.status,
            route: bus.route,
        }
    }
}

/// Inputs for one numeric step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    pub elapsed_ms: u64,
    pub end_ms: u64,
    pub weather_multiplier: f64,
    pub speed_kmh: f64,
    pub charge_power_kw: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumericUpdate {
    pub previous_level: f64,
    pub level: f64,
    pub transition: Option<StatusTransition>,
}

impl NumericUpdate {
    pub fn level_changed(&self) -> bool {
        self.previous_level != self.level
    }
}

#[derive(Debug, Clone, Default)]
pub struct BusStatusMachine {
    rules: TransitionRules,
}

impl BusStatusMachine {
    pub fn new(rules: TransitionRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &TransitionRules {
        &self.rules
    }

    /// Rules that only depend on the bus itself: Intercept, Returning and
    /// Charging. Commits and returns the transition, if any.
    pub fn apply_timed(&self, bus: &mut Bus, now_ms: u64) -> Option<StatusTransition> {
        match bus.status {
            BusStatus::Intercept if bus.time_in_status_ms >= self.rules.handoff_window_ms => {
                Some(Self::transition(bus, BusStatus::Inroute, now_ms))
            }
            BusStatus::Returning if bus.time_in_status_ms >= self.rules.return_trip_ms => {
                Some(Self::transition(bus, BusStatus::Charging, now_ms))
            }
            BusStatus::Charging if bus.battery_level >= FULL_BATTERY_PERCENT => {
                bus.battery_level = FULL_BATTERY_PERCENT;
                Some(Self::transition(bus, BusStatus::Garage, now_ms))
            }
            _ => None,
        }
    }

    /// Inroute -> Returning once a route-mate is intercepting and the
    /// low-battery handoff window has run out.
    pub fn apply_handoff(
        &self,
        bus: &mut Bus,
        fleet: &[BusView],
        now_ms: u64,
    ) -> Option<StatusTransition> {
        if bus.status != BusStatus::Inroute
            || bus.route.is_none()
            || bus.battery_level >= self.rules.low_battery_percent
            || bus.time_in_status_ms < self.rules.handoff_window_ms
        {
            return None;
        }

        let relieved = fleet.iter().any(|other| {
            other.id != bus.id && other.status == BusStatus::Intercept && other.route == bus.route
        });

        relieved.then(|| Self::transition(bus, BusStatus::Returning, now_ms))
    }

    /// Drains or charges the battery for one step and advances the status
    /// timer. A charge reaching 100% is clamped and parks the bus.
    pub fn apply_step(
        &self,
        bus: &mut Bus,
        spec: &ModelSpec,
        ctx: &StepContext,
    ) -> Result<NumericUpdate, BusFault> {
        Self::check_integrity(bus)?;

        let previous_level = bus.battery_level;
        if !bus.status.accrues_time() {
            return Ok(NumericUpdate {
                previous_level,
                level: previous_level,
                transition: None,
            });
        }

        let hours = ctx.elapsed_ms as f64 / MS_PER_HOUR as f64;
        let mut transition = None;

        if bus.status.is_in_service() {
            let distance_km = ctx.speed_kmh * hours;
            let used = BatteryModel::consume_for_distance(
                distance_km,
                spec.consumption_kwh_per_km,
                ctx.weather_multiplier,
                spec.battery_capacity_kwh,
            )?;
            bus.battery_level = clamp_level(previous_level - used);
        } else {
            let gained =
                BatteryModel::charge_for_duration(hours, ctx.charge_power_kw, spec.battery_capacity_kwh)?;
            let level = previous_level + gained;
            if level >= FULL_BATTERY_PERCENT {
                bus.battery_level = FULL_BATTERY_PERCENT;
                transition = Some(Self::transition(bus, BusStatus::Garage, ctx.end_ms));
            } else {
                bus.battery_level = clamp_level(level);
            }
        }

        if transition.is_none() {
            bus.time_in_status_ms = bus.time_in_status_ms.saturating_add(ctx.elapsed_ms);
        }
        bus.last_update_ms = ctx.end_ms;

        debug_assert!(
            (0.0..=FULL_BATTERY_PERCENT).contains(&bus.battery_level),
            "Battery level {} outside [0, 100] for {}",
            bus.battery_level,
            bus.id
        );

        Ok(NumericUpdate {
            previous_level,
            level: bus.battery_level,
            transition,
        })
    }

    /// Manual dispatch: Garage/Free -> Intercept on `route`.
    pub fn assign_intercept(
        bus: &mut Bus,
        route: RouteName,
        now_ms: u64,
    ) -> Result<StatusTransition, StatusError> {
        if !matches!(bus.status, BusStatus::Garage | BusStatus::Free) {
            return Err(StatusError::NotDispatchable {
                bus_id: bus.id.clone(),
                status: bus.status,
            });
        }
        if route.is_none() {
            return Err(StatusError::NoRoute);
        }
        bus.route = route;
        Ok(Self::transition(bus, BusStatus::Intercept, now_ms))
    }

    /// Admin override. `None` when the bus already has that status.
    pub fn override_status(bus: &mut Bus, to: BusStatus, now_ms: u64) -> Option<StatusTransition> {
        (bus.status != to).then(|| Self::transition(bus, to, now_ms))
    }

    /// Restarts the status timer without changing status. Used when a
    /// replacement is dispatched for a bus that keeps driving.
    pub fn restart_status_timer(bus: &mut Bus) {
        bus.time_in_status_ms = 0;
    }

    pub fn check_integrity(bus: &Bus) -> Result<(), BusFault> {
        if bus.battery_level.is_finite() {
            Ok(())
        } else {
            Err(BusFault::CorruptBatteryLevel {
                bus_id: bus.id.clone(),
            })
        }
    }

    pub fn transition(bus: &mut Bus, to: BusStatus, now_ms: u64) -> StatusTransition {
        let from = bus.status;
        bus.status = to;
        bus.time_in_status_ms = 0;
        bus.status_changed_at_ms = now_ms;
        if matches!(to, BusStatus::Returning | BusStatus::Charging | BusStatus::Garage) {
            bus.replacing_bus = None;
        }

        debug!(bus = %bus.id, %from, %to, at_ms = now_ms, "status transition");

        StatusTransition {
            bus_id: bus.id.clone(),
            from,
            to,
            at_ms: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::bus::BusModel;

    const MINUTE: u64 = MS_PER_MINUTE;

    fn step(elapsed_ms: u64, end_ms: u64) -> StepContext {
        StepContext {
            elapsed_ms,
            end_ms,
            weather_multiplier: 1.0,
            speed_kmh: 20.0,
            charge_power_kw: 150.0,
        }
    }

    #[test]
    fn test_intercept_promotes_after_window() {
        let machine = BusStatusMachine::default();
        let mut bus = Bus::new("B", BusModel::YutongE12)
            .with_status(BusStatus::Intercept)
            .with_route(RouteName::R1A);
        bus.time_in_status_ms = 29 * MINUTE;
        assert!(machine.apply_timed(&mut bus, 0).is_none());

        bus.time_in_status_ms = 30 * MINUTE;
        let t = machine.apply_timed(&mut bus, 5_000).unwrap();
        assert_eq!((t.from, t.to), (BusStatus::Intercept, BusStatus::Inroute));
        assert_eq!(bus.route, RouteName::R1A);
        assert_eq!(bus.time_in_status_ms, 0);
        assert_eq!(bus.status_changed_at_ms, 5_000);
    }

    #[test]
    fn test_returning_goes_to_charging() {
        let machine = BusStatusMachine::default();
        let mut bus = Bus::new("A", BusModel::BydK9).with_status(BusStatus::Returning);
        bus.replacing_bus = Some("Z".to_string());
        bus.time_in_status_ms = 31 * MINUTE;
        let t = machine.apply_timed(&mut bus, 0).unwrap();
        assert_eq!(t.to, BusStatus::Charging);
        assert!(bus.replacing_bus.is_none());
    }

    #[test]
    fn test_handoff_requires_intercepting_route_mate() {
        let machine = BusStatusMachine::default();
        let mut bus = Bus::new("A", BusModel::YutongE12)
            .with_status(BusStatus::Inroute)
            .with_route(RouteName::R10)
            .with_battery_level(25.0);
        bus.time_in_status_ms = 30 * MINUTE;

        let other_route = vec![BusView {
            id: "B".into(),
            status: BusStatus::Intercept,
            route: RouteName::R11,
        }];
        assert!(machine.apply_handoff(&mut bus, &other_route, 0).is_none());

        let inroute_mate = vec![BusView {
            id: "B".into(),
            status: BusStatus::Inroute,
            route: RouteName::R10,
        }];
        assert!(machine.apply_handoff(&mut bus, &inroute_mate, 0).is_none());

        let intercepting = vec![BusView {
            id: "B".into(),
            status: BusStatus::Intercept,
            route: RouteName::R10,
        }];
        let t = machine.apply_handoff(&mut bus, &intercepting, 0).unwrap();
        assert_eq!(t.to, BusStatus::Returning);
    }

    #[test]
    fn test_handoff_waits_for_window_and_low_battery() {
        let machine = BusStatusMachine::default();
        let fleet = vec![BusView {
            id: "B".into(),
            status: BusStatus::Intercept,
            route: RouteName::R10,
        }];
        let mut bus = Bus::new("A", BusModel::YutongE12)
            .with_status(BusStatus::Inroute)
            .with_route(RouteName::R10)
            .with_battery_level(25.0);
        bus.time_in_status_ms = 10 * MINUTE;
        assert!(machine.apply_handoff(&mut bus, &fleet, 0).is_none());

        bus.time_in_status_ms = 45 * MINUTE;
        bus.battery_level = 30.0;
        assert!(machine.apply_handoff(&mut bus, &fleet, 0).is_none());
    }

    #[test]
    fn test_numeric_step_scenario() {
        let machine = BusStatusMachine::default();
        let spec = ModelSpec { battery_capacity_kwh: 100.0, consumption_kwh_per_km: 1.0 };
        let mut bus = Bus::new("A", BusModel::Volvo7900E)
            .with_status(BusStatus::Inroute)
            .with_battery_level(50.0);

        let update = machine.apply_step(&mut bus, &spec, &step(60 * MINUTE, 60 * MINUTE)).unwrap();
        assert!((update.level - 30.0).abs() < 1e-9);
        assert!(update.level_changed());
        assert_eq!(bus.time_in_status_ms, 60 * MINUTE);
        assert_eq!(bus.last_update_ms, 60 * MINUTE);
    }

    #[test]
    fn test_parked_bus_accrues_nothing() {
        let machine = BusStatusMachine::default();
        for status in [BusStatus::Garage, BusStatus::Free, BusStatus::Repair] {
            let mut bus = Bus::new("P", BusModel::YutongE12)
                .with_status(status)
                .with_battery_level(70.0);
            let spec = bus.spec();
            let update = machine.apply_step(&mut bus, spec, &step(MINUTE, MINUTE)).unwrap();
            assert!(!update.level_changed());
            assert_eq!(bus.time_in_status_ms, 0);
        }
    }

    #[test]
    fn test_charge_clamps_and_parks() {
        let machine = BusStatusMachine::default();
        let mut bus = Bus::new("C", BusModel::YutongE12)
            .with_status(BusStatus::Charging)
            .with_battery_level(95.0);
        // 150 kW for 30 min into 422 kWh is ~17.8%
        let spec = bus.spec();
        let update = machine.apply_step(&mut bus, spec, &step(30 * MINUTE, 90 * MINUTE)).unwrap();
        assert_eq!(update.level, 100.0);
        assert_eq!(bus.status, BusStatus::Garage);
        assert_eq!(bus.status_changed_at_ms, 90 * MINUTE);
        assert_eq!(bus.time_in_status_ms, 0);
    }

    #[test]
    fn test_drain_clamps_at_empty() {
        let machine = BusStatusMachine::default();
        let mut bus = Bus::new("D", BusModel::BydK9)
            .with_status(BusStatus::Returning)
            .with_battery_level(0.5);
        let spec = bus.spec();
        machine.apply_step(&mut bus, spec, &step(60 * MINUTE, 60 * MINUTE)).unwrap();
        assert_eq!(bus.battery_level, 0.0);
    }

    #[test]
    fn test_corrupt_level_is_reported() {
        let machine = BusStatusMachine::default();
        let mut bus = Bus::new("X", BusModel::BydK9).with_status(BusStatus::Inroute);
        bus.battery_level = f64::NAN;
        let spec = bus.spec();
        let fault = machine.apply_step(&mut bus, spec, &step(MINUTE, MINUTE)).unwrap_err();
        assert!(!fault.is_configuration());
    }

    #[test]
    fn test_bad_spec_is_configuration_fault() {
        let machine = BusStatusMachine::default();
        let spec = ModelSpec { battery_capacity_kwh: 0.0, consumption_kwh_per_km: 1.0 };
        let mut bus = Bus::new("Y", BusModel::BydK9)
            .with_status(BusStatus::Inroute)
            .with_battery_level(60.0);
        let fault = machine.apply_step(&mut bus, &spec, &step(MINUTE, MINUTE)).unwrap_err();
        assert!(fault.is_configuration());
        assert_eq!(bus.battery_level, 60.0);
    }

    #[test]
    fn test_assign_intercept_guards() {
        let mut bus = Bus::new("G", BusModel::YutongE12);
        assert_eq!(
            BusStatusMachine::assign_intercept(&mut bus, RouteName::None, 0),
            Err(StatusError::NoRoute)
        );
        let t = BusStatusMachine::assign_intercept(&mut bus, RouteName::R13, 0).unwrap();
        assert_eq!(t.to, BusStatus::Intercept);
        assert_eq!(bus.route, RouteName::R13);
        assert!(BusStatusMachine::assign_intercept(&mut bus, RouteName::R13, 0).is_err());
    }
}
