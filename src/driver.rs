//! The tick engine.
//!
//! One tick is two passes over the fleet:
//!
//! 1. Status rules. Self-timed rules (Intercept, Returning, Charging) run
//!    first against each bus's own state. The Inroute handoff rule then runs
//!    against a snapshot taken after those commits, so the outcome never
//!    depends on fleet order.
//! 2. Numeric step. Battery drain or charge for the tick's simulated
//!    duration, plus status timers. A charge that reaches 100% parks the bus
//!    in the same tick.
//!
//! `StatusChanged` is published as each transition is committed, so a bus's
//! status change always precedes the level change it drives.
//!
//! Low-battery crossings are detected last, on the committed state.

use crate::events::{EventBus, FleetEvent};
use crate::fleet::battery::BatteryModel;
use crate::fleet::status::{BusView, StepContext};
use crate::fleet::{
    BusFault, BusModel, BusStatus, BusStatusMachine, FleetRegistry, ModelSpec, RouteName,
    StatusTransition, TransitionRules, Weather,
};
use crate::config::{ConfigError, SimulationConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MS_PER_SECOND: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("seconds per tick must be positive")]
    InvalidTickRate,
    #[error("model {model} is misconfigured: {source}")]
    Configuration {
        model: BusModel,
        #[source]
        source: BusFault,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    pub started_at_ms: u64,
    pub clock_ms: u64,
    pub transitions: Vec<StatusTransition>,
    /// Buses that crossed under the low-battery line this tick, in fleet order.
    pub low_battery: Vec<LowBatteryCrossing>,
    /// `(bus id, reason)` for every bus left untouched this tick.
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowBatteryCrossing {
    pub bus_id: String,
    pub level: f64,
    pub route: RouteName,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DriverState {
    pub running: bool,
    pub turbo: bool,
    pub seconds_per_tick: u64,
    pub turbo_seconds_per_tick: u64,
    pub clock_ms: u64,
    pub tick_count: u64,
}

pub struct SimulationDriver {
    machine: BusStatusMachine,
    seconds_per_tick: u64,
    turbo_seconds_per_tick: u64,
    turbo: bool,
    running: bool,
    clock_ms: u64,
    tick_count: u64,
    speed_kmh: f64,
    charge_power_kw: f64,
    model_overrides: HashMap<BusModel, ModelSpec>,
    // Buses already reported below the low-battery line this excursion.
    warned: HashSet<String>,
}

impl SimulationDriver {
    /// Builds a stopped driver. The configuration is validated first.
    pub fn new(config: &SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    fn from_validated(config: &SimulationConfig) -> Self {
        Self {
            machine: BusStatusMachine::new(config.rules),
            seconds_per_tick: config.seconds_per_tick,
            turbo_seconds_per_tick: config.turbo_seconds_per_tick,
            turbo: config.turbo,
            running: false,
            clock_ms: 0,
            tick_count: 0,
            speed_kmh: config.average_speed_kmh,
            charge_power_kw: config.charge_power_kw,
            model_overrides: HashMap::new(),
            warned: HashSet::new(),
        }
    }

    pub fn start(&mut self) {
        if !self.running {
            info!(clock_ms = self.clock_ms, "Simulation started");
        }
        self.running = true;
    }

    pub fn stop(&mut self) {
        if self.running {
            info!(clock_ms = self.clock_ms, ticks = self.tick_count, "Simulation stopped");
        }
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_tick_rate(&mut self, seconds_per_tick: u64) -> Result<(), SimulationError> {
        if seconds_per_tick == 0 {
            return Err(SimulationError::InvalidTickRate);
        }
        self.seconds_per_tick = seconds_per_tick;
        Ok(())
    }

    pub fn set_turbo(&mut self, enabled: bool) {
        self.turbo = enabled;
    }

    /// Replaces the built-in capacity and consumption figures for `model`.
    pub fn set_model_spec(&mut self, model: BusModel, spec: ModelSpec) {
        self.model_overrides.insert(model, spec);
    }

    pub fn model_spec(&self, model: BusModel) -> &ModelSpec {
        self.model_overrides.get(&model).unwrap_or_else(|| model.spec())
    }

    pub fn rules(&self) -> &TransitionRules {
        self.machine.rules()
    }

    pub fn speed_kmh(&self) -> f64 {
        self.speed_kmh
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn tick_duration_ms(&self) -> u64 {
        let seconds = if self.turbo {
            self.turbo_seconds_per_tick
        } else {
            self.seconds_per_tick
        };
        seconds.saturating_mul(MS_PER_SECOND)
    }

    pub fn state(&self) -> DriverState {
        DriverState {
            running: self.running,
            turbo: self.turbo,
            seconds_per_tick: self.seconds_per_tick,
            turbo_seconds_per_tick: self.turbo_seconds_per_tick,
            clock_ms: self.clock_ms,
            tick_count: self.tick_count,
        }
    }

    /// Forgets a bus's low-battery mark, e.g. after an admin edit.
    pub fn clear_warning(&mut self, bus_id: &str) {
        self.warned.retain(|id| !id.eq_ignore_ascii_case(bus_id));
    }

    /// Advances the fleet by one tick. Returns `Ok(None)` while stopped.
    ///
    /// A misconfigured model aborts the tick before anything is touched and
    /// stops the driver. A bus with a corrupt battery level is skipped and
    /// reported; the rest of the fleet still advances.
    pub fn tick(
        &mut self,
        registry: &mut FleetRegistry,
        weather: &Weather,
        events: &mut EventBus,
    ) -> Result<Option<TickReport>, SimulationError> {
        if !self.running {
            return Ok(None);
        }

        self.check_models(registry)?;

        let started_at_ms = self.clock_ms;
        let elapsed_ms = self.tick_duration_ms();
        let end_ms = started_at_ms.saturating_add(elapsed_ms);

        let mut report = TickReport {
            tick: self.tick_count + 1,
            started_at_ms,
            clock_ms: end_ms,
            ..TickReport::default()
        };

        let skip = self.find_corrupt(registry, &mut report, events, started_at_ms);

        // Pass 1a: self-timed rules
        for (bus, _) in registry.buses_mut().iter_mut().zip(&skip).filter(|(_, s)| !**s) {
            if let Some(transition) = self.machine.apply_timed(bus, started_at_ms) {
                publish_transition(events, &transition);
                report.transitions.push(transition);
            }
        }

        // Pass 1b: handoff against the post-1a snapshot
        let views: Vec<BusView> = registry.iter().map(BusView::from).collect();
        for (bus, _) in registry.buses_mut().iter_mut().zip(&skip).filter(|(_, s)| !**s) {
            if let Some(transition) = self.machine.apply_handoff(bus, &views, started_at_ms) {
                publish_transition(events, &transition);
                report.transitions.push(transition);
            }
        }

        // Pass 2: numeric step
        let ctx = StepContext {
            elapsed_ms,
            end_ms,
            weather_multiplier: weather.consumption_multiplier(),
            speed_kmh: self.speed_kmh,
            charge_power_kw: self.charge_power_kw,
        };
        for (bus, _) in registry.buses_mut().iter_mut().zip(&skip).filter(|(_, s)| !**s) {
            let spec = *self.model_spec(bus.model);
            match self.machine.apply_step(bus, &spec, &ctx) {
                Ok(update) => {
                    if update.level_changed() {
                        events.emit(FleetEvent::BatteryLevelChanged {
                            bus_id: bus.id.clone(),
                            level: update.level,
                            at_ms: end_ms,
                        });
                    }
                    if let Some(transition) = update.transition {
                        publish_transition(events, &transition);
                        report.transitions.push(transition);
                    }
                }
                Err(fault) if fault.is_configuration() => {
                    // check_models covers this; reaching it means a spec
                    // changed mid-tick
                    error!(bus = %bus.id, %fault, "Battery model failed mid-tick");
                    self.running = false;
                    return Err(SimulationError::Configuration {
                        model: bus.model,
                        source: fault,
                    });
                }
                Err(fault) => {
                    warn!(bus = %bus.id, %fault, "Skipping bus");
                    report.skipped.push((bus.id.clone(), fault.to_string()));
                }
            }
        }

        self.detect_low_battery(registry, &skip, &mut report, events, end_ms);

        self.clock_ms = end_ms;
        self.tick_count += 1;

        debug!(
            tick = report.tick,
            clock_ms = end_ms,
            transitions = report.transitions.len(),
            low_battery = report.low_battery.len(),
            skipped = report.skipped.len(),
            "Tick complete"
        );

        Ok(Some(report))
    }

    fn check_models(&mut self, registry: &FleetRegistry) -> Result<(), SimulationError> {
        for model in BusModel::ALL {
            if !registry.iter().any(|b| b.model == model) {
                continue;
            }
            if let Err(e) = BatteryModel::check_spec(self.model_spec(model)) {
                error!(%model, %e, "Battery model misconfigured, stopping simulation");
                self.running = false;
                return Err(SimulationError::Configuration {
                    model,
                    source: BusFault::from(e),
                });
            }
        }
        Ok(())
    }

    fn find_corrupt(
        &self,
        registry: &FleetRegistry,
        report: &mut TickReport,
        events: &mut EventBus,
        now_ms: u64,
    ) -> Vec<bool> {
        registry
            .iter()
            .map(|bus| match BusStatusMachine::check_integrity(bus) {
                Ok(()) => false,
                Err(fault) => {
                    warn!(bus = %bus.id, %fault, "Skipping bus");
                    let reason = fault.to_string();
                    events.emit(FleetEvent::BusSkipped {
                        bus_id: bus.id.clone(),
                        reason: reason.clone(),
                        at_ms: now_ms,
                    });
                    report.skipped.push((bus.id.clone(), reason));
                    true
                }
            })
            .collect()
    }

    fn detect_low_battery(
        &mut self,
        registry: &FleetRegistry,
        skip: &[bool],
        report: &mut TickReport,
        events: &mut EventBus,
        now_ms: u64,
    ) {
        let threshold = self.machine.rules().low_battery_percent;
        self.warned.retain(|id| registry.contains(id));

        for (bus, _) in registry.iter().zip(skip).filter(|(_, s)| !**s) {
            let low = bus.status == BusStatus::Inroute && bus.battery_level < threshold;
            if !low {
                self.warned.remove(&bus.id);
                continue;
            }
            if !self.warned.insert(bus.id.clone()) {
                continue;
            }

            info!(bus = %bus.id, level = bus.battery_level, route = %bus.route, "Low battery");
            events.emit(FleetEvent::LowBatteryCrossed {
                bus_id: bus.id.clone(),
                level: bus.battery_level,
                route: bus.route,
                at_ms: now_ms,
            });
            report.low_battery.push(LowBatteryCrossing {
                bus_id: bus.id.clone(),
                level: bus.battery_level,
                route: bus.route,
            });
        }
    }
}

fn publish_transition(events: &mut EventBus, transition: &StatusTransition) {
    events.emit(FleetEvent::StatusChanged {
        bus_id: transition.bus_id.clone(),
        from: transition.from,
        to: transition.to,
        at_ms: transition.at_ms,
    });
}

impl Default for SimulationDriver {
    fn default() -> Self {
        Self::from_validated(&SimulationConfig::default())
    }
}
