//! Fleet orchestrator.
//!
//! Owns the registry, weather, routes, tick driver, replacement coordinator
//! and event bus, and is the single place control commands are executed.
//! Hosts call [`FleetSimulator::tick`] on whatever cadence they like; the
//! simulator never reads the wall clock.

use crate::config::{ConfigError, SimulationConfig};
use crate::driver::{DriverState, SimulationDriver, SimulationError, TickReport};
use crate::events::{EventBus, EventRecord, FleetEvent, FleetObserver};
use crate::fleet::registry::RegistryError;
use crate::fleet::route::default_routes;
use crate::fleet::{
    Bus, BusStatus, BusStatusMachine, FleetRegistry, RouteName, RouteTable, StatusError,
    StatusTransition, Weather, FULL_BATTERY_PERCENT,
};
use crate::protocol::{
    BusSnapshot, Command, CommandResponse, CommandType, FleetSnapshot, NegotiationSnapshot,
    ProtocolError, ProtocolHandler, ResponseStatus, StatusCounts,
};
use crate::replacement::{
    CoordinatorError, Negotiation, OpenOutcome, ReplacementCoordinator, ReplacementDecision,
};
use heapless::{spsc::Queue, Vec as BoundedVec};
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_COMMAND_QUEUE_SIZE: usize = 32;
const MAX_BUFFERED_RESPONSES: usize = 16;

type CommandQueue = Queue<Command, MAX_COMMAND_QUEUE_SIZE>;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("battery level {0} outside [0, 100]")]
    InvalidBatteryLevel(f64),
    #[error("command queue full")]
    CommandQueueFull,
}

impl SimulatorError {
    /// Errors caused by the request rather than by the simulator itself.
    fn is_rejection(&self) -> bool {
        matches!(
            self,
            SimulatorError::Coordinator(_)
                | SimulatorError::Registry(_)
                | SimulatorError::Status(_)
                | SimulatorError::InvalidBatteryLevel(_)
                | SimulatorError::Simulation(SimulationError::InvalidTickRate)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatorStats {
    pub command_count: u32,
    pub rejected_commands: u32,
    pub last_error: Option<String>,
}

pub struct FleetSimulator {
    config: SimulationConfig,
    registry: FleetRegistry,
    routes: RouteTable,
    weather: Weather,
    driver: SimulationDriver,
    coordinator: ReplacementCoordinator,
    events: EventBus,
    protocol_handler: ProtocolHandler,
    command_queue: CommandQueue,
    response_buffer: BoundedVec<CommandResponse, MAX_BUFFERED_RESPONSES>,
    stats: SimulatorStats,
}

impl FleetSimulator {
    /// Builds a simulator from `config`, loading the fleet and route files it
    /// names or falling back to the demo fleet and built-in routes.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulatorError> {
        config.validate()?;

        let routes = match &config.routes_file {
            Some(path) => RouteTable::from_records(&read_file(path)?),
            None => default_routes(),
        };
        let registry = match &config.fleet_file {
            Some(path) => FleetRegistry::from_records(&read_file(path)?, 0),
            None => FleetRegistry::demo(
                config.demo_fleet_size,
                config.demo_garage_count,
                config.demo_seed,
                0,
            ),
        };

        info!(buses = registry.len(), routes = routes.len(), "Fleet loaded");
        Self::with_fleet(config, registry, routes)
    }

    /// Builds a simulator around an existing fleet. Fails on an invalid
    /// configuration.
    pub fn with_fleet(
        config: SimulationConfig,
        registry: FleetRegistry,
        routes: RouteTable,
    ) -> Result<Self, SimulatorError> {
        Ok(Self {
            weather: config.weather,
            driver: SimulationDriver::new(&config)?,
            coordinator: ReplacementCoordinator::new(config.replacement),
            config,
            registry,
            routes,
            events: EventBus::new(),
            protocol_handler: ProtocolHandler::new(),
            command_queue: Queue::new(),
            response_buffer: BoundedVec::new(),
            stats: SimulatorStats::default(),
        })
    }

    pub fn start(&mut self) {
        self.driver.start();
    }

    pub fn stop(&mut self) {
        self.driver.stop();
    }

    pub fn is_running(&self) -> bool {
        self.driver.is_running()
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn weather(&self) -> &Weather {
        &self.weather
    }

    pub fn driver(&self) -> &SimulationDriver {
        &self.driver
    }

    pub fn driver_state(&self) -> DriverState {
        self.driver.state()
    }

    pub fn coordinator(&self) -> &ReplacementCoordinator {
        &self.coordinator
    }

    pub fn stats(&self) -> &SimulatorStats {
        &self.stats
    }

    pub fn clock_ms(&self) -> u64 {
        self.driver.clock_ms()
    }

    pub fn subscribe(&mut self, observer: impl FleetObserver + 'static) {
        self.events.subscribe(observer);
    }

    pub fn drain_events(&mut self) -> Vec<FleetEvent> {
        self.events.drain()
    }

    pub fn event_history(&self) -> &[EventRecord] {
        self.events.history()
    }

    pub fn active_negotiation(&self) -> Option<&Negotiation> {
        self.coordinator.active()
    }

    /// Runs one tick and routes its low-battery crossings to the coordinator.
    ///
    /// A due postponed negotiation is reopened before this tick's crossings
    /// are considered.
    pub fn tick(&mut self) -> Result<Option<TickReport>, SimulatorError> {
        let Some(report) = self.driver.tick(&mut self.registry, &self.weather, &mut self.events)?
        else {
            return Ok(None);
        };
        let now_ms = report.clock_ms;

        self.release_stale_negotiation(now_ms);
        if let Some(negotiation) = self.coordinator.poll(&self.registry, now_ms) {
            info!(bus = %negotiation.bus_id, "Postponed replacement reopened");
            self.publish_opened(&negotiation, now_ms);
        }

        for crossing in &report.low_battery {
            match self.coordinator.on_low_battery(&crossing.bus_id, &self.registry, now_ms) {
                Ok(OpenOutcome::Opened(negotiation)) => self.publish_opened(&negotiation, now_ms),
                Ok(OpenOutcome::Dropped { open_for }) => {
                    self.events.emit(FleetEvent::LowBatteryDropped {
                        bus_id: crossing.bus_id.clone(),
                        open_for,
                        at_ms: now_ms,
                    });
                }
                Err(e) => warn!(bus = %crossing.bus_id, %e, "Could not open negotiation"),
            }
        }

        self.events.emit(FleetEvent::TickCompleted {
            tick: report.tick,
            clock_ms: now_ms,
        });

        Ok(Some(report))
    }

    pub fn select_replacement(&mut self, candidate_id: &str) -> Result<ReplacementDecision, SimulatorError> {
        let now_ms = self.driver.clock_ms();
        let (decision, transition) = self.coordinator.select(candidate_id, &mut self.registry, now_ms)?;
        self.publish_transition(&transition);
        self.publish_decision(&decision);
        Ok(decision)
    }

    pub fn postpone_replacement(&mut self) -> Result<Option<ReplacementDecision>, SimulatorError> {
        let now_ms = self.driver.clock_ms();
        let decision = self.coordinator.postpone(now_ms)?;
        if let Some(decision) = &decision {
            self.publish_decision(decision);
        }
        Ok(decision)
    }

    pub fn cancel_replacement(&mut self) -> Option<ReplacementDecision> {
        let decision = self.coordinator.cancel(self.driver.clock_ms());
        if let Some(decision) = &decision {
            self.publish_decision(decision);
        }
        decision
    }

    pub fn assign_intercept(&mut self, bus_id: &str, route: RouteName) -> Result<StatusTransition, SimulatorError> {
        let now_ms = self.driver.clock_ms();
        let bus = self.bus_mut(bus_id)?;
        let transition = BusStatusMachine::assign_intercept(bus, route, now_ms)?;
        self.publish_transition(&transition);
        Ok(transition)
    }

    pub fn set_bus_status(&mut self, bus_id: &str, status: BusStatus) -> Result<Option<StatusTransition>, SimulatorError> {
        let now_ms = self.driver.clock_ms();
        let bus = self.bus_mut(bus_id)?;
        let transition = BusStatusMachine::override_status(bus, status, now_ms);
        if let Some(transition) = &transition {
            self.publish_transition(transition);
            self.release_stale_negotiation(now_ms);
        }
        Ok(transition)
    }

    /// Records an externally measured battery level.
    pub fn set_battery_level(&mut self, bus_id: &str, level: f64) -> Result<(), SimulatorError> {
        if !(0.0..=FULL_BATTERY_PERCENT).contains(&level) {
            return Err(SimulatorError::InvalidBatteryLevel(level));
        }
        let now_ms = self.driver.clock_ms();
        let bus = self.bus_mut(bus_id)?;
        bus.battery_level = level;
        bus.last_update_ms = now_ms;
        let bus_id = bus.id.clone();
        self.events.emit(FleetEvent::BatteryLevelChanged {
            bus_id,
            level,
            at_ms: now_ms,
        });
        Ok(())
    }

    pub fn set_weather(&mut self, weather: Weather) {
        info!(month = ?weather.month, raining = weather.raining, "Weather updated");
        self.weather = weather;
    }

    pub fn set_tick_rate(&mut self, seconds_per_tick: u64) -> Result<(), SimulatorError> {
        self.driver.set_tick_rate(seconds_per_tick)?;
        Ok(())
    }

    pub fn set_turbo(&mut self, enabled: bool) {
        self.driver.set_turbo(enabled);
    }

    pub fn add_bus(&mut self, bus: Bus) -> Result<(), SimulatorError> {
        self.registry.add(bus)?;
        Ok(())
    }

    pub fn remove_bus(&mut self, bus_id: &str) -> Result<Bus, SimulatorError> {
        let bus = self.registry.remove(bus_id)?;
        self.driver.clear_warning(&bus.id);
        self.release_stale_negotiation(self.driver.clock_ms());
        Ok(bus)
    }

    // The open negotiation must refer to a bus still driving its route.
    fn release_stale_negotiation(&mut self, now_ms: u64) {
        if let Some(decision) = self.coordinator.release_stale(&self.registry, now_ms) {
            self.publish_decision(&decision);
        }
    }

    pub fn bus_snapshot(&self, bus_id: &str) -> Option<BusSnapshot> {
        self.registry.get(bus_id).map(|bus| self.snapshot_of(bus))
    }

    pub fn fleet_snapshot(&self) -> FleetSnapshot {
        let state = self.driver.state();
        let buses: Vec<BusSnapshot> = self.registry.iter().map(|bus| self.snapshot_of(bus)).collect();
        let average_battery_level = if buses.is_empty() {
            0.0
        } else {
            buses.iter().map(|b| b.battery_level).sum::<f64>() / buses.len() as f64
        };

        FleetSnapshot {
            running: state.running,
            turbo: state.turbo,
            seconds_per_tick: self.driver.tick_duration_ms() / 1000,
            clock_ms: state.clock_ms,
            tick: state.tick_count,
            weather: self.weather,
            consumption_multiplier: self.weather.consumption_multiplier(),
            counts: StatusCounts::tally(self.registry.iter()),
            average_battery_level,
            buses,
            negotiation: self.coordinator.active().cloned(),
        }
    }

    pub fn negotiation_snapshot(&self) -> NegotiationSnapshot {
        NegotiationSnapshot {
            active: self.coordinator.active().cloned(),
            pending_reopens: self.coordinator.pending_reopens().to_vec(),
        }
    }

    pub fn queue_command(&mut self, command: Command) -> Result<(), SimulatorError> {
        self.command_queue
            .enqueue(command)
            .map_err(|_| SimulatorError::CommandQueueFull)
    }

    /// Executes every queued command, buffering the responses.
    pub fn process_commands(&mut self) {
        while let Some(command) = self.command_queue.dequeue() {
            let response = self.execute_command(command);
            if self.response_buffer.is_full() {
                self.response_buffer.remove(0);
            }
            let _ = self.response_buffer.push(response);
        }
    }

    pub fn get_responses(&self) -> &[CommandResponse] {
        &self.response_buffer
    }

    pub fn take_responses(&mut self) -> Vec<CommandResponse> {
        let responses = self.response_buffer.to_vec();
        self.response_buffer.clear();
        responses
    }

    pub fn execute_command(&mut self, command: Command) -> CommandResponse {
        self.stats.command_count = self.stats.command_count.wrapping_add(1);
        let id = command.id;

        if let Err(e) = self.protocol_handler.validate_command(&command) {
            self.stats.rejected_commands = self.stats.rejected_commands.wrapping_add(1);
            return self.protocol_handler.create_response(
                id,
                ResponseStatus::InvalidCommand,
                Some(&format!("Command validation failed: {}", e)),
            );
        }

        debug!(command = ?command.command_type, "Executing command");

        match self.run_command(id, command.command_type) {
            Ok(response) => response,
            Err(e) => {
                let status = if e.is_rejection() {
                    self.stats.rejected_commands = self.stats.rejected_commands.wrapping_add(1);
                    ResponseStatus::Rejected
                } else {
                    self.stats.last_error = Some(e.to_string());
                    ResponseStatus::Error
                };
                self.protocol_handler.create_response(id, status, Some(&e.to_string()))
            }
        }
    }

    fn run_command(&mut self, id: u32, command_type: CommandType) -> Result<CommandResponse, SimulatorError> {
        let response = match command_type {
            CommandType::Ping => self.protocol_handler.create_response(id, ResponseStatus::Success, Some("pong")),
            CommandType::FleetStatus => {
                let snapshot = self.fleet_snapshot();
                self.protocol_handler.create_data_response(id, None, &snapshot)
            }
            CommandType::BusStatus { bus_id } => match self.bus_snapshot(&bus_id) {
                Some(snapshot) => self.protocol_handler.create_data_response(id, None, &snapshot),
                None => return Err(RegistryError::UnknownBus(bus_id).into()),
            },
            CommandType::Start => {
                self.start();
                self.protocol_handler.create_response(id, ResponseStatus::Success, Some("simulation running"))
            }
            CommandType::Stop => {
                self.stop();
                self.protocol_handler.create_response(id, ResponseStatus::Success, Some("simulation stopped"))
            }
            CommandType::SetTickRate { seconds_per_tick } => {
                self.set_tick_rate(seconds_per_tick)?;
                self.protocol_handler.create_response(
                    id,
                    ResponseStatus::Success,
                    Some(&format!("{} s per tick", seconds_per_tick)),
                )
            }
            CommandType::SetTurbo { enabled } => {
                self.set_turbo(enabled);
                self.protocol_handler.create_response(
                    id,
                    ResponseStatus::Success,
                    Some(if enabled { "turbo on" } else { "turbo off" }),
                )
            }
            CommandType::Tick { count } => {
                if !self.is_running() {
                    return Ok(self.protocol_handler.create_response(
                        id,
                        ResponseStatus::Rejected,
                        Some("simulation is stopped"),
                    ));
                }
                let mut reports = Vec::new();
                for _ in 0..count {
                    match self.tick()? {
                        Some(report) => reports.push(report),
                        None => break,
                    }
                }
                let summary = serde_json::json!({
                    "ticks": reports.len(),
                    "clock_ms": self.clock_ms(),
                    "transitions": reports.iter().map(|r| r.transitions.len()).sum::<usize>(),
                    "low_battery": reports.iter().flat_map(|r| r.low_battery.iter().map(|c| c.bus_id.clone())).collect::<Vec<_>>(),
                });
                self.protocol_handler.create_data_response(id, None, &summary)
            }
            CommandType::SetWeather { month, raining } => {
                self.set_weather(Weather::new(month, raining));
                self.protocol_handler.create_response(
                    id,
                    ResponseStatus::Success,
                    Some(&format!("consumption multiplier {:.1}", self.weather.consumption_multiplier())),
                )
            }
            CommandType::SelectReplacement { candidate_id } => {
                let decision = self.select_replacement(&candidate_id)?;
                self.protocol_handler.create_data_response(id, Some("replacement dispatched"), &decision)
            }
            CommandType::PostponeReplacement => match self.postpone_replacement()? {
                Some(decision) => self.protocol_handler.create_data_response(id, Some("replacement postponed"), &decision),
                None => self.protocol_handler.create_response(id, ResponseStatus::Success, Some("nothing to postpone")),
            },
            CommandType::CancelReplacement => match self.cancel_replacement() {
                Some(decision) => self.protocol_handler.create_data_response(id, Some("replacement cancelled"), &decision),
                None => self.protocol_handler.create_response(id, ResponseStatus::Success, Some("nothing to cancel")),
            },
            CommandType::NegotiationStatus => {
                let snapshot = self.negotiation_snapshot();
                self.protocol_handler.create_data_response(id, None, &snapshot)
            }
            CommandType::AssignIntercept { bus_id, route } => {
                let transition = self.assign_intercept(&bus_id, route)?;
                self.protocol_handler.create_data_response(id, None, &transition)
            }
            CommandType::SetBusStatus { bus_id, status } => match self.set_bus_status(&bus_id, status)? {
                Some(transition) => self.protocol_handler.create_data_response(id, None, &transition),
                None => self.protocol_handler.create_response(id, ResponseStatus::Success, Some("status unchanged")),
            },
            CommandType::SetBatteryLevel { bus_id, level } => {
                self.set_battery_level(&bus_id, level)?;
                self.protocol_handler.create_response(
                    id,
                    ResponseStatus::Success,
                    Some(&format!("{} at {:.1}%", bus_id, level)),
                )
            }
            // Streaming is a property of the connection; the host wires it up.
            CommandType::Subscribe => {
                self.protocol_handler.create_response(id, ResponseStatus::Success, Some("subscribed"))
            }
        };
        Ok(response)
    }

    fn bus_mut(&mut self, bus_id: &str) -> Result<&mut Bus, SimulatorError> {
        self.registry
            .get_mut(bus_id)
            .ok_or_else(|| RegistryError::UnknownBus(bus_id.to_string()).into())
    }

    fn snapshot_of(&self, bus: &Bus) -> BusSnapshot {
        BusSnapshot::from_bus(
            bus,
            self.driver.model_spec(bus.model),
            &self.weather,
            self.driver.speed_kmh(),
        )
    }

    fn publish_opened(&mut self, negotiation: &Negotiation, now_ms: u64) {
        self.events.emit(FleetEvent::NegotiationOpened {
            negotiation_id: negotiation.id,
            bus_id: negotiation.bus_id.clone(),
            candidates: negotiation.candidates.clone(),
            can_postpone: negotiation.can_postpone(),
            at_ms: now_ms,
        });
    }

    fn publish_decision(&mut self, decision: &ReplacementDecision) {
        self.events.emit(FleetEvent::ReplacementDecided {
            negotiation_id: decision.negotiation_id,
            bus_id: decision.bus_id.clone(),
            outcome: decision.outcome.clone(),
            at_ms: decision.decided_at_ms,
        });
    }

    fn publish_transition(&mut self, transition: &StatusTransition) {
        self.events.emit(FleetEvent::StatusChanged {
            bus_id: transition.bus_id.clone(),
            from: transition.from,
            to: transition.to,
            at_ms: transition.at_ms,
        });
    }
}

fn read_file(path: &str) -> Result<String, SimulatorError> {
    std::fs::read_to_string(path).map_err(|e| SimulatorError::Config(ConfigError::Io(e)))
}
