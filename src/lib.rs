//! # Electric Bus Fleet Simulator
//!
//! A tick-driven simulation of an electric bus fleet: battery drain and
//! charging, time-gated status transitions, and operator-driven replacement
//! of buses that run low on charge.
//!
//! ## Features
//!
//! - **Battery modelling**: per-model capacity and consumption, seasonal and
//!   rain multipliers, charging at a fixed power
//! - **Status machine**: Intercept, Inroute, Returning and Charging rules on a
//!   simulated clock
//! - **Low-battery detection**: edge-triggered, once per excursion
//! - **Replacement negotiation**: single-flight select / postpone / cancel
//! - **Events**: observer contract plus a bounded history
//! - **JSON line protocol**: the same commands the TCP host and CLI speak
//!
//! ## Quick Start
//!
//! ```rust
//! use busfleet::{FleetSimulator, SimulationConfig};
//!
//! let mut sim = FleetSimulator::new(SimulationConfig::default()).unwrap();
//! sim.start();
//!
//! if let Ok(Some(report)) = sim.tick() {
//!     println!("tick {} at {} ms", report.tick, report.clock_ms);
//! }
//!
//! for event in sim.drain_events() {
//!     println!("{:?}", event);
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`fleet`] - buses, models, routes, weather, battery arithmetic and the
//!   status machine
//! - [`driver`] - the two-pass tick engine
//! - [`replacement`] - replacement negotiation
//! - [`events`] - domain events and observers
//! - [`simulator`] - orchestrator and command execution
//! - [`protocol`] - command/response protocol and snapshots
//! - [`config`] - simulation configuration

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod driver;
pub mod events;
pub mod fleet;
pub mod protocol;
pub mod replacement;
pub mod simulator;

pub use config::{ConfigError, SimulationConfig};
pub use driver::{SimulationDriver, SimulationError, TickReport};
pub use events::{EventBus, FleetEvent, FleetObserver};
pub use fleet::{Bus, BusModel, BusStatus, FleetRegistry, Month, RouteName, Weather};
pub use protocol::{Command, CommandResponse, CommandType, ProtocolHandler, ResponseStatus};
pub use replacement::{ReplacementCoordinator, ReplacementOutcome};
pub use simulator::{FleetSimulator, SimulatorError};
