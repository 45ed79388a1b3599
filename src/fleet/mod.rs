pub mod battery;
pub mod bus;
pub mod registry;
pub mod route;
pub mod status;
pub mod weather;

pub use battery::{BatteryError, BatteryModel};
pub use bus::{Bus, BusModel, BusStatus, ModelSpec};
pub use registry::FleetRegistry;
pub use route::{Route, RouteName, RouteTable};
pub use status::{BusFault, BusStatusMachine, StatusError, StatusTransition, TransitionRules};
pub use weather::{Month, Weather};

use static_assertions::const_assert;

/// Below this level an in-service bus is considered low on battery.
pub const LOW_BATTERY_THRESHOLD_PERCENT: u8 = 30;
/// Minimum level for a garaged bus to be offered as a replacement.
pub const REPLACEMENT_MIN_BATTERY_PERCENT: u8 = 50;
/// `Bus::is_critical` threshold.
pub const CRITICAL_BATTERY_PERCENT: u8 = 20;
/// Floor used for the driving-time-left estimate.
pub const RESERVE_BATTERY_PERCENT: u8 = 13;

pub const FULL_BATTERY_PERCENT: f64 = 100.0;
pub const EMPTY_BATTERY_PERCENT: f64 = 0.0;

pub const MS_PER_MINUTE: u64 = 60_000;
pub const MS_PER_HOUR: u64 = 3_600_000;

// A replacement must never itself be below the low-battery line.
const_assert!(REPLACEMENT_MIN_BATTERY_PERCENT > LOW_BATTERY_THRESHOLD_PERCENT);
const_assert!(LOW_BATTERY_THRESHOLD_PERCENT > CRITICAL_BATTERY_PERCENT);
const_assert!(CRITICAL_BATTERY_PERCENT > RESERVE_BATTERY_PERCENT);
