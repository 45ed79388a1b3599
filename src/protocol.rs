use crate::events::FleetEvent;
use crate::fleet::battery::BatteryModel;
use crate::fleet::{
    Bus, BusModel, BusStatus, ModelSpec, Month, RouteName, Weather, FULL_BATTERY_PERCENT,
    RESERVE_BATTERY_PERCENT,
};
use crate::replacement::{Negotiation, PendingReopen};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_COMMAND_SIZE: usize = 512;
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024;
/// Upper bound for a single `Tick { count }` request.
pub const MAX_TICKS_PER_COMMAND: u32 = 10_000;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub timestamp: u64,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    Ping,
    FleetStatus,
    BusStatus { bus_id: String },
    Start,
    Stop,
    SetTickRate { seconds_per_tick: u64 },
    SetTurbo { enabled: bool },
    Tick { count: u32 },
    SetWeather { month: Month, raining: bool },
    SelectReplacement { candidate_id: String },
    PostponeReplacement,
    CancelReplacement,
    NegotiationStatus,
    AssignIntercept { bus_id: String, route: RouteName },
    SetBusStatus { bus_id: String, status: BusStatus },
    SetBatteryLevel { bus_id: String, level: f64 },
    /// Stream domain events on this connection.
    Subscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp: u64,
    pub status: ResponseStatus,
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Error,
    InvalidCommand,
    /// Well-formed, but refused in the current state.
    Rejected,
}

/// One bus as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSnapshot {
    pub id: String,
    pub model: BusModel,
    pub year: String,
    pub battery_level: f64,
    pub status: BusStatus,
    pub route: RouteName,
    pub time_in_status_minutes: f64,
    pub last_update_ms: u64,
    pub is_critical: bool,
    pub replacing_bus: Option<String>,
    /// Driving hours left before the reserve floor, for buses in service.
    pub hours_until_reserve: Option<f64>,
}

impl BusSnapshot {
    pub fn from_bus(bus: &Bus, spec: &ModelSpec, weather: &Weather, speed_kmh: f64) -> Self {
        let hours_until_reserve = if bus.is_in_service() {
            BatteryModel::hours_until_reserve(
                bus.battery_level,
                f64::from(RESERVE_BATTERY_PERCENT),
                spec,
                weather.consumption_multiplier(),
                speed_kmh,
            )
            .ok()
        } else {
            None
        };

        Self {
            id: bus.id.clone(),
            model: bus.model,
            year: bus.year.clone(),
            battery_level: bus.battery_level,
            status: bus.status,
            route: bus.route,
            time_in_status_minutes: bus.time_in_status_minutes(),
            last_update_ms: bus.last_update_ms,
            is_critical: bus.is_critical(),
            replacing_bus: bus.replacing_bus.clone(),
            hours_until_reserve,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub inroute: u32,
    pub intercept: u32,
    pub returning: u32,
    pub charging: u32,
    pub garage: u32,
    pub free: u32,
    pub repair: u32,
}

impl StatusCounts {
    pub fn tally<'a>(buses: impl IntoIterator<Item = &'a Bus>) -> Self {
        let mut counts = Self::default();
        for bus in buses {
            let slot = match bus.status {
                BusStatus::Inroute => &mut counts.inroute,
                BusStatus::Intercept => &mut counts.intercept,
                BusStatus::Returning => &mut counts.returning,
                BusStatus::Charging => &mut counts.charging,
                BusStatus::Garage => &mut counts.garage,
                BusStatus::Free => &mut counts.free,
                BusStatus::Repair => &mut counts.repair,
            };
            *slot += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub running: bool,
    pub turbo: bool,
    pub seconds_per_tick: u64,
    pub clock_ms: u64,
    pub tick: u64,
    pub weather: Weather,
    pub consumption_multiplier: f64,
    pub counts: StatusCounts,
    pub average_battery_level: f64,
    pub buses: Vec<BusSnapshot>,
    pub negotiation: Option<Negotiation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSnapshot {
    pub active: Option<Negotiation>,
    pub pending_reopens: Vec<PendingReopen>,
}

/// Event line pushed to subscribed connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: FleetEvent,
}

pub struct ProtocolHandler {
    command_counter: u32,
    event_sequence: u64,
    command_buffer: CommandBuffer,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            command_counter: 0,
            event_sequence: 0,
            command_buffer: ArrayString::new(),
        }
    }

    pub fn parse_command(&mut self, json_str: &str) -> Result<Command, ProtocolError> {
        self.command_buffer.clear();
        self.command_buffer
            .try_push_str(json_str.trim())
            .map_err(|_| ProtocolError::MessageTooLarge)?;

        serde_json::from_str::<Command>(&self.command_buffer)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn serialize_response(&self, response: &CommandResponse) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(response).map_err(|_| ProtocolError::SerializationError)?;
        if json.len() > MAX_RESPONSE_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        Ok(json)
    }

    pub fn serialize_event(&mut self, event: &FleetEvent) -> Result<String, ProtocolError> {
        self.event_sequence = self.event_sequence.wrapping_add(1);
        let message = EventMessage {
            sequence: self.event_sequence,
            event: event.clone(),
        };
        serde_json::to_string(&message).map_err(|_| ProtocolError::SerializationError)
    }

    pub fn validate_command(&self, command: &Command) -> Result<(), ProtocolError> {
        if command.id == 0 {
            return Err(ProtocolError::InvalidCommand);
        }

        match &command.command_type {
            CommandType::BusStatus { bus_id }
            | CommandType::AssignIntercept { bus_id, .. }
            | CommandType::SetBusStatus { bus_id, .. }
            | CommandType::SelectReplacement { candidate_id: bus_id }
                if bus_id.trim().is_empty() =>
            {
                Err(ProtocolError::InvalidParameter("bus id must not be empty".into()))
            }
            CommandType::SetBatteryLevel { level, .. }
                if !(0.0..=FULL_BATTERY_PERCENT).contains(level) =>
            {
                Err(ProtocolError::InvalidParameter(format!(
                    "battery level {} outside [0, 100]",
                    level
                )))
            }
            CommandType::SetBatteryLevel { bus_id, .. } if bus_id.trim().is_empty() => {
                Err(ProtocolError::InvalidParameter("bus id must not be empty".into()))
            }
            CommandType::SetTickRate { seconds_per_tick: 0 } => Err(
                ProtocolError::InvalidParameter("seconds per tick must be positive".into()),
            ),
            CommandType::Tick { count } if *count == 0 || *count > MAX_TICKS_PER_COMMAND => {
                Err(ProtocolError::InvalidParameter(format!(
                    "tick count must be within 1..={}",
                    MAX_TICKS_PER_COMMAND
                )))
            }
            CommandType::AssignIntercept { route, .. } if route.is_none() => {
                Err(ProtocolError::InvalidParameter("a route is required".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn create_response(
        &self,
        command_id: u32,
        status: ResponseStatus,
        message: Option<&str>,
    ) -> CommandResponse {
        CommandResponse {
            id: command_id,
            timestamp: unix_millis(),
            status,
            message: message.map(str::to_string),
            data: None,
        }
    }

    pub fn create_data_response<T: Serialize>(
        &self,
        command_id: u32,
        message: Option<&str>,
        data: &T,
    ) -> CommandResponse {
        match serde_json::to_value(data) {
            Ok(value) => CommandResponse {
                data: Some(value),
                ..self.create_response(command_id, ResponseStatus::Success, message)
            },
            Err(e) => self.create_response(
                command_id,
                ResponseStatus::Error,
                Some(&format!("Failed to encode response data: {}", e)),
            ),
        }
    }

    pub fn next_command_id(&mut self) -> u32 {
        self.command_counter = self.command_counter.wrapping_add(1);
        if self.command_counter == 0 {
            self.command_counter = 1;
        }
        self.command_counter
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message exceeds buffer size")]
    MessageTooLarge,
    #[error("serialization failed")]
    SerializationError,
    #[error("invalid command")]
    InvalidCommand,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(command_type: CommandType) -> Command {
        Command {
            id: 1,
            timestamp: 0,
            command_type,
        }
    }

    #[test]
    fn test_parse_command() {
        let mut handler = ProtocolHandler::new();
        let parsed = handler
            .parse_command(r#"{"id":7,"timestamp":0,"command_type":{"SetTurbo":{"enabled":true}}}"#)
            .unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.command_type, CommandType::SetTurbo { enabled: true });

        let parsed = handler
            .parse_command(r#"{"id":8,"timestamp":0,"command_type":"Ping"}"#)
            .unwrap();
        assert_eq!(parsed.command_type, CommandType::Ping);
    }

    #[test]
    fn test_oversized_command_rejected() {
        let mut handler = ProtocolHandler::new();
        let huge = format!(r#"{{"id":1,"timestamp":0,"command_type":{{"BusStatus":{{"bus_id":"{}"}}}}}}"#, "X".repeat(600));
        assert_eq!(handler.parse_command(&huge).unwrap_err(), ProtocolError::MessageTooLarge);
    }

    #[test]
    fn test_battery_level_bounds() {
        let handler = ProtocolHandler::new();
        let set = |level| command(CommandType::SetBatteryLevel { bus_id: "BUS001".into(), level });
        assert!(handler.validate_command(&set(0.0)).is_ok());
        assert!(handler.validate_command(&set(100.0)).is_ok());
        assert!(handler.validate_command(&set(100.5)).is_err());
        assert!(handler.validate_command(&set(-1.0)).is_err());
        assert!(handler.validate_command(&set(f64::NAN)).is_err());
    }

    #[test]
    fn test_parameter_validation() {
        let handler = ProtocolHandler::new();
        assert!(handler.validate_command(&command(CommandType::Tick { count: 0 })).is_err());
        assert!(handler.validate_command(&command(CommandType::SetTickRate { seconds_per_tick: 0 })).is_err());
        assert!(handler
            .validate_command(&command(CommandType::AssignIntercept { bus_id: "B".into(), route: RouteName::None }))
            .is_err());
        assert!(handler
            .validate_command(&command(CommandType::SelectReplacement { candidate_id: " ".into() }))
            .is_err());

        let mut zero_id = command(CommandType::Ping);
        zero_id.id = 0;
        assert_eq!(handler.validate_command(&zero_id), Err(ProtocolError::InvalidCommand));
    }

    #[test]
    fn test_reserve_estimate_only_in_service() {
        let weather = Weather::default();
        let parked = Bus::new("G", BusModel::YutongE12);
        assert!(BusSnapshot::from_bus(&parked, parked.spec(), &weather, 20.0).hours_until_reserve.is_none());

        let driving = parked.clone().with_status(BusStatus::Inroute).with_battery_level(13.0);
        assert_eq!(BusSnapshot::from_bus(&driving, driving.spec(), &weather, 20.0).hours_until_reserve, Some(0.0));
    }

    #[test]
    fn test_event_message_is_flat() {
        let mut handler = ProtocolHandler::new();
        let line = handler
            .serialize_event(&FleetEvent::TickCompleted { tick: 3, clock_ms: 3000 })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["sequence"], 1);
        assert_eq!(value["event"], "TickCompleted");
        assert_eq!(value["tick"], 3);
    }
}
