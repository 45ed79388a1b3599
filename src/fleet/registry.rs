use super::bus::{clamp_level, Bus, BusModel, BusStatus};
use super::route::RouteName;
use thiserror::Error;
use tracing::warn;

const RECORD_FIELDS: usize = 7;
const DEMO_SEED: u64 = 0x1234_5678_9ABC_DEF0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("bus id must not be empty")]
    EmptyId,
    #[error("bus {0} already exists")]
    DuplicateId(String),
    #[error("unknown bus {0}")]
    UnknownBus(String),
}

/// Ordered fleet collection. Ids are unique, compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct FleetRegistry {
    buses: Vec<Bus>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self { buses: Vec::new() }
    }

    /// Builds a registry, dropping empty and duplicate ids.
    pub fn from_buses(buses: impl IntoIterator<Item = Bus>) -> Self {
        let mut registry = Self::new();
        for bus in buses {
            if let Err(e) = registry.add(bus) {
                warn!("Skipping bus: {}", e);
            }
        }
        registry
    }

    pub fn add(&mut self, bus: Bus) -> Result<(), RegistryError> {
        let id = bus.id.trim();
        if id.is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if self.index_of(id).is_some() {
            return Err(RegistryError::DuplicateId(id.to_string()));
        }
        self.buses.push(bus);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Bus, RegistryError> {
        let index = self
            .index_of(id)
            .ok_or_else(|| RegistryError::UnknownBus(id.to_string()))?;
        Ok(self.buses.remove(index))
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        let id = id.trim();
        self.buses.iter().position(|b| b.id.eq_ignore_ascii_case(id))
    }

    pub fn get(&self, id: &str) -> Option<&Bus> {
        self.index_of(id).map(|i| &self.buses[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Bus> {
        self.index_of(id).map(move |i| &mut self.buses[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of(id).is_some()
    }

    pub fn buses(&self) -> &[Bus] {
        &self.buses
    }

    pub fn buses_mut(&mut self) -> &mut [Bus] {
        &mut self.buses
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bus> {
        self.buses.iter()
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    /// Rebuilds a bus from an `id;year;route;level;status;last_update_ms;model`
    /// record.
    ///
    /// Returns `None` only when the record has too few fields. Every other
    /// defect is repaired with a fixed default: `RouteName::None`,
    /// `BusStatus::Garage`, level `0`, `last_update = now_ms` and
    /// `BusModel::MbECitaro`.
    pub fn parse_record(line: &str, now_ms: u64) -> Option<Bus> {
        let parts: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(';').collect();
        if parts.len() < RECORD_FIELDS {
            return None;
        }

        let battery_level = parts[3]
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|l| l.is_finite())
            .map_or(0.0, clamp_level);

        Some(Bus {
            id: parts[0].trim().to_string(),
            model: BusModel::from_name(parts[6]).unwrap_or_default(),
            year: parts[1].trim().to_string(),
            battery_level,
            status: BusStatus::from_name(parts[4]).unwrap_or_default(),
            route: RouteName::from_name(parts[2]).unwrap_or_default(),
            last_update_ms: parts[5].trim().parse().unwrap_or(now_ms),
            status_changed_at_ms: now_ms,
            time_in_status_ms: 0,
            replacing_bus: None,
        })
    }

    pub fn from_records(text: &str, now_ms: u64) -> Self {
        let mut skipped = 0usize;
        let buses: Vec<Bus> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let bus = Self::parse_record(line, now_ms);
                if bus.is_none() {
                    skipped += 1;
                }
                bus
            })
            .collect();
        if skipped > 0 {
            warn!("Skipped {} truncated fleet records", skipped);
        }
        Self::from_buses(buses)
    }

    pub fn to_record(bus: &Bus) -> String {
        format!(
            "{};{};{};{};{};{};{}",
            bus.id,
            bus.year,
            bus.route,
            bus.battery_level,
            bus.status,
            bus.last_update_ms,
            bus.model
        )
    }

    pub fn to_records(&self) -> String {
        let mut out = String::new();
        for bus in &self.buses {
            out.push_str(&Self::to_record(bus));
            out.push('\n');
        }
        out
    }

    /// Seeds a deterministic demo fleet: the first `garage_count` buses are
    /// parked full, the rest drive the served routes at 35-100%.
    pub fn demo(count: usize, garage_count: usize, seed: Option<u64>, now_ms: u64) -> Self {
        let mut rng = DemoRng::new(seed.unwrap_or(DEMO_SEED));
        let routes = RouteName::served();
        let mut registry = Self::new();

        for i in 1..=count {
            let garaged = i <= garage_count;
            let mut bus = Bus::new(format!("BUS{:03}", i), BusModel::YutongE12)
                .with_year((2020 + (i % 4)).to_string());
            if garaged {
                bus = bus.with_status(BusStatus::Garage).with_battery_level(100.0);
            } else {
                let level = 35 + rng.next_u32() % 66;
                bus = bus
                    .with_status(BusStatus::Inroute)
                    .with_route(routes[i % routes.len()])
                    .with_battery_level(f64::from(level));
            }
            bus.last_update_ms = now_ms;
            bus.status_changed_at_ms = now_ms;
            // ids are generated unique
            let _ = registry.add(bus);
        }

        registry
    }
}

// Linear congruential generator, good enough for reproducible demo data.
struct DemoRng {
    state: u64,
}

impl DemoRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (self.state >> 16) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut registry = FleetRegistry::new();
        registry.add(Bus::new("BUS001", BusModel::BydK9)).unwrap();
        assert_eq!(
            registry.add(Bus::new("bus001", BusModel::BydK9)),
            Err(RegistryError::DuplicateId("bus001".to_string()))
        );
        assert_eq!(registry.add(Bus::new("  ", BusModel::BydK9)), Err(RegistryError::EmptyId));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_record_round_trip_keeps_fields() {
        let bus = Bus::new("BUS007", BusModel::Volvo7900E)
            .with_year("2022")
            .with_status(BusStatus::Inroute)
            .with_route(RouteName::R132)
            .with_battery_level(61.5);
        let line = FleetRegistry::to_record(&bus);
        assert_eq!(line, "BUS007;2022;R132;61.5;Inroute;0;Volvo7900E");

        let parsed = FleetRegistry::parse_record(&line, 99).unwrap();
        assert_eq!(parsed.route, RouteName::R132);
        assert_eq!(parsed.status, BusStatus::Inroute);
        assert_eq!(parsed.model, BusModel::Volvo7900E);
        assert_eq!(parsed.battery_level, 61.5);
        assert_eq!(parsed.last_update_ms, 0);
    }

    #[test]
    fn test_malformed_record_uses_defaults() {
        let bus = FleetRegistry::parse_record("BUS009;2021;R99;lots;Flying;yesterday;Tram", 5_000).unwrap();
        assert_eq!(bus.route, RouteName::None);
        assert_eq!(bus.status, BusStatus::Garage);
        assert_eq!(bus.model, BusModel::MbECitaro);
        assert_eq!(bus.battery_level, 0.0);
        assert_eq!(bus.last_update_ms, 5_000);

        let bus = FleetRegistry::parse_record("BUS010;2021;R10;NaN;Inroute;0;BYDK9", 0).unwrap();
        assert_eq!(bus.battery_level, 0.0);
        let bus = FleetRegistry::parse_record("BUS011;2021;R10;180;Inroute;0;BYDK9", 0).unwrap();
        assert_eq!(bus.battery_level, 100.0);

        assert!(FleetRegistry::parse_record("BUS012;2021;R10", 0).is_none());
    }

    #[test]
    fn test_demo_fleet_is_deterministic() {
        let a = FleetRegistry::demo(80, 30, None, 0);
        let b = FleetRegistry::demo(80, 30, None, 0);
        assert_eq!(a.len(), 80);
        assert_eq!(a.buses(), b.buses());
        assert_eq!(a.iter().filter(|bus| bus.status == BusStatus::Garage).count(), 30);
        for bus in a.iter().filter(|bus| bus.status == BusStatus::Inroute) {
            assert!((35.0..=100.0).contains(&bus.battery_level));
            assert!(!bus.route.is_none());
        }
    }
}
